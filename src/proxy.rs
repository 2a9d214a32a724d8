use crate::auth::{AuthError, SessionGate};
use crate::catalog::Catalog;
use crate::error::{
    empty_body, error_redirect, error_response, full_body, redirect, ProxyBody, ProxyErrorCode,
    X_PROXY_ERROR,
};
use crate::launch::{render_runtime_config, LaunchParams};
use crate::pages;
use crate::pool::{strip_hop_by_hop, ConnectionPool};
use crate::router::{classify, rewrite_target, Route};
use crate::supervisor::{DispatchError, Supervisor, TerminateError};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, SET_COOKIE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest login form body accepted
const MAX_FORM_BYTES: usize = 4096;

/// Largest upgrade response head accepted from a worker
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Everything request handling needs, shared by all connections
pub struct ProxyContext {
    pub supervisor: Supervisor,
    pub gate: SessionGate,
    pub catalog: Arc<dyn Catalog>,
    pub pool: ConnectionPool,
    /// HTML file served at `/` when readable
    pub home_page: Option<PathBuf>,
    pub request_timeout: Duration,
    pub bind_address: Option<String>,
    pub analytics_id: Option<String>,
}

/// The public multiplexing proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, context: ProxyContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            context: Arc::new(context),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 connections can still carry upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let route = classify(req.uri().path());
    debug!(method = %req.method(), uri = %req.uri(), request_id, ?route, "Incoming request");

    let response = match route {
        Route::Home => serve_home(&context).await,
        Route::Login => {
            if context.gate.is_authorized(req.headers()) {
                redirect("/manage")
            } else {
                pages::html_response(StatusCode::OK, pages::login_page())
            }
        }
        Route::Authorize => authorize(req, &context).await,
        Route::Logout => {
            let mut response = redirect("/");
            if let Ok(cookie) = HeaderValue::from_str(&context.gate.create_logout_cookie()) {
                response.headers_mut().insert(SET_COOKIE, cookie);
            }
            response
        }
        Route::Manage => manage(req.headers(), &context).await,
        Route::ErrorPage(code) => error_response(code, code.default_message(), req.headers()),
        Route::Kill { graph } => kill(req.headers(), &context, &graph).await,
        Route::RuntimeConfig { graph } => runtime_config(&context, &graph).await,
        Route::Graph { graph, rest } => dispatch(req, &context, &graph, &rest, &request_id).await,
        Route::MissingSlash { graph } => error_response(
            ProxyErrorCode::MalformedRequest,
            &format!("Graph URLs need a trailing slash: /graph/{}/", graph),
            req.headers(),
        ),
        Route::InvalidName { name } => {
            debug!(name, "Rejected graph name");
            error_response(
                ProxyErrorCode::InvalidGraphName,
                ProxyErrorCode::InvalidGraphName.default_message(),
                req.headers(),
            )
        }
        Route::Fallback => fallback(req, &context, &request_id).await,
    };

    Ok(response)
}

async fn serve_home(context: &ProxyContext) -> Response<ProxyBody> {
    if let Some(ref path) = context.home_page {
        match tokio::fs::read_to_string(path).await {
            Ok(html) => return pages::html_response(StatusCode::OK, html),
            Err(e) => debug!(path = %path.display(), error = %e, "Home page not readable, using built-in page"),
        }
    }
    pages::html_response(StatusCode::OK, pages::landing_page())
}

/// Pull `password` out of a urlencoded form body
fn form_password(body: &[u8]) -> Option<String> {
    let body = std::str::from_utf8(body).ok()?;
    body.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != "password" {
            return None;
        }
        urlencoding::decode(&value.replace('+', " "))
            .ok()
            .map(|v| v.into_owned())
    })
}

async fn authorize(req: Request<Incoming>, context: &ProxyContext) -> Response<ProxyBody> {
    if req.method() != Method::POST {
        return redirect("/login");
    }
    let headers = req.headers().clone();

    let body = match Limited::new(req.into_body(), MAX_FORM_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read login form");
            return error_response(ProxyErrorCode::MalformedRequest, "Unreadable login form", &headers);
        }
    };
    let candidate = form_password(&body).unwrap_or_default();

    match context.gate.authorize(&candidate) {
        Ok(token) => {
            info!("Administrator logged in");
            let mut response = redirect("/manage");
            match HeaderValue::from_str(&context.gate.create_session_cookie(&token)) {
                Ok(cookie) => {
                    response.headers_mut().insert(SET_COOKIE, cookie);
                    response
                }
                Err(e) => {
                    error!(error = %e, "Session cookie is not a valid header value");
                    error_response(ProxyErrorCode::InternalError, "Failed to issue session", &headers)
                }
            }
        }
        Err(AuthError::Rejected) => error_redirect(ProxyErrorCode::NotAuthorized, &headers),
        Err(e) => {
            error!(error = %e, "Failed to issue session credential");
            error_response(ProxyErrorCode::InternalError, "Failed to issue session", &headers)
        }
    }
}

async fn manage(headers: &HeaderMap, context: &ProxyContext) -> Response<ProxyBody> {
    if !context.gate.is_authorized(headers) {
        return redirect("/login");
    }
    let Some(status) = context.supervisor.status().await else {
        return error_response(ProxyErrorCode::InternalError, "Supervisor is not running", headers);
    };
    let saved = context.catalog.list();
    pages::html_response(StatusCode::OK, pages::manage_page(&status, &saved))
}

async fn kill(headers: &HeaderMap, context: &ProxyContext, graph: &str) -> Response<ProxyBody> {
    if !context.gate.is_authorized(headers) {
        return error_redirect(ProxyErrorCode::NotAuthorized, headers);
    }

    match context.supervisor.terminate(graph).await {
        Ok(worker) => pages::html_response(StatusCode::OK, pages::killed_page(&worker)),
        Err(e @ (TerminateError::NotFound(_) | TerminateError::Starting(_))) => {
            debug!(graph, error = %e, "Kill request for non-running graph");
            error_response(ProxyErrorCode::UnknownKillTarget, &e.to_string(), headers)
        }
        Err(e) => {
            error!(graph, error = %e, "Kill request failed");
            error_response(ProxyErrorCode::InternalError, "Failed to stop graph", headers)
        }
    }
}

async fn runtime_config(context: &ProxyContext, graph: &str) -> Response<ProxyBody> {
    let (status, body, error_code) = match context.supervisor.lookup(graph).await {
        Some(worker) => {
            let params = LaunchParams {
                graph: worker.name,
                app_port: worker.app_port,
                ws_port: worker.ws_port,
                bind_address: context.bind_address.clone(),
                analytics_id: context.analytics_id.clone(),
            };
            (StatusCode::OK, render_runtime_config(&params), None)
        }
        None => (
            ProxyErrorCode::NoDatabase.status_code(),
            format!("// no running graph named {}\n", graph),
            Some(ProxyErrorCode::NoDatabase),
        ),
    };

    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/javascript");
    if let Some(code) = error_code {
        response = response.header(X_PROXY_ERROR, code.as_header_value());
    }
    response
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

async fn dispatch(
    req: Request<Incoming>,
    context: &ProxyContext,
    graph: &str,
    rest: &str,
    request_id: &str,
) -> Response<ProxyBody> {
    let authorized = context.gate.is_authorized(req.headers());

    let worker = match context.supervisor.resolve(graph, authorized).await {
        Ok(worker) => worker,
        Err(e) => {
            let code = match e {
                DispatchError::OutOfPorts => ProxyErrorCode::OutOfPorts,
                DispatchError::OutOfMemory => ProxyErrorCode::OutOfMemory,
                DispatchError::NotAuthorized => ProxyErrorCode::NotAuthorized,
                DispatchError::SpawnFailed(ref cause) => {
                    error!(graph, request_id, error = %cause, "Failed to start graph");
                    ProxyErrorCode::SpawnFailed
                }
            };
            return error_redirect(code, req.headers());
        }
    };

    let target = rewrite_target(rest, req.uri().query());
    forward(req, context, graph, worker.app_port, &target, request_id).await
}

async fn fallback(req: Request<Incoming>, context: &ProxyContext, request_id: &str) -> Response<ProxyBody> {
    let Some(base) = context.supervisor.base().await else {
        warn!(request_id, uri = %req.uri(), "No base worker for fallback route");
        return error_response(ProxyErrorCode::ConnectionFailed, "Base worker is not running", req.headers());
    };

    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    forward(req, context, &base.name, base.app_port, &target, request_id).await
}

async fn forward(
    req: Request<Incoming>,
    context: &ProxyContext,
    graph: &str,
    port: u16,
    target: &str,
    request_id: &str,
) -> Response<ProxyBody> {
    if is_upgrade_request(&req) {
        return handle_upgrade(req, graph, port, target, request_id).await;
    }

    let headers = req.headers().clone();
    let request_timeout = context.request_timeout;
    let result = tokio::time::timeout(request_timeout, context.pool.send_request(req, port, target)).await;

    match result {
        Ok(Ok(mut response)) => {
            strip_hop_by_hop(response.headers_mut());
            response
        }
        Ok(Err(e)) => {
            error!(graph, port, error = %e, "Failed to forward request via pool");
            error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to graph", &headers)
        }
        Err(_) => {
            warn!(graph, port, timeout_secs = request_timeout.as_secs(), "Request timed out");
            error_response(
                ProxyErrorCode::RequestTimeout,
                &format!("Request timed out after {} seconds", request_timeout.as_secs()),
                &headers,
            )
        }
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Forward bytes bidirectionally between client and worker connections.
/// `early` holds bytes the worker sent right after its upgrade response.
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    early: Vec<u8>,
    graph: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(graph, request_id, error = %e, "Client went away before early worker data");
            return;
        }
        trace!(graph, request_id, bytes = early.len(), "Relayed early worker data");
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(graph, request_id, client_to_backend, backend_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(graph, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Raw HTTP/1.1 upgrade request for the worker, on the rewritten target
fn build_upgrade_request<B>(req: &Request<B>, port: u16, target: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), target);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n\r\n", port));
    request.into_bytes()
}

#[derive(Debug, Error)]
enum UpgradeHeadError {
    #[error("worker closed the connection before finishing its response")]
    Closed,
    #[error("upgrade response head is too large")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read the worker's upgrade response up to the blank line. Returns the
/// head and whatever followed it in the same reads.
async fn read_upgrade_head<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<(Vec<u8>, Vec<u8>), UpgradeHeadError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut scanned: usize = 0;

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(UpgradeHeadError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        // Resume a few bytes back in case the terminator straddles two reads
        let from = scanned.saturating_sub(3);
        if let Some(pos) = buf[from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(from + pos + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(UpgradeHeadError::TooLarge);
        }
        scanned = buf.len();
    }
}

/// Parse the status line and headers of the worker's upgrade response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    graph: &str,
    port: u16,
    target: &str,
    request_id: &str,
) -> Response<ProxyBody> {
    let headers = req.headers().clone();
    debug!(graph, request_id, target, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port, target);

    let mut backend_stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(graph, port, error = %e, "Failed to connect to worker for upgrade");
            return error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to graph", &headers);
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(graph, error = %e, "Failed to send upgrade request to worker");
        return error_response(ProxyErrorCode::ConnectionFailed, "Failed to send upgrade request", &headers);
    }

    let (head, early) = match read_upgrade_head(&mut backend_stream).await {
        Ok(parts) => parts,
        Err(UpgradeHeadError::Closed) => {
            error!(graph, "Worker closed connection before responding to upgrade");
            return error_response(ProxyErrorCode::ConnectionFailed, "Graph closed connection", &headers);
        }
        Err(e) => {
            error!(graph, error = %e, "Failed to read upgrade response from worker");
            return error_response(ProxyErrorCode::ConnectionFailed, "Failed to read graph response", &headers);
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(graph, "Failed to parse worker upgrade response");
        return error_response(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from graph", &headers);
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = match response.body(empty_body()) {
        Ok(response) => response,
        Err(e) => {
            error!(graph, error = %e, "Worker sent an invalid upgrade response header");
            return error_response(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from graph", &headers);
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(graph, status = %status, "Worker rejected upgrade request");
        return response;
    }

    info!(graph, request_id, "Upgrade successful");

    let graph = graph.to_string();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, early, &graph, &request_id).await;
            }
            Err(e) => {
                error!(graph, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}
