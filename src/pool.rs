//! Keep-alive client shared by all forwards to workers
//!
//! Workers only ever listen on loopback, so the pool dials `127.0.0.1` and
//! keys idle connections by application port.

use crate::error::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Headers that describe one hop and must not be passed to the worker
const HOP_BY_HOP: [&str; 7] = [
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("could not build worker request: {0}")]
    RequestBuild(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle keep-alive connections kept per worker port
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
    forwarded: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.enforce_http(true);
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build(connector);

        debug!(
            max_idle_per_worker = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Worker connection pool ready"
        );

        Self {
            client,
            config,
            forwarded: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Requests handed to workers since startup
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Send `req` to the worker listening on `port`. `target` replaces the
    /// client's path and query, so graph prefixes are already stripped.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
        target: &str,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let (parts, body) = req.into_parts();

        let mut worker_req = Request::builder()
            .method(parts.method)
            .uri(format!("http://127.0.0.1:{}{}", port, target))
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        *worker_req.headers_mut() = worker_headers(&parts.headers, port);

        trace!(port, target, "Forwarding to worker");
        self.forwarded.fetch_add(1, Ordering::Relaxed);

        let (parts, body) = self.client.request(worker_req).await?.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Client headers as the worker should see them: hop-by-hop headers
/// dropped, including any named by `Connection`, and `Host` pointing at the
/// worker itself.
pub fn worker_headers(client: &HeaderMap, port: u16) -> HeaderMap {
    let named_by_connection: Vec<String> = client
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut headers = HeaderMap::with_capacity(client.len());
    for (name, value) in client {
        let lower = name.as_str();
        if name == CONNECTION
            || name == HOST
            || HOP_BY_HOP.contains(&lower)
            || named_by_connection.iter().any(|n| n == lower)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(host) = HeaderValue::from_str(&format!("127.0.0.1:{}", port)) {
        headers.insert(HOST, host);
    }
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == CONNECTION || HOP_BY_HOP.contains(&name.as_str())
}

/// Remove hop-by-hop headers from a worker response before it is relayed
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop: Vec<HeaderName> = headers.keys().filter(|n| is_hop_by_hop(n)).cloned().collect();
    for name in hop {
        headers.remove(&name);
    }
}
