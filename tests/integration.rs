//! End-to-end tests: a real proxy listener and supervisor, with workers
//! served in-process on their assigned application ports.
//!
//! The `mock_worker` tests additionally run a real child process and are
//! skipped unless it has been built:
//! `cargo build --release --manifest-path tests/mock_worker/Cargo.toml`

use graphmux::admission::{Admission, MemorySource};
use graphmux::auth::{AuthConfig, SessionGate};
use graphmux::catalog::DirectoryCatalog;
use graphmux::config::WorkerConfig;
use graphmux::pool::{ConnectionPool, PoolConfig};
use graphmux::ports::PortPool;
use graphmux::process::{
    LaunchSpec, Launcher, ProcessLauncher, SharedLauncher, SpawnError, WorkerHandle, WorkerProcess,
};
use graphmux::proxy::{ProxyContext, ProxyServer};
use graphmux::supervisor::{Supervisor, SupervisorSettings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

const PASSWORD: &str = "sesame";

struct PlentyOfMemory;

impl MemorySource for PlentyOfMemory {
    fn available_mb(&self) -> u64 {
        8192
    }
}

/// Serves each worker from a task in this process. Every response names the
/// graph and the path the worker saw.
#[derive(Default)]
struct InProcessLauncher {
    launches: AtomicUsize,
    startup_delay: Duration,
}

impl InProcessLauncher {
    fn with_delay(startup_delay: Duration) -> Self {
        Self {
            launches: AtomicUsize::new(0),
            startup_delay,
        }
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for InProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<WorkerProcess, SpawnError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (handle, mut stop_rx) = WorkerHandle::channel(None);
        let graph = spec.graph.clone();
        let port = spec.slot.app_port;
        let delay = self.startup_delay;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let listener = match bind_with_retry(port).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = ready_tx.send(Err(SpawnError::Launch(e.to_string())));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    accepted = listener.accept() => {
                        if let Ok((stream, _)) = accepted {
                            tokio::spawn(serve_worker_request(stream, graph.clone()));
                        }
                    }
                }
            }
            drop(listener);
            let _ = exit_tx.send(Some(0));
        });

        Ok(WorkerProcess {
            pid: None,
            ready: ready_rx,
            exited: exit_rx,
            handle: handle.with_task(task),
        })
    }
}

/// A stopped worker's port may take a moment to become bindable again
async fn bind_with_retry(port: u16) -> std::io::Result<TcpListener> {
    let mut attempts = 0;
    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempts >= 40 => return Err(e),
            Err(_) => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_worker_request(mut stream: TcpStream, graph: String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if buf.len() > 16 * 1024 {
            return;
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let wants_upgrade = head
        .lines()
        .any(|line| line.to_ascii_lowercase().starts_with("upgrade:"));
    if wants_upgrade {
        let mut response = "HTTP/1.1 101 Switching Protocols\r\n\
                            Upgrade: echo\r\n\
                            Connection: Upgrade\r\n\
                            \r\n"
            .to_string();
        // Greeting workers speak first, in the same write as the handshake
        if target.starts_with("/greet") {
            response.push_str("HELLO");
        }
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        // Echo raw bytes until the client goes away
        let mut echo = [0u8; 1024];
        loop {
            match stream.read(&mut echo).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&echo[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    let body = format!("graph={} path={}", graph, target);
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

struct Harness {
    addr: SocketAddr,
    supervisor: Supervisor,
    launches: Box<dyn Fn() -> usize + Send + Sync>,
    shutdown_tx: watch::Sender<bool>,
    _catalog_dir: tempfile::TempDir,
}

impl Harness {
    async fn start(app_base: u16, max_workers: u16, allow_new: bool) -> Self {
        Self::with_launcher(
            app_base,
            max_workers,
            allow_new,
            Arc::new(InProcessLauncher::default()),
        )
        .await
    }

    async fn with_launcher(
        app_base: u16,
        max_workers: u16,
        allow_new: bool,
        launcher: Arc<InProcessLauncher>,
    ) -> Self {
        let counter = Arc::clone(&launcher);
        Self::with_shared_launcher(
            app_base,
            max_workers,
            allow_new,
            launcher,
            Box::new(move || counter.launches()),
        )
        .await
    }

    async fn with_shared_launcher(
        app_base: u16,
        max_workers: u16,
        allow_new: bool,
        launcher: SharedLauncher,
        launches: Box<dyn Fn() -> usize + Send + Sync>,
    ) -> Self {
        let catalog_dir = tempfile::tempdir().unwrap();
        std::fs::write(catalog_dir.path().join("rome.loki"), "{}").unwrap();
        std::fs::write(catalog_dir.path().join("tokyo.loki"), "{}").unwrap();

        let supervisor = Supervisor::start(
            PortPool::new(app_base, app_base + 500, max_workers),
            Admission::new(64, allow_new, Arc::new(PlentyOfMemory)),
            launcher,
            SupervisorSettings {
                startup_timeout: Duration::from_secs(5),
                bind_address: None,
                analytics_id: None,
            },
        );
        supervisor.spawn_base().await.unwrap();

        let context = ProxyContext {
            supervisor: supervisor.clone(),
            gate: SessionGate::new(AuthConfig::new(PASSWORD, Duration::from_secs(30 * 60))),
            catalog: Arc::new(DirectoryCatalog::new(catalog_dir.path())),
            pool: ConnectionPool::new(PoolConfig::default()),
            home_page: None,
            request_timeout: Duration::from_secs(5),
            bind_address: None,
            analytics_id: None,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::new(addr, context, shutdown_rx);
        tokio::spawn(server.serve(listener));

        Self {
            addr,
            supervisor,
            launches,
            shutdown_tx,
            _catalog_dir: catalog_dir,
        }
    }

    fn launches(&self) -> usize {
        (self.launches)()
    }

    async fn get(&self, path: &str) -> String {
        http_get(self.addr, path, None).await.unwrap()
    }

    async fn get_with_cookie(&self, path: &str, cookie: &str) -> String {
        http_get(self.addr, path, Some(cookie)).await.unwrap()
    }

    /// Log in and return the session cookie, if one was issued
    async fn login(&self, password: &str) -> (String, Option<String>) {
        let body = format!("password={}", password);
        let request = format!(
            "POST /authorize HTTP/1.1\r\n\
             Host: localhost\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            body.len(),
            body
        );
        let response = http_request(self.addr, &request).await.unwrap();
        let cookie = header_value(&response, "set-cookie")
            .and_then(|v| v.split(';').next().map(str::to_string))
            .filter(|c| !c.ends_with('='));
        (response, cookie)
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.supervisor.shutdown().await;
    }
}

async fn http_request(addr: SocketAddr, request: &str) -> Result<String, std::io::Error> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "response timed out"))??;
    Ok(response)
}

async fn http_get(addr: SocketAddr, path: &str, cookie: Option<&str>) -> Result<String, std::io::Error> {
    let cookie = cookie
        .map(|c| format!("Cookie: {}\r\n", c))
        .unwrap_or_default();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\n{}Connection: close\r\n\r\n",
        path, cookie
    );
    http_request(addr, &request).await
}

fn status_of(response: &str) -> u16 {
    response
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn header_value(response: &str, name: &str) -> Option<String> {
    response
        .lines()
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim().to_string())
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

// ============================================================================
// Routing and worker lifecycle
// ============================================================================

#[tokio::test]
async fn test_graph_lifecycle_end_to_end() {
    let harness = Harness::start(23100, 3, true).await;

    let base = harness.supervisor.base().await.unwrap();
    assert_eq!(base.index, 0);
    assert_eq!(base.app_port, 23100);
    assert_eq!(harness.launches(), 1);

    let response = harness.get("/graph/rome/").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(body_of(&response), "graph=rome path=/");

    let response = harness.get("/graph/rome/script.js?v=2").await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "graph=rome path=/script.js?v=2");
    assert_eq!(harness.launches(), 2, "second request must reuse the worker");

    let first = harness.supervisor.lookup("rome").await.unwrap();
    assert_eq!(first.index, 1);
    assert_eq!(first.app_port, 23101);
    assert_eq!(first.ws_port, 23601);

    // Non-graph paths go to the base worker unchanged
    let response = harness.get("/scripts/app.js").await;
    assert_eq!(body_of(&response), "graph=base path=/scripts/app.js");

    let (_, cookie) = harness.login(PASSWORD).await;
    let cookie = cookie.expect("login should issue a session cookie");

    let response = harness.get_with_cookie("/kill/rome/", &cookie).await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(body_of(&response).contains("Stopped rome"));
    assert!(harness.supervisor.lookup("rome").await.is_none());

    let status = harness.supervisor.status().await.unwrap();
    assert_eq!(status.free_slots, 3);

    // The freed index is reused with a new generation
    let response = harness.get("/graph/rome/").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    let second = harness.supervisor.lookup("rome").await.unwrap();
    assert_eq!(second.index, 1);
    assert_ne!(second.generation, first.generation);
    assert_eq!(harness.launches(), 3);

    harness.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_share_one_spawn() {
    let launcher = Arc::new(InProcessLauncher::with_delay(Duration::from_millis(300)));
    let harness = Harness::with_launcher(23200, 3, true, launcher).await;
    let addr = harness.addr;

    let requests: Vec<_> = (0..8)
        .map(|_| tokio::spawn(async move { http_get(addr, "/graph/paris/", None).await }))
        .collect();

    for request in requests {
        let response = request.await.unwrap().unwrap();
        assert_eq!(status_of(&response), 200, "{}", response);
        assert_eq!(body_of(&response), "graph=paris path=/");
    }

    // Base plus exactly one paris worker
    assert_eq!(harness.launches(), 2);
    let status = harness.supervisor.status().await.unwrap();
    assert_eq!(status.free_slots, 2);
    assert!(status.starting.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_missing_trailing_slash_is_rejected() {
    let harness = Harness::start(23300, 3, true).await;

    let response = harness.get("/graph/atlantis").await;
    assert_eq!(status_of(&response), 400);
    assert_eq!(
        header_value(&response, "x-proxy-error").as_deref(),
        Some("MALFORMED_REQUEST")
    );
    assert_eq!(harness.launches(), 1, "no worker may be started");

    let response = harness.get("/graph/ro-me/").await;
    assert_eq!(status_of(&response), 400);
    assert_eq!(
        header_value(&response, "x-proxy-error").as_deref(),
        Some("INVALID_GRAPH_NAME")
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_new_graph_requires_login() {
    let harness = Harness::start(23400, 3, false).await;

    let response = harness.get("/graph/atlantis/").await;
    assert_eq!(status_of(&response), 302);
    assert_eq!(
        header_value(&response, "location").as_deref(),
        Some("/error_not_authorized")
    );
    assert_eq!(
        header_value(&response, "x-proxy-error").as_deref(),
        Some("NOT_AUTHORIZED")
    );
    assert_eq!(harness.launches(), 1);

    // The error page itself is served by the proxy
    let response = harness.get("/error_not_authorized").await;
    assert_eq!(status_of(&response), 403);

    let (_, cookie) = harness.login(PASSWORD).await;
    let cookie = cookie.unwrap();
    let response = harness.get_with_cookie("/graph/atlantis/", &cookie).await;
    assert_eq!(status_of(&response), 200, "{}", response);

    // Running graphs are open to everyone
    let response = harness.get("/graph/atlantis/index.html").await;
    assert_eq!(body_of(&response), "graph=atlantis path=/index.html");

    harness.stop().await;
}

#[tokio::test]
async fn test_out_of_ports() {
    let harness = Harness::start(23500, 2, true).await;

    assert_eq!(status_of(&harness.get("/graph/rome/").await), 200);
    assert_eq!(status_of(&harness.get("/graph/paris/").await), 200);

    let response = harness.get("/graph/tokyo/").await;
    assert_eq!(status_of(&response), 302);
    assert_eq!(
        header_value(&response, "location").as_deref(),
        Some("/error_out_of_ports")
    );

    let request = "GET /graph/tokyo/ HTTP/1.1\r\nHost: localhost\r\n\
                   Accept: application/json\r\nConnection: close\r\n\r\n";
    let response = http_request(harness.addr, request).await.unwrap();
    assert_eq!(status_of(&response), 503);
    assert!(body_of(&response).contains("OUT_OF_PORTS"));

    // Running graphs are unaffected
    let response = harness.get("/graph/rome/").await;
    assert_eq!(body_of(&response), "graph=rome path=/");
    assert_eq!(harness.launches(), 3);

    harness.stop().await;
}

#[tokio::test]
async fn test_base_worker_cannot_be_killed() {
    let harness = Harness::start(23600, 3, true).await;

    let response = harness.get("/kill/base/").await;
    assert_eq!(status_of(&response), 302, "kill requires a session");

    let (_, cookie) = harness.login(PASSWORD).await;
    let cookie = cookie.unwrap();

    let response = harness.get_with_cookie("/kill/base/", &cookie).await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(
        header_value(&response, "x-proxy-error").as_deref(),
        Some("UNKNOWN_KILL_TARGET")
    );

    let response = harness.get_with_cookie("/kill/nowhere/", &cookie).await;
    assert_eq!(status_of(&response), 404);

    assert!(harness.supervisor.base().await.is_some());
    let response = harness.get("/index.html").await;
    assert_eq!(body_of(&response), "graph=base path=/index.html");

    harness.stop().await;
}

#[tokio::test]
async fn test_upgrade_is_tunnelled_to_the_graph_worker() {
    let harness = Harness::start(24300, 3, true).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let request = "GET /graph/rome/socket HTTP/1.1\r\n\
                   Host: localhost\r\n\
                   Connection: Upgrade\r\n\
                   Upgrade: echo\r\n\
                   \r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "proxy closed the connection during the handshake");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert_eq!(status_of(&head), 101, "{}", head);

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");

    assert!(harness.supervisor.lookup("rome").await.is_some());
    drop(stream);
    harness.stop().await;
}

#[tokio::test]
async fn test_upgrade_relays_data_sent_with_the_handshake() {
    let harness = Harness::start(24400, 3, true).await;

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let request = "GET /graph/rome/greet HTTP/1.1\r\n\
                   Host: localhost\r\n\
                   Connection: Upgrade\r\n\
                   Upgrade: echo\r\n\
                   \r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "proxy closed the connection during the handshake");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert_eq!(status_of(&head), 101, "{}", head);

    let mut greeting = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut greeting))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&greeting, b"HELLO");

    // The tunnel still carries traffic both ways afterwards
    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");

    drop(stream);
    harness.stop().await;
}

// ============================================================================
// Sessions and management
// ============================================================================

#[tokio::test]
async fn test_wrong_password_issues_no_session() {
    let harness = Harness::start(23700, 3, true).await;

    let (response, cookie) = harness.login("wrong").await;
    assert!(cookie.is_none(), "{}", response);
    assert_eq!(status_of(&response), 302);
    assert_eq!(
        header_value(&response, "location").as_deref(),
        Some("/error_not_authorized")
    );

    let response = harness.get("/manage").await;
    assert_eq!(status_of(&response), 302);
    assert_eq!(header_value(&response, "location").as_deref(), Some("/login"));

    let response = harness.get_with_cookie("/manage", "graphmux_session=forged").await;
    assert_eq!(status_of(&response), 302);

    harness.stop().await;
}

#[tokio::test]
async fn test_manage_page_lists_graphs() {
    let harness = Harness::start(23800, 3, true).await;

    let (response, cookie) = harness.login(PASSWORD).await;
    assert_eq!(header_value(&response, "location").as_deref(), Some("/manage"));
    let cookie = cookie.unwrap();

    assert_eq!(status_of(&harness.get("/graph/rome/").await), 200);

    let response = harness.get_with_cookie("/manage", &cookie).await;
    assert_eq!(status_of(&response), 200, "{}", response);
    let html = body_of(&response);
    assert!(html.contains("/kill/rome/"));
    assert!(!html.contains("/kill/base/"));
    assert!(html.contains("tokyo"), "saved graphs come from the catalog");

    // Logged in users skip the login form
    let response = harness.get_with_cookie("/login", &cookie).await;
    assert_eq!(status_of(&response), 302);

    let response = harness.get_with_cookie("/logout", &cookie).await;
    assert_eq!(status_of(&response), 302);
    assert!(header_value(&response, "set-cookie")
        .unwrap()
        .contains("Max-Age=0"));

    harness.stop().await;
}

#[tokio::test]
async fn test_runtime_config_script() {
    let harness = Harness::start(23900, 3, true).await;

    let response = harness.get("/graph/tokyo/netcreate-config.js").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(
        header_value(&response, "x-proxy-error").as_deref(),
        Some("NO_DATABASE")
    );
    assert_eq!(harness.launches(), 1, "config requests never start workers");

    assert_eq!(status_of(&harness.get("/graph/tokyo/").await), 200);

    let response = harness.get("/graph/tokyo/netcreate-config.js").await;
    assert_eq!(status_of(&response), 200);
    let script = body_of(&response);
    assert!(script.contains("dataset: \"tokyo\""));
    assert!(script.contains("port: \"23901\""));
    assert!(script.contains("netport: \"24401\""));

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_workers() {
    let harness = Harness::start(24000, 3, true).await;

    assert_eq!(status_of(&harness.get("/graph/rome/").await), 200);
    let supervisor = harness.supervisor.clone();
    harness.stop().await;

    let status = supervisor.status().await.unwrap();
    assert!(status.workers.is_empty());

    // Worker listeners are closed once their tasks finish
    assert!(TcpStream::connect(("127.0.0.1", 24001)).await.is_err());
    assert!(TcpStream::connect(("127.0.0.1", 24000)).await.is_err());
}

// ============================================================================
// Child process workers
// ============================================================================

fn mock_worker_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("mock_worker")
        .join("target")
        .join("release")
        .join("mock-worker")
}

fn mock_worker_config(working_dir: &std::path::Path) -> WorkerConfig {
    WorkerConfig {
        command: mock_worker_path().to_string_lossy().into_owned(),
        args: vec![],
        working_dir: Some(working_dir.to_string_lossy().into_owned()),
        env: Default::default(),
        bind_address: None,
        analytics_id: None,
        startup_timeout_secs: 5,
        shutdown_grace_period_secs: 2,
        runtime_dir: working_dir.to_string_lossy().into_owned(),
    }
}

#[tokio::test]
async fn test_mock_worker_process_lifecycle() {
    if !mock_worker_path().exists() {
        eprintln!("Skipping test: mock worker not built");
        return;
    }

    let work_dir = tempfile::tempdir().unwrap();
    let launcher: SharedLauncher = Arc::new(ProcessLauncher::new(mock_worker_config(work_dir.path())));
    let harness = Harness::with_shared_launcher(24100, 2, true, launcher, Box::new(|| 0)).await;

    let response = harness.get("/graph/rome/hello").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(body_of(&response).contains("rome"));

    // The worker wrote its runtime configuration before signalling readiness
    let script = std::fs::read_to_string(work_dir.path().join("netcreate-config.js")).unwrap();
    assert!(script.contains("24101"));

    let rome = harness.supervisor.lookup("rome").await.unwrap();
    assert!(rome.pid.is_some());

    let (_, cookie) = harness.login(PASSWORD).await;
    let response = harness.get_with_cookie("/kill/rome/", &cookie.unwrap()).await;
    assert_eq!(status_of(&response), 200);

    harness.stop().await;
    assert!(TcpStream::connect(("127.0.0.1", 24101)).await.is_err());
}

#[tokio::test]
async fn test_mock_worker_crash_before_ready() {
    if !mock_worker_path().exists() {
        eprintln!("Skipping test: mock worker not built");
        return;
    }

    let work_dir = tempfile::tempdir().unwrap();
    let mut config = mock_worker_config(work_dir.path());
    config.env.insert("MOCK_CRASH_GRAPH".to_string(), "doomed".to_string());
    let launcher: SharedLauncher = Arc::new(ProcessLauncher::new(config));
    let harness = Harness::with_shared_launcher(24200, 2, true, launcher, Box::new(|| 0)).await;

    let response = harness.get("/graph/doomed/").await;
    assert_eq!(status_of(&response), 502, "{}", response);
    assert_eq!(
        header_value(&response, "x-proxy-error").as_deref(),
        Some("SPAWN_FAILED")
    );

    // The slot came back for the next graph
    let status = harness.supervisor.status().await.unwrap();
    assert_eq!(status.free_slots, 2);
    assert_eq!(status_of(&harness.get("/graph/rome/").await), 200);

    harness.stop().await;
}
