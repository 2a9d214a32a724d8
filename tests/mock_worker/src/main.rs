//! Mock graph worker for integration testing
//!
//! Environment variables:
//! - GRAPHMUX_GRAPH, GRAPHMUX_APP_PORT, GRAPHMUX_WS_PORT: launch parameters (required)
//! - STARTUP_DELAY_MS: Delay before binding (default: 0)
//! - MOCK_CRASH_GRAPH: Exit with code 3 instead of starting when serving this graph

use std::env;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    let graph = env::var("GRAPHMUX_GRAPH").expect("GRAPHMUX_GRAPH environment variable required");
    let app_port: u16 = env::var("GRAPHMUX_APP_PORT")
        .expect("GRAPHMUX_APP_PORT environment variable required")
        .parse()
        .expect("GRAPHMUX_APP_PORT must be a valid port number");
    let ws_port = env::var("GRAPHMUX_WS_PORT").unwrap_or_default();

    if env::var("MOCK_CRASH_GRAPH").ok().as_deref() == Some(graph.as_str()) {
        eprintln!("Mock worker: crashing on purpose for {}", graph);
        std::process::exit(3);
    }

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);
    if startup_delay > 0 {
        eprintln!("Mock worker: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let script = format!(
        "const NC_CONFIG = {{ dataset: \"{}\", port: \"{}\", netport: \"{}\" }};\n",
        graph, app_port, ws_port
    );
    tokio::fs::write("netcreate-config.js", script)
        .await
        .expect("Failed to write runtime config");

    let listener = TcpListener::bind(format!("127.0.0.1:{}", app_port))
        .await
        .expect("Failed to bind");
    eprintln!("Mock worker: {} listening on port {}", graph, app_port);

    // Informational output first; only the marker line means ready
    println!("starting graph {}", graph);
    println!("GRAPHMUX_READY");
    let _ = std::io::stdout().flush();

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("Mock worker: accept error: {}", e);
                continue;
            }
        };

        let graph = graph.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            let n = match stream.read(&mut buf).await {
                Ok(n) if n > 0 => n,
                _ => return,
            };

            let request = String::from_utf8_lossy(&buf[..n]);
            let path = request
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or("/")
                .to_string();

            let (status, body) = match path.as_str() {
                "/error" => ("500 Internal Server Error", "error".to_string()),
                _ => ("200 OK", format!("Hello from {}: {}", graph, path)),
            };

            let response = format!(
                "HTTP/1.1 {}\r\n\
                 Content-Type: text/plain\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 X-Mock-Worker: true\r\n\
                 \r\n\
                 {}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}
