use graphmux::admission::{Admission, SystemMemory};
use graphmux::auth::{AuthConfig, SessionGate};
use graphmux::catalog::DirectoryCatalog;
use graphmux::config::Config;
use graphmux::pool::{ConnectionPool, PoolConfig};
use graphmux::ports::PortPool;
use graphmux::process::ProcessLauncher;
use graphmux::proxy::{ProxyContext, ProxyServer};
use graphmux::supervisor::{Supervisor, SupervisorSettings};
use graphmux::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("graphmux=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::from_sources(config_path).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let (password, default_password) = config.server.resolve_password();
    print_startup_banner(&config, default_password);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::start(
        PortPool::new(
            config.server.app_base_port,
            config.server.ws_base_port,
            config.server.max_workers,
        ),
        Admission::new(
            config.server.memory_floor_mb,
            config.server.allow_new,
            Arc::new(SystemMemory),
        ),
        Arc::new(ProcessLauncher::new(config.worker.clone())),
        SupervisorSettings {
            startup_timeout: config.worker.startup_timeout(),
            bind_address: config.worker.bind_address.clone(),
            analytics_id: config.worker.analytics_id.clone(),
        },
    );

    // Without the base worker there is nothing to serve shared assets
    let base = match supervisor.spawn_base().await {
        Ok(base) => base,
        Err(e) => {
            error!(error = %e, "Base worker failed to start");
            supervisor.shutdown().await;
            anyhow::bail!("Base worker failed to start: {}", e);
        }
    };
    info!(app_port = base.app_port, ws_port = base.ws_port, pid = ?base.pid, "Base worker ready");

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let context = ProxyContext {
        supervisor: supervisor.clone(),
        gate: SessionGate::new(AuthConfig::new(password, config.server.auth_window())),
        catalog: Arc::new(DirectoryCatalog::new(&config.worker.runtime_dir)),
        pool: ConnectionPool::new(pool_config),
        home_page: config.server.home_page.as_ref().map(PathBuf::from),
        request_timeout: config.server.request_timeout(),
        bind_address: config.worker.bind_address.clone(),
        analytics_id: config.worker.analytics_id.clone(),
    };

    let proxy = ProxyServer::new(bind_addr, context, shutdown_rx);
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    info!("Stopping all workers...");
    supervisor.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the proxy");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config, default_password: bool) {
    info!(name = PKG_NAME, version = VERSION, "Starting graph multiplexer");

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        app_ports = %format!("{}-{}", config.server.app_base_port, config.server.app_base_port + config.server.max_workers),
        ws_ports = %format!("{}-{}", config.server.ws_base_port, config.server.ws_base_port + config.server.max_workers),
        max_workers = config.server.max_workers,
        memory_floor_mb = config.server.memory_floor_mb,
        allow_new = config.server.allow_new,
        "Worker limits"
    );
    info!(
        command = %config.worker.command,
        args = ?config.worker.args,
        startup_timeout_secs = config.worker.startup_timeout_secs,
        shutdown_grace_period_secs = config.worker.shutdown_grace_period_secs,
        runtime_dir = %config.worker.runtime_dir,
        "Worker launch"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );

    if default_password {
        warn!(
            password_file = %config.server.password_file,
            "Using the built-in default password; set server.password or create the password file"
        );
    }
}
