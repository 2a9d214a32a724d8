use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Password used when neither the config nor the password file sets one
pub const DEFAULT_PASSWORD: &str = "multiplex";

/// Config file picked up from the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "graphmux.toml";

/// Longest accepted login window, one week
pub const MAX_AUTH_MINUTES: u64 = 7 * 24 * 60;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, pool and access settings
    #[serde(default)]
    pub server: ServerConfig,

    /// How workers are launched
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Application port of the base worker; worker `i` gets `app_base_port + i`
    #[serde(default = "default_app_base_port")]
    pub app_base_port: u16,

    /// Companion port of the base worker; worker `i` gets `ws_base_port + i`
    #[serde(default = "default_ws_base_port")]
    pub ws_base_port: u16,

    /// Maximum number of graph workers, base worker excluded
    #[serde(default = "default_max_workers")]
    pub max_workers: u16,

    /// Refuse new workers while available memory is below this (MB)
    #[serde(default = "default_memory_floor")]
    pub memory_floor_mb: u64,

    /// Let anyone start a worker for an unknown graph
    #[serde(default)]
    pub allow_new: bool,

    /// Shared administrator password. Takes precedence over `password_file`.
    pub password: Option<String>,

    /// File whose first line is the administrator password (default: SESAME)
    #[serde(default = "default_password_file")]
    pub password_file: String,

    /// Session credential lifetime in minutes
    #[serde(default = "default_auth_minutes")]
    pub auth_minutes: u64,

    /// HTML file served at `/` in place of the built-in landing page
    #[serde(default = "default_home_page")]
    pub home_page: Option<String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a worker's response, upgrades excepted
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn auth_window(&self) -> Duration {
        Duration::from_secs(self.auth_minutes.saturating_mul(60))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The administrator password and whether it is the built-in default.
    /// Order: `password`, first line of `password_file`, default.
    pub fn resolve_password(&self) -> (String, bool) {
        if let Some(ref password) = self.password {
            if !password.is_empty() {
                return (password.clone(), false);
            }
        }

        match std::fs::read_to_string(&self.password_file) {
            Ok(content) => {
                let first = content.lines().next().unwrap_or("").trim();
                if first.is_empty() {
                    warn!(file = %self.password_file, "Password file is empty, using default password");
                    (DEFAULT_PASSWORD.to_string(), true)
                } else {
                    info!(file = %self.password_file, "Using password from file");
                    (first.to_string(), false)
                }
            }
            Err(_) => (DEFAULT_PASSWORD.to_string(), true),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            app_base_port: default_app_base_port(),
            ws_base_port: default_ws_base_port(),
            max_workers: default_max_workers(),
            memory_floor_mb: default_memory_floor(),
            allow_new: false,
            password: None,
            password_file: default_password_file(),
            auth_minutes: default_auth_minutes(),
            home_page: default_home_page(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// How to start a worker process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// proxy. Protect configuration files accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Program to run for each worker
    #[serde(default = "default_worker_command")]
    pub command: String,

    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,

    pub working_dir: Option<String>,

    /// Extra environment; launch parameters override these
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Address workers advertise to their clients
    pub bind_address: Option<String>,

    /// Analytics identifier handed to every worker
    pub analytics_id: Option<String>,

    /// Time a worker gets to signal readiness
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Directory holding saved databases (`*.loki`)
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: String,
}

impl WorkerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            working_dir: None,
            env: HashMap::new(),
            bind_address: None,
            analytics_id: None,
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            runtime_dir: default_runtime_dir(),
        }
    }
}

fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_app_base_port() -> u16 {
    3000
}

fn default_ws_base_port() -> u16 {
    4000
}

fn default_max_workers() -> u16 {
    30
}

fn default_memory_floor() -> u64 {
    256
}

fn default_password_file() -> String {
    "SESAME".to_string()
}

fn default_auth_minutes() -> u64 {
    30
}

fn default_home_page() -> Option<String> {
    Some("home.html".to_string())
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_command() -> String {
    "node".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["nc-start.js".to_string()]
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_runtime_dir() -> String {
    "runtime".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build the effective configuration: the file named on the command line,
    /// else `graphmux.toml` if present, else defaults; then environment
    /// overrides; then validation.
    pub fn from_sources(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        });

        let mut config = match path {
            Some(ref path) => Self::load(path)
                .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?,
            None => Self::default(),
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GRAPHMUX_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> anyhow::Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value for {} ({:?}): {}", name, raw, e))
        }

        if let Some(v) = lookup("GRAPHMUX_PORT") {
            self.server.port = parse("GRAPHMUX_PORT", &v)?;
        }
        if let Some(v) = lookup("GRAPHMUX_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("GRAPHMUX_APP_BASE_PORT") {
            self.server.app_base_port = parse("GRAPHMUX_APP_BASE_PORT", &v)?;
        }
        if let Some(v) = lookup("GRAPHMUX_WS_BASE_PORT") {
            self.server.ws_base_port = parse("GRAPHMUX_WS_BASE_PORT", &v)?;
        }
        if let Some(v) = lookup("GRAPHMUX_MAX_WORKERS") {
            self.server.max_workers = parse("GRAPHMUX_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("GRAPHMUX_MEMORY_FLOOR_MB") {
            self.server.memory_floor_mb = parse("GRAPHMUX_MEMORY_FLOOR_MB", &v)?;
        }
        if let Some(v) = lookup("GRAPHMUX_ALLOW_NEW") {
            self.server.allow_new = parse("GRAPHMUX_ALLOW_NEW", &v)?;
        }
        if let Some(v) = lookup("GRAPHMUX_PASSWORD") {
            self.server.password = Some(v);
        }
        if let Some(v) = lookup("GRAPHMUX_WORKER_BIND_ADDRESS") {
            self.worker.bind_address = Some(v).filter(|v| !v.is_empty());
        }
        if let Some(v) = lookup("GRAPHMUX_ANALYTICS_ID") {
            self.worker.analytics_id = Some(v).filter(|v| !v.is_empty());
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let server = &self.server;

        if server.max_workers == 0 {
            errors.push("'max_workers' must be at least 1".to_string());
        }

        if server.auth_minutes == 0 || server.auth_minutes > MAX_AUTH_MINUTES {
            errors.push(format!(
                "'auth_minutes' must be between 1 and {}, got {}",
                MAX_AUTH_MINUTES, server.auth_minutes
            ));
        }

        let app_range = port_range("app_base_port", server.app_base_port, server.max_workers);
        let ws_range = port_range("ws_base_port", server.ws_base_port, server.max_workers);

        match (&app_range, &ws_range) {
            (Ok(app), Ok(ws)) => {
                if app.start() <= ws.end() && ws.start() <= app.end() {
                    errors.push(format!(
                        "Application ports {}-{} overlap companion ports {}-{}",
                        app.start(),
                        app.end(),
                        ws.start(),
                        ws.end()
                    ));
                }
                if app.contains(&server.port) || ws.contains(&server.port) {
                    errors.push(format!(
                        "Listen port {} falls inside a worker port range",
                        server.port
                    ));
                }
            }
            _ => {
                errors.extend(app_range.as_ref().err().cloned());
                errors.extend(ws_range.as_ref().err().cloned());
            }
        }

        if self.worker.command.trim().is_empty() {
            errors.push("'worker.command' must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn port_range(field: &str, base: u16, max_workers: u16) -> Result<std::ops::RangeInclusive<u16>, String> {
    base.checked_add(max_workers)
        .map(|end| base..=end)
        .ok_or_else(|| format!("'{}' {} + max_workers {} exceeds 65535", field, base, max_workers))
}
