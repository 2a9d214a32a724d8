//! Worker launch contract
//!
//! A worker is started with its launch parameters in the environment. It
//! writes its own runtime configuration script, binds its listener on the
//! application port and then prints [`READY_MARKER`] on a line of its own to
//! stdout. Nothing else on stdout carries meaning; it is relayed to the proxy
//! log.

use serde::Serialize;

/// Database name the worker serves
pub const ENV_GRAPH: &str = "GRAPHMUX_GRAPH";
/// Application (HTTP) port
pub const ENV_APP_PORT: &str = "GRAPHMUX_APP_PORT";
/// Companion streaming port
pub const ENV_WS_PORT: &str = "GRAPHMUX_WS_PORT";
/// Conventional alias of the application port
pub const ENV_PORT: &str = "PORT";
/// Optional address the worker advertises to its clients
pub const ENV_BIND_ADDRESS: &str = "GRAPHMUX_BIND_ADDRESS";
/// Optional analytics identifier passed through to the client
pub const ENV_ANALYTICS_ID: &str = "GRAPHMUX_ANALYTICS_ID";

/// Line a worker prints once its listener is bound
pub const READY_MARKER: &str = "GRAPHMUX_READY";

/// File name of the per-graph runtime configuration script
pub const RUNTIME_CONFIG_FILE: &str = "netcreate-config.js";

/// Everything a worker is told at launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchParams {
    pub graph: String,
    pub app_port: u16,
    pub ws_port: u16,
    pub bind_address: Option<String>,
    pub analytics_id: Option<String>,
}

impl LaunchParams {
    /// Environment variables carrying these parameters to the child
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_GRAPH, self.graph.clone()),
            (ENV_APP_PORT, self.app_port.to_string()),
            (ENV_WS_PORT, self.ws_port.to_string()),
            (ENV_PORT, self.app_port.to_string()),
        ];
        if let Some(ref addr) = self.bind_address {
            vars.push((ENV_BIND_ADDRESS, addr.clone()));
        }
        if let Some(ref id) = self.analytics_id {
            vars.push((ENV_ANALYTICS_ID, id.clone()));
        }
        vars
    }

    /// Read launch parameters from the current process environment
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let graph = lookup(ENV_GRAPH)
            .filter(|g| !g.is_empty())
            .ok_or_else(|| anyhow::anyhow!("{} is not set", ENV_GRAPH))?;

        let port = |name: &str| -> anyhow::Result<u16> {
            let raw = lookup(name).ok_or_else(|| anyhow::anyhow!("{} is not set", name))?;
            raw.parse()
                .map_err(|e| anyhow::anyhow!("{} is not a valid port ({}): {}", name, raw, e))
        };

        Ok(Self {
            graph,
            app_port: port(ENV_APP_PORT)?,
            ws_port: port(ENV_WS_PORT)?,
            bind_address: lookup(ENV_BIND_ADDRESS).filter(|v| !v.is_empty()),
            analytics_id: lookup(ENV_ANALYTICS_ID).filter(|v| !v.is_empty()),
        })
    }
}

/// Render the runtime configuration script shared by the worker's server
/// side and the browser client.
pub fn render_runtime_config(params: &LaunchParams) -> String {
    // JSON string literals are valid JavaScript string literals
    let quote = |s: &str| serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string());

    let mut fields = vec![
        format!("  dataset: {}", quote(&params.graph)),
        format!("  port: {}", quote(&params.app_port.to_string())),
        format!("  netport: {}", quote(&params.ws_port.to_string())),
    ];
    if let Some(ref ip) = params.bind_address {
        fields.push(format!("  ip: {}", quote(ip)));
    }
    fields.push(format!(
        "  googlea: {}",
        quote(params.analytics_id.as_deref().unwrap_or(""))
    ));

    format!(
        "// generated by graphmux\nconst NC_CONFIG = {{\n{}\n}};\n\
         if (typeof process === \"object\") module.exports = NC_CONFIG;\n\
         if (typeof window === \"object\") window.NC_CONFIG = NC_CONFIG;\n",
        fields.join(",\n")
    )
}
