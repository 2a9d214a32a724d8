//! Graphmux - a multiplexing reverse proxy for graph editor workers
//!
//! Many graph databases are served behind one public port, each by its own
//! worker process on a private port pair. This library:
//! - Routes `/graph/<name>/...` to that graph's worker, stripping the prefix
//! - Starts workers on first request and waits for their readiness signal
//! - Coalesces concurrent requests for a graph that is still starting
//! - Gates new workers on free ports, available memory and a session login
//! - Sends everything else to an always-running base worker

pub mod admission;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod launch;
pub mod pages;
pub mod pool;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod router;
pub mod routing;
pub mod supervisor;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
