//! Request classification
//!
//! Every inbound path is classified exactly once, before any proxying. Graph
//! routes are matched ahead of the fallback so the base worker never shadows
//! them.

use crate::error::ProxyErrorCode;
use crate::launch::RUNTIME_CONFIG_FILE;

const GRAPH_PREFIX: &str = "/graph/";
const KILL_PREFIX: &str = "/kill/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Home,
    Login,
    Authorize,
    Logout,
    Manage,
    /// One of the terminal error pages
    ErrorPage(ProxyErrorCode),
    Kill { graph: String },
    /// Runtime configuration script, answered by the proxy
    RuntimeConfig { graph: String },
    /// Forward to the graph's worker with `rest` as the path
    Graph { graph: String, rest: String },
    /// `/graph/<name>` without the trailing slash
    MissingSlash { graph: String },
    InvalidName { name: String },
    /// Everything else goes to the base worker unchanged
    Fallback,
}

/// Graph names are non-empty ASCII alphanumeric
pub fn is_valid_graph_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

pub fn classify(path: &str) -> Route {
    match path {
        "/" => return Route::Home,
        "/login" => return Route::Login,
        "/authorize" => return Route::Authorize,
        "/logout" => return Route::Logout,
        "/manage" => return Route::Manage,
        _ => {}
    }

    if let Some(code) = ProxyErrorCode::from_page_path(path) {
        return Route::ErrorPage(code);
    }

    if let Some(tail) = path.strip_prefix(KILL_PREFIX) {
        let name = tail.strip_suffix('/').unwrap_or(tail);
        if !is_valid_graph_name(name) {
            return Route::InvalidName {
                name: name.to_string(),
            };
        }
        return Route::Kill {
            graph: name.to_string(),
        };
    }

    if let Some(tail) = path.strip_prefix(GRAPH_PREFIX) {
        return classify_graph(tail);
    }

    Route::Fallback
}

/// `tail` is everything after `/graph/`
fn classify_graph(tail: &str) -> Route {
    let (name, rest) = match tail.find('/') {
        Some(i) => (&tail[..i], Some(&tail[i..])),
        None => (tail, None),
    };

    if !is_valid_graph_name(name) {
        return Route::InvalidName {
            name: name.to_string(),
        };
    }
    let graph = name.to_string();

    match rest {
        None => Route::MissingSlash { graph },
        Some(rest) if rest.strip_prefix('/') == Some(RUNTIME_CONFIG_FILE) => {
            Route::RuntimeConfig { graph }
        }
        Some(rest) => Route::Graph {
            graph,
            rest: rest.to_string(),
        },
    }
}

/// Path and query to send to a worker
pub fn rewrite_target(rest: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", rest, q),
        _ => rest.to_string(),
    }
}
