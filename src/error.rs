//! Error codes and error responses for the proxy

use crate::pages;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, ACCEPT, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub const X_PROXY_ERROR: &str = "x-proxy-error";

pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// `/graph/<name>` without the trailing slash
    MalformedRequest,
    /// Graph name is not ASCII alphanumeric
    InvalidGraphName,
    OutOfPorts,
    OutOfMemory,
    /// Starting a new graph needs a session credential
    NotAuthorized,
    /// No running worker for the requested graph
    NoDatabase,
    /// The worker crashed or never signalled readiness
    SpawnFailed,
    UnknownKillTarget,
    ConnectionFailed,
    RequestTimeout,
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MalformedRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidGraphName => StatusCode::BAD_REQUEST,
            ProxyErrorCode::OutOfPorts => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::OutOfMemory => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::NotAuthorized => StatusCode::FORBIDDEN,
            ProxyErrorCode::NoDatabase => StatusCode::NOT_FOUND,
            ProxyErrorCode::SpawnFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UnknownKillTarget => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MalformedRequest => "MALFORMED_REQUEST",
            ProxyErrorCode::InvalidGraphName => "INVALID_GRAPH_NAME",
            ProxyErrorCode::OutOfPorts => "OUT_OF_PORTS",
            ProxyErrorCode::OutOfMemory => "OUT_OF_MEMORY",
            ProxyErrorCode::NotAuthorized => "NOT_AUTHORIZED",
            ProxyErrorCode::NoDatabase => "NO_DATABASE",
            ProxyErrorCode::SpawnFailed => "SPAWN_FAILED",
            ProxyErrorCode::UnknownKillTarget => "UNKNOWN_KILL_TARGET",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ProxyErrorCode::MalformedRequest => "Malformed URL",
            ProxyErrorCode::InvalidGraphName => "Invalid graph name",
            ProxyErrorCode::OutOfPorts => "Out of ports",
            ProxyErrorCode::OutOfMemory => "Out of memory",
            ProxyErrorCode::NotAuthorized => "Not authorized",
            ProxyErrorCode::NoDatabase => "No such database",
            ProxyErrorCode::SpawnFailed => "Graph failed to start",
            ProxyErrorCode::UnknownKillTarget => "Nothing to stop",
            ProxyErrorCode::ConnectionFailed => "Graph unreachable",
            ProxyErrorCode::RequestTimeout => "Request timed out",
            ProxyErrorCode::InternalError => "Internal error",
        }
    }

    /// Terminal error page that admission denials redirect to
    pub fn page_path(&self) -> Option<&'static str> {
        match self {
            ProxyErrorCode::OutOfPorts => Some("/error_out_of_ports"),
            ProxyErrorCode::OutOfMemory => Some("/error_out_of_memory"),
            ProxyErrorCode::NoDatabase => Some("/error_no_database"),
            ProxyErrorCode::NotAuthorized => Some("/error_not_authorized"),
            _ => None,
        }
    }

    pub fn from_page_path(path: &str) -> Option<Self> {
        [
            ProxyErrorCode::OutOfPorts,
            ProxyErrorCode::OutOfMemory,
            ProxyErrorCode::NoDatabase,
            ProxyErrorCode::NotAuthorized,
        ]
        .into_iter()
        .find(|code| code.page_path() == Some(path))
    }

    /// Explanation shown on the error page
    pub fn default_message(&self) -> &'static str {
        match self {
            ProxyErrorCode::MalformedRequest => {
                "Graph URLs must end with a trailing slash, e.g. /graph/name/"
            }
            ProxyErrorCode::InvalidGraphName => {
                "Graph names may only contain letters and digits"
            }
            ProxyErrorCode::OutOfPorts => {
                "The maximum number of graphs is running. Stop a graph before opening another."
            }
            ProxyErrorCode::OutOfMemory => {
                "The server is low on memory. Stop a graph or try again later."
            }
            ProxyErrorCode::NotAuthorized => {
                "Starting a new graph requires logging in as an administrator."
            }
            ProxyErrorCode::NoDatabase => "No graph by that name is running.",
            ProxyErrorCode::SpawnFailed => "The graph could not be started. Reload to try again.",
            ProxyErrorCode::UnknownKillTarget => "No running graph by that name.",
            ProxyErrorCode::ConnectionFailed => "Failed to connect to the graph.",
            ProxyErrorCode::RequestTimeout => "The graph did not respond in time.",
            ProxyErrorCode::InternalError => "Something went wrong inside the proxy.",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// True when the client asked for JSON rather than a page
pub fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Create an HTML error page with X-Proxy-Error header
pub fn html_error_response(code: ProxyErrorCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(full_body(pages::error_page(code, message)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Error response in the representation the client asked for
pub fn error_response(code: ProxyErrorCode, message: &str, headers: &HeaderMap) -> Response<ProxyBody> {
    if wants_json(headers) {
        json_error_response(code, message)
    } else {
        html_error_response(code, message)
    }
}

/// Plain 302 redirect
pub fn redirect(location: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(empty_body())
        .unwrap_or_else(|_| html_error_response(ProxyErrorCode::InternalError, "bad redirect target"))
}

/// Send the client to the error page for `code`. JSON clients get the error
/// directly; codes without a page are rendered in place.
pub fn error_redirect(code: ProxyErrorCode, headers: &HeaderMap) -> Response<ProxyBody> {
    match code.page_path() {
        Some(path) if !wants_json(headers) => {
            let mut response = redirect(path);
            response.headers_mut().insert(
                X_PROXY_ERROR,
                hyper::header::HeaderValue::from_static(code.as_header_value()),
            );
            response
        }
        _ => error_response(code, code.default_message(), headers),
    }
}
