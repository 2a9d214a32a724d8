//! HTML pages served by the proxy itself

use crate::error::{full_body, ProxyBody, ProxyErrorCode};
use crate::routing::WorkerInfo;
use crate::supervisor::SupervisorStatus;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::fmt::Write;

const STYLE: &str = r#"<style>
  body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; margin: 2em; color: #333; }
  .box { border: 1px solid #ccc; border-radius: 6px; padding: 0.5em 1.5em 1em; margin-bottom: 1.5em; }
  table { border-collapse: collapse; }
  td, th { padding: 0.2em 1em 0.2em 0; text-align: left; }
  .error { color: #a00; }
  .muted { color: #888; font-size: 0.9em; }
  input:invalid { border: 2px solid red; }
</style>"#;

/// Escape text for use in HTML content and attribute values
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn document(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n<title>{}</title>\n{}\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape_html(title),
        STYLE,
        body
    )
}

pub fn html_response(status: StatusCode, html: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(html))
        .expect("valid response with StatusCode enum and static headers")
}

pub fn error_page(code: ProxyErrorCode, message: &str) -> String {
    let body = format!(
        "<h1 class=\"error\">{}</h1>\n<p>{}</p>\n<p class=\"muted\">{}</p>\n<p><a href=\"/\">Home</a> | <a href=\"/manage\">Manage graphs</a></p>",
        escape_html(code.title()),
        escape_html(message),
        code.as_header_value()
    );
    document(code.title(), &body)
}

/// Built-in landing page, used when no home page file is configured
pub fn landing_page() -> String {
    document(
        "Graphs",
        "<h1>Graph server</h1>\n<p>Open a graph at <code>/graph/&lt;name&gt;/</code>.</p>\n<p><a href=\"/manage\">Manage graphs</a></p>",
    )
}

pub fn login_page() -> String {
    document(
        "Login",
        r#"<h1>Login</h1>
<div class="box">
  <form method="post" action="/authorize">
    <p><label>Password <input type="password" name="password" autofocus required></label></p>
    <button type="submit">Login</button>
  </form>
</div>"#,
    )
}

fn active_graphs(status: &SupervisorStatus) -> String {
    let mut html = String::from(
        "<div class=\"box\">\n<h3>Active Graphs</h3>\n<table>\n<thead><tr><th>Graph</th><th>Port</th><th>Websocket</th><th></th></tr></thead>\n<tbody>\n",
    );

    for worker in &status.workers {
        let name = escape_html(&worker.name);
        // The base worker has no stop link
        let stop = if worker.base {
            String::new()
        } else {
            format!("<a href=\"/kill/{}/\">stop</a>", name)
        };
        let _ = writeln!(
            html,
            "<tr><td><a href=\"/graph/{0}/\" target=\"{0}\">{0}</a></td><td>{1}</td><td>{2}</td><td>{3}</td></tr>",
            name, worker.app_port, worker.ws_port, stop
        );
    }
    for name in &status.starting {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td colspan=\"3\" class=\"muted\">starting</td></tr>",
            escape_html(name)
        );
    }

    let graphs = status.workers.iter().filter(|w| !w.base).count();
    let _ = write!(
        html,
        "</tbody>\n</table>\n<p>Number of Active Graphs: {} / {} (max)</p>\n<p class=\"muted\">Reload to refresh. Stop graphs you are no longer using; closing the window does not stop them.</p>\n</div>\n",
        graphs, status.max_workers
    );
    html
}

fn saved_graphs(saved: &[String], workers: &[WorkerInfo]) -> String {
    let mut html = String::from(
        "<div class=\"box\">\n<h3>Saved Graphs</h3>\n<p>Graph files saved on the server. Click to open.</p>\n<ul>\n",
    );
    for name in saved.iter().filter(|n| !workers.iter().any(|w| &w.name == *n)) {
        let name = escape_html(name);
        let _ = writeln!(html, "<li><a href=\"/graph/{0}/\">{0}</a></li>", name);
    }
    html.push_str("</ul>\n</div>\n");
    html
}

const NEW_GRAPH_FORM: &str = r#"<div class="box">
<h3>New Graph</h3>
<script>
  function openGraph(event) {
    event.preventDefault();
    const name = document.getElementById('dbname').value;
    if (!/^[a-zA-Z0-9]+$/.test(name)) {
      alert('Please use only letters and digits.');
      return;
    }
    window.open('/graph/' + name + '/', '_blank');
  }
</script>
<form onsubmit="openGraph(event)">
  <label>Short alphanumeric name, no spaces or punctuation<br/>
    <input id="dbname" placeholder="Enter new graph name" required pattern="^[a-zA-Z0-9]+$">
  </label>
  <button type="submit">Create New Graph</button>
</form>
</div>
"#;

fn memory_report(status: &SupervisorStatus) -> String {
    format!(
        "<p class=\"muted\">MEMORY :: Available: {}mb :: Floor: {}mb :: Out of memory: {}</p>\n",
        status.memory.available_mb, status.memory.floor_mb, status.memory.out_of_memory
    )
}

pub fn manage_page(status: &SupervisorStatus, saved: &[String]) -> String {
    let mut body = String::from("<h1>Manage Graphs</h1>\n<p><a href=\"/logout\">Logout</a></p>\n");
    body.push_str(&active_graphs(status));
    body.push_str(&saved_graphs(saved, &status.workers));
    body.push_str(NEW_GRAPH_FORM);
    body.push_str(&memory_report(status));
    document("Manage Graphs", &body)
}

pub fn killed_page(worker: &WorkerInfo) -> String {
    let name = escape_html(&worker.name);
    document(
        "Graph stopped",
        &format!(
            "<h1>Stopped {}</h1>\n<p>Port {} is free again.</p>\n<p><a href=\"/manage\">Back to Manage Graphs</a></p>",
            name, worker.app_port
        ),
    )
}
