//! The JSON-over-HTTP transport adapter.
//!
//! Any method and path are accepted: the script (or built-in) name is the
//! URI path trimmed of slashes, and parameters merge the query string with
//! an urlencoded form body, duplicate keys joined with `,`. The response is
//! the dispatcher's [`Response`] serialized as indented JSON under its own
//! status code.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use tracing::{error, info};

use crate::config::normalize_addr;
use crate::server::Server;
use scriptd_protocol::{Request, TransportKind};

/// Listen for HTTP requests on `addr` until the listener fails. Errors end
/// this transport only; the daemon keeps running.
pub async fn listen(addr: String, server: Arc<Server>) {
    let bind_addr = normalize_addr(&addr);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind JSON transport on {bind_addr}: {err}");
            return;
        }
    };
    info!("JSON transport listening on {bind_addr}");
    serve(listener, server).await;
}

/// Serve requests from an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, server: Arc<Server>) {
    let app = Router::new().fallback(handle).with_state(server);
    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!("JSON transport exited: {err}");
    }
}

async fn handle(
    State(server): State<Arc<Server>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let request = Request {
        script_name: uri.path().trim_matches('/').to_string(),
        params: collect_params(&uri, &headers, &body),
        ts: chrono::Utc::now().timestamp(),
        remote_addr: remote.to_string(),
        transport: TransportKind::Json,
    };

    let response = server.handle(request).await;
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match serde_json::to_string_pretty(&response) {
        Ok(json) => (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(err) => {
            error!("Failed to serialize response: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Merge query-string and urlencoded-form parameters, joining duplicate
/// keys with `,`.
fn collect_params(uri: &Uri, headers: &HeaderMap, body: &Bytes) -> HashMap<String, String> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(query) = uri.query() {
        pairs.extend(parse_urlencoded(query));
    }
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        if let Ok(body) = std::str::from_utf8(body) {
            pairs.extend(parse_urlencoded(body));
        }
    }

    let mut params = HashMap::new();
    for (key, val) in pairs {
        params
            .entry(key)
            .and_modify(|existing: &mut String| {
                existing.push(',');
                existing.push_str(&val);
            })
            .or_insert(val);
    }
    params
}

fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(input).unwrap_or_default()
}

#[cfg(test)]
mod tests;
