//! The line-oriented text transport adapter.
//!
//! One request per connection: the first line is whitespace-split, the
//! leading token names the script (or built-in), and every remaining
//! `-key=value` token (leading dashes trimmed) becomes a parameter. The
//! reply is `OK <code>` or `ERR <code>` followed by the body, the error
//! string, or the concatenated status snapshots.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::config::normalize_addr;
use crate::server::Server;
use scriptd_protocol::{Request, Response, TransportKind};

/// Listen for textproto requests on `addr` until the listener fails. Errors
/// end this transport only; the daemon keeps running.
pub async fn listen(addr: String, server: Arc<Server>) {
    let bind_addr = normalize_addr(&addr);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind textproto transport on {bind_addr}: {err}");
            return;
        }
    };
    info!("Textproto transport listening on {bind_addr}");
    serve(listener, server).await;
}

/// Accept loop over an already-bound listener.
pub async fn serve(listener: TcpListener, server: Arc<Server>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(stream, peer, server).await {
                        debug!("Textproto connection error: {err}");
                    }
                });
            }
            Err(err) => {
                error!("Textproto accept failed: {err}");
                return;
            }
        }
    }
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    server: Arc<Server>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;

    let Some(request) = parse_request_line(&line, peer) else {
        return Ok(());
    };
    let response = server.handle(request).await;
    write_half
        .write_all(render_response(&response).as_bytes())
        .await?;
    write_half.shutdown().await
}

/// Split a request line into a [`Request`]. Returns `None` for a blank line.
/// No quoted tokenizing; values containing whitespace are not expressible.
fn parse_request_line(line: &str, peer: SocketAddr) -> Option<Request> {
    let mut fields = line.split_whitespace();
    let script_name = fields.next()?.to_string();

    let mut params = HashMap::new();
    for field in fields {
        if let Some((key, val)) = field.split_once('=') {
            params.insert(key.trim_start_matches('-').to_string(), val.to_string());
        }
    }

    Some(Request {
        script_name,
        params,
        ts: chrono::Utc::now().timestamp(),
        remote_addr: peer.to_string(),
        transport: TransportKind::Textproto,
    })
}

/// First line `OK <code>` or `ERR <code>`; second line the body, the error
/// string, or the concatenated snapshot text.
fn render_response(response: &Response) -> String {
    let code = if response.is_err() { "ERR" } else { "OK" };
    let payload = if !response.body.is_empty() {
        response.body.clone()
    } else if let Some(error) = &response.error {
        error.to_string()
    } else {
        response
            .run_statii
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("")
    };
    format!("{code} {}\r\n{payload}\r\n", response.status_code)
}

#[cfg(test)]
mod tests;
