//! Replay a previously captured HTTP exchange against the tunnel's local
//! service (§4.9: `POST /api/requests/http`).
//!
//! Grounded on `tunnel::stream_handler`'s own local dial (`dialer::dial`)
//! and on `capture::http`'s request/response parsing, reused here instead
//! of re-implemented since a replay response is parsed exactly the way a
//! captured one is.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::capture::http::{new_exchange_id, parse_response};
use crate::dialer;

use super::{ErrorBody, InspectorState};

const REPLAY_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub(crate) struct ReplayRequest {
    id: String,
    method: Option<String>,
    path: Option<String>,
    headers: Option<Vec<(String, String)>>,
    /// Base64-encoded body override; omitted to replay the original body.
    body: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReplayResponse {
    id: String,
    replay_ref: String,
    status: u16,
    headers: Vec<(String, String)>,
    body_base64: String,
}

pub(crate) async fn replay(
    State(state): State<InspectorState>,
    Json(request): Json<ReplayRequest>,
) -> axum::response::Response {
    let original = match state.capture.lookup(&request.id) {
        Some(exchange) => exchange,
        None => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "not found".into(),
                }),
            )
                .into_response()
        }
    };

    let tunnel = match state.tunnels.get(&original.tunnel_id) {
        Some(tunnel) => tunnel,
        None => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody {
                    error: "tunnel is no longer active".into(),
                }),
            )
                .into_response()
        }
    };

    let method = request.method.unwrap_or_else(|| original.method.clone());
    let path = request.path.unwrap_or_else(|| original.path.clone());
    let headers = request.headers.unwrap_or_else(|| original.request_headers.clone());
    let body = match request.body {
        Some(encoded) => match STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorBody {
                        error: "body is not valid base64".into(),
                    }),
                )
                    .into_response()
            }
        },
        None => original.request_body.clone(),
    };

    let result = timeout(REPLAY_TIMEOUT, async {
        let mut stream =
            match dialer::dial(&state.dialer_cache, &tunnel.local_host, tunnel.local_port).await {
                Ok(stream) => stream,
                Err(_) => return None,
            };
        let request_bytes = build_request(&method, &path, &headers, &body);
        if stream.write_all(&request_bytes).await.is_err() {
            return None;
        }
        read_until_quiescent(&mut stream).await.ok()
    })
    .await;

    let response_bytes = match result {
        Ok(Some(bytes)) => bytes,
        _ => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody {
                    error: "replay dial or read failed".into(),
                }),
            )
                .into_response()
        }
    };

    let (status, response_headers, response_body) =
        parse_response(&response_bytes, state.max_capture_body);

    let exchange_id = new_exchange_id();
    state.capture.record(
        &tunnel.tunnel_id,
        crate::capture::CapturedExchange {
            id: exchange_id.clone(),
            tunnel_id: tunnel.tunnel_id.clone(),
            started_at_millis: super::now_millis(),
            duration_millis: 0,
            method,
            path,
            request_headers: headers,
            request_body_true_size: body.len(),
            request_body: body,
            status,
            response_headers: response_headers.clone(),
            response_body_true_size: response_body.len(),
            response_body: response_body.clone(),
            replay_ref: Some(original.id.clone()),
        },
    );

    Json(ReplayResponse {
        id: exchange_id,
        replay_ref: original.id,
        status,
        headers: response_headers,
        body_base64: STANDARD.encode(&response_body),
    })
    .into_response()
}

fn build_request(method: &str, path: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("{method} {path} HTTP/1.1\r\n").into_bytes();
    let mut saw_content_length = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            saw_content_length = true;
            out.extend_from_slice(format!("{name}: {}\r\n", body.len()).as_bytes());
        } else {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
    }
    if !saw_content_length && !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Read until the peer has gone quiet: either it closes the connection,
/// or `IDLE_READ_TIMEOUT` passes with nothing new arriving. Covers both a
/// connection-per-request local service and a keep-alive one, without
/// needing to track `Content-Length`/chunked framing up front.
async fn read_until_quiescent(
    stream: &mut tokio::net::TcpStream,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match timeout(IDLE_READ_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(error)) => return Err(error),
            Err(_) => break,
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_adds_content_length_when_missing() {
        let bytes = build_request("POST", "/x", &[], b"hello");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /x HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn build_request_respects_an_explicit_content_length_header() {
        let headers = vec![("Content-Length".to_string(), "999".to_string())];
        let bytes = build_request("POST", "/x", &headers, b"hi");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
    }

    #[tokio::test]
    async fn read_until_quiescent_returns_bytes_written_before_close() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let writer = tokio::spawn(async move {
            client.write_all(b"HTTP/1.1 200 OK\r\n\r\nhi").await.unwrap();
            drop(client);
        });
        let mut buf = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = server.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        writer.await.unwrap();
        assert_eq!(buf, b"HTTP/1.1 200 OK\r\n\r\nhi");
    }
}
