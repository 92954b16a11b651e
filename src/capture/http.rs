//! HTTP capture (§4.9): tee the bytes of a proxied HTTP stream into side
//! buffers as they pass through unchanged, then parse the buffered bytes
//! into a `CapturedExchange` once the stream closes.
//!
//! The "never alter the hot path, parse off to the side" design is new
//! (nothing upstream has an equivalent — that proxy terminates HTTP itself via
//! `reqwest`/`hyper` rather than passing raw bytes through). The tee
//! wrapper shape is grounded on `tokio::io::AsyncRead`/`AsyncWrite`
//! pass-through wrappers as used throughout the corpus (e.g. counting
//! writers); parsing is done with `httparse`, the crate every tunnel
//! tool in the pack that touches raw HTTP reaches for.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::ring_buffer::HasId;

#[derive(Debug, Clone)]
pub struct CapturedExchange {
    pub id: String,
    pub tunnel_id: String,
    pub started_at_millis: i64,
    pub duration_millis: i64,
    pub method: String,
    pub path: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub request_body_true_size: usize,
    pub status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub response_body_true_size: usize,
    pub replay_ref: Option<String>,
}

impl HasId for CapturedExchange {
    fn id(&self) -> &str {
        &self.id
    }
}

pub fn new_exchange_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("c-{}", hex::encode(bytes))
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct Sink {
    data: Vec<u8>,
    true_size: usize,
    cap: usize,
}

impl Sink {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            true_size: 0,
            cap,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.true_size += bytes.len();
        if self.data.len() < self.cap {
            let remaining = self.cap - self.data.len();
            let take = remaining.min(bytes.len());
            self.data.extend_from_slice(&bytes[..take]);
        }
    }
}

#[derive(Clone)]
struct SharedSink(Arc<Mutex<Sink>>);

impl SharedSink {
    fn new(cap: usize) -> Self {
        Self(Arc::new(Mutex::new(Sink::new(cap))))
    }

    fn push(&self, bytes: &[u8]) {
        self.0.lock().unwrap().push(bytes);
    }

    fn take(&self) -> (Vec<u8>, usize) {
        let sink = self.0.lock().unwrap();
        (sink.data.clone(), sink.true_size)
    }
}

/// Wraps an `AsyncRead` so every byte that passes through is also copied
/// into a side buffer, unchanged.
pub struct TeeReader<R> {
    inner: R,
    sink: SharedSink,
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if poll.is_ready() {
            let after = buf.filled().len();
            if after > before {
                this.sink.push(&buf.filled()[before..after]);
            }
        }
        poll
    }
}

/// Wraps an `AsyncWrite` the same way, for the response direction.
pub struct TeeWriter<W> {
    inner: W,
    sink: SharedSink,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TeeWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.sink.push(&buf[..*n]);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Owns both tee wrappers for one proxied HTTP stream and finalizes them
/// into a `CapturedExchange` once both sides have been fully read.
pub struct Capture {
    tunnel_id: String,
    max_body_size: usize,
    request_sink: SharedSink,
    response_sink: SharedSink,
    started_at_millis: i64,
}

impl Capture {
    pub fn new(tunnel_id: impl Into<String>, max_body_size: usize) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            max_body_size,
            request_sink: SharedSink::new(max_body_size),
            response_sink: SharedSink::new(max_body_size),
            started_at_millis: now_millis(),
        }
    }

    pub fn wrap_reader<R: AsyncRead + Unpin>(&self, inner: R) -> TeeReader<R> {
        TeeReader {
            inner,
            sink: self.request_sink.clone(),
        }
    }

    pub fn wrap_writer<W: AsyncWrite + Unpin>(&self, inner: W) -> TeeWriter<W> {
        TeeWriter {
            inner,
            sink: self.response_sink.clone(),
        }
    }

    /// Parse both buffered halves and produce the immutable exchange
    /// record. Parse failure on either half degrades to `UNKNOWN`/0
    /// rather than dropping the capture — a malformed peer still leaves
    /// a record an operator can inspect.
    pub fn finalize(self, replay_ref: Option<String>) -> CapturedExchange {
        let (request_bytes, request_true_size) = self.request_sink.take();
        let (response_bytes, response_true_size) = self.response_sink.take();

        let (method, path, request_headers, request_body) =
            parse_request(&request_bytes, self.max_body_size);
        let (status, response_headers, response_body) =
            parse_response(&response_bytes, self.max_body_size);

        CapturedExchange {
            id: new_exchange_id(),
            tunnel_id: self.tunnel_id,
            started_at_millis: self.started_at_millis,
            duration_millis: now_millis() - self.started_at_millis,
            method,
            path,
            request_headers,
            request_body,
            request_body_true_size: request_true_size,
            status,
            response_headers,
            response_body,
            response_body_true_size: response_true_size,
            replay_ref,
        }
    }
}

fn parse_request(bytes: &[u8], max_body: usize) -> (String, String, Vec<(String, String)>, Vec<u8>) {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(bytes) {
        Ok(httparse::Status::Complete(offset)) => {
            let method = request.method.unwrap_or("UNKNOWN").to_string();
            let path = request.path.unwrap_or("/").to_string();
            let headers = collect_headers(request.headers);
            let body = bytes[offset..].iter().take(max_body).copied().collect();
            (method, path, headers, body)
        }
        _ => (
            "UNKNOWN".to_string(),
            String::new(),
            Vec::new(),
            bytes.iter().take(max_body).copied().collect(),
        ),
    }
}

pub(crate) fn parse_response(bytes: &[u8], max_body: usize) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(bytes) {
        Ok(httparse::Status::Complete(offset)) => {
            let status = response.code.unwrap_or(0);
            let headers = collect_headers(response.headers);
            let body = bytes[offset..].iter().take(max_body).copied().collect();
            (status, headers, body)
        }
        _ => (
            0,
            Vec::new(),
            bytes.iter().take(max_body).copied().collect(),
        ),
    }
}

fn collect_headers(headers: &[httparse::Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}
