//! Error taxonomy.
//!
//! Each layer gets its own `thiserror` enum; `ClientError` composes them at
//! the points where a layer's failure needs to reach the reconnect loop or
//! the binary boundary (`main.rs` collapses everything to `anyhow::Result`).

use std::net::SocketAddr;

use crate::codec::CodecError;
use crate::protocol::message::ProtocolError;

/// Errors from the local dialer (§4.8).
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial {0} failed: {1}")]
    Connect(SocketAddr, std::io::Error),
    #[error("both IPv4 and IPv6 loopback dials failed: v4={v4}, v6={v6}")]
    HappyEyeballsFailed { v4: String, v6: String },
    #[error("dial timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors surfaced during the authenticated handshake (§4.3 step 5-6).
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication rejected: {0}")]
    Denied(String),
    #[error("auth token expired")]
    TokenExpired,
    #[error("auth response timed out")]
    Timeout,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors from the transport/session layer (§4.3).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),
    #[error("TCP dial failed: {0}")]
    Dial(#[from] std::io::Error),
    #[error("dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("multiplexer error: {0}")]
    Mux(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("join session rejected")]
    JoinRejected,
    #[error("control connection lost")]
    Disconnected,
}

/// Top-level error returned by the client's public API and by `main`.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("shut down (no token refresher configured after token expiry)")]
    ShutdownNoRefresher,
    #[error("reconnect attempts exhausted ({0})")]
    MaxAttemptsExceeded(u32),
}
