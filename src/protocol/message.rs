//! Control-plane message taxonomy (§4.2, §6).
//!
//! A small closed enum with an explicit tag, not reflection over field
//! names — grounded on `tunnel::protocol::MsgType` +
//! `Frame`, generalized from a fixed binary message-type byte to a JSON
//! tagged union since the wire format here is JSON, not a custom binary
//! frame (the binary framing is reserved for `StreamHeader`, see
//! `stream_header.rs`).

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message tag: {0}")]
    UnknownTag(String),
}

/// Stable error codes carried by `AuthResult`/`Error` messages. Unknown
/// codes must be treated as opaque by the reader (§6).
pub mod error_code {
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Every control-plane unit: a tag, a monotonic client-local timestamp
/// (milliseconds), and kind-specific fields. Field names match §6 exactly
/// so the wire format is stable across implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Auth {
        timestamp: i64,
        token: String,
        client_id: String,
        user_agent: String,
    },
    AuthResult {
        timestamp: i64,
        success: bool,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        session_secret: Option<String>,
        #[serde(default)]
        max_tunnels: Option<u32>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    JoinSession {
        timestamp: i64,
        client_id: String,
        secret: String,
    },
    JoinSessionResult {
        timestamp: i64,
        success: bool,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    TunnelRequest {
        timestamp: i64,
        request_id: String,
        tunnel_type: TunnelKind,
        name: String,
        local_port: u16,
        #[serde(default)]
        remote_port: Option<u16>,
        #[serde(default)]
        subdomain: Option<String>,
    },
    TunnelCreated {
        timestamp: i64,
        request_id: String,
        tunnel_id: String,
        tunnel_type: TunnelKind,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        remote_addr: Option<String>,
        #[serde(default)]
        remote_port: Option<u16>,
    },
    TunnelError {
        timestamp: i64,
        tunnel_id: String,
        code: String,
        error: String,
    },
    TunnelClose {
        timestamp: i64,
        tunnel_id: String,
    },
    TunnelClosed {
        timestamp: i64,
        tunnel_id: String,
    },
    NewConnection {
        timestamp: i64,
        tunnel_id: String,
        #[serde(default)]
        connection_id: Option<String>,
    },
    ConnectionAccept {
        timestamp: i64,
        tunnel_id: String,
        #[serde(default)]
        connection_id: Option<String>,
    },
    ConnectionClose {
        timestamp: i64,
        tunnel_id: String,
        #[serde(default)]
        connection_id: Option<String>,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        timestamp: i64,
        code: String,
        error: String,
        fatal: bool,
    },
    ServerShutdown {
        timestamp: i64,
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Http,
    Tcp,
    Udp,
}

impl Message {
    pub fn timestamp(&self) -> i64 {
        match self {
            Message::Auth { timestamp, .. }
            | Message::AuthResult { timestamp, .. }
            | Message::JoinSession { timestamp, .. }
            | Message::JoinSessionResult { timestamp, .. }
            | Message::TunnelRequest { timestamp, .. }
            | Message::TunnelCreated { timestamp, .. }
            | Message::TunnelError { timestamp, .. }
            | Message::TunnelClose { timestamp, .. }
            | Message::TunnelClosed { timestamp, .. }
            | Message::NewConnection { timestamp, .. }
            | Message::ConnectionAccept { timestamp, .. }
            | Message::ConnectionClose { timestamp, .. }
            | Message::Ping { timestamp, .. }
            | Message::Pong { timestamp, .. }
            | Message::Error { timestamp, .. }
            | Message::ServerShutdown { timestamp, .. } => *timestamp,
        }
    }

    /// Tag name, used for logging without re-matching the whole enum.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "Auth",
            Message::AuthResult { .. } => "AuthResult",
            Message::JoinSession { .. } => "JoinSession",
            Message::JoinSessionResult { .. } => "JoinSessionResult",
            Message::TunnelRequest { .. } => "TunnelRequest",
            Message::TunnelCreated { .. } => "TunnelCreated",
            Message::TunnelError { .. } => "TunnelError",
            Message::TunnelClose { .. } => "TunnelClose",
            Message::TunnelClosed { .. } => "TunnelClosed",
            Message::NewConnection { .. } => "NewConnection",
            Message::ConnectionAccept { .. } => "ConnectionAccept",
            Message::ConnectionClose { .. } => "ConnectionClose",
            Message::Ping { .. } => "Ping",
            Message::Pong { .. } => "Pong",
            Message::Error { .. } => "Error",
            Message::ServerShutdown { .. } => "ServerShutdown",
        }
    }
}

/// JSON payload carried in a `TunnelRequest` describing a single configured
/// tunnel, used by `ClientConfig` before any request id is minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub name: String,
    pub tunnel_type: TunnelKind,
    pub local_host: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub subdomain: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_round_trips_through_json() {
        let msg = Message::Auth {
            timestamp: 1234,
            token: "tok".into(),
            client_id: "c1".into(),
            user_agent: "retun/0.1".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timestamp(), 1234);
        assert_eq!(back.tag(), "Auth");
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let json = r#"{"type":"NotARealKind","timestamp":1}"#;
        let err = serde_json::from_str::<Message>(json).unwrap_err();
        assert!(err.to_string().contains("NotARealKind") || err.is_data());
    }
}
