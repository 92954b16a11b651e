//! `ClientConfig` (§3.x): a `clap::Parser` struct with `env` fallbacks
//! for every field, plus an optional TOML file injected into the
//! process environment before parsing — the exact precedence
//! (CLI > env > file) and mechanism the `Config`/`ConfigFile` pair
//! uses, narrowed to this crate's fields.

use std::path::Path;
use std::str::FromStr;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::protocol::message::TunnelKind;

/// One tunnel the client should request on connect, given on the
/// command line as `name:kind:local_host:local_port[:remote_port]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelArg {
    pub name: String,
    pub kind: TunnelKind,
    pub local_host: String,
    pub local_port: u16,
    pub remote_port: Option<u16>,
}

impl FromStr for TunnelArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 4 {
            return Err(format!(
                "expected name:kind:local_host:local_port[:remote_port], got {s:?}"
            ));
        }
        let kind = match parts[1].to_ascii_lowercase().as_str() {
            "http" => TunnelKind::Http,
            "tcp" => TunnelKind::Tcp,
            "udp" => TunnelKind::Udp,
            other => return Err(format!("unknown tunnel kind {other:?}")),
        };
        let local_port: u16 = parts[3]
            .parse()
            .map_err(|_| format!("invalid local_port {:?}", parts[3]))?;
        let remote_port = match parts.get(4) {
            Some(s) if !s.is_empty() => Some(
                s.parse()
                    .map_err(|_| format!("invalid remote_port {s:?}"))?,
            ),
            _ => None,
        };
        Ok(TunnelArg {
            name: parts[0].to_string(),
            kind,
            local_host: parts[2].to_string(),
            local_port,
            remote_port,
        })
    }
}

/// Reverse-tunnel client: authenticated multiplexed transport, tunnel
/// proxying, and the traffic inspector.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct ClientConfig {
    /// Reverse-tunnel server URL (e.g. tcp://tunnel.example.com:7000 or
    /// tls://tunnel.example.com:7000)
    #[arg(long, env = "RETUN_SERVER_URL")]
    pub server_url: String,

    /// Bearer auth token
    #[arg(long, env = "RETUN_AUTH_TOKEN")]
    pub auth_token: String,

    /// Tunnels to request, repeatable:
    /// name:kind:local_host:local_port[:remote_port]
    #[arg(long = "tunnel", env = "RETUN_TUNNELS", value_delimiter = ',')]
    pub tunnels: Vec<TunnelArg>,

    /// Number of data sessions to maintain alongside the control session
    #[arg(long, env = "RETUN_DATA_SESSIONS", default_value_t = 15)]
    pub data_sessions: u32,

    /// Enable transparent zstd compression over the raw connection
    #[arg(long, env = "RETUN_COMPRESSION", default_value_t = false)]
    pub compression: bool,

    /// Initial reconnect backoff in seconds
    #[arg(long, env = "RETUN_RECONNECT_INITIAL_SECS", default_value_t = 5)]
    pub reconnect_initial_secs: u64,

    /// Maximum reconnect backoff in seconds
    #[arg(long, env = "RETUN_RECONNECT_MAX_SECS", default_value_t = 120)]
    pub reconnect_max_secs: u64,

    /// Maximum reconnect attempts (0 = unbounded)
    #[arg(long, env = "RETUN_RECONNECT_MAX_ATTEMPTS", default_value_t = 0)]
    pub reconnect_max_attempts: u32,

    /// Disable reconnect entirely; the client shuts down on disconnect
    #[arg(long, env = "RETUN_RECONNECT_DISABLED", default_value_t = false)]
    pub reconnect_disabled: bool,

    /// Keepalive ping interval in seconds
    #[arg(long, env = "RETUN_KEEPALIVE_INTERVAL_SECS", default_value_t = 30)]
    pub keepalive_interval_secs: u64,

    /// Enable HTTP capture for HTTP tunnels
    #[arg(long, env = "RETUN_CAPTURE_ENABLED", default_value_t = true)]
    pub capture_enabled: bool,

    /// Maximum captured body size per exchange half, in bytes
    #[arg(long, env = "RETUN_CAPTURE_MAX_BODY", default_value_t = 65536)]
    pub capture_max_body_bytes: usize,

    /// Captured exchanges retained per tunnel
    #[arg(long, env = "RETUN_CAPTURE_RING_CAPACITY", default_value_t = 1000)]
    pub capture_ring_capacity: usize,

    /// Inspector HTTP bind port (tries this and up to +9)
    #[arg(long, env = "RETUN_INSPECTOR_PORT", default_value_t = 4040)]
    pub inspector_port: u16,

    /// Disable the inspector HTTP service entirely
    #[arg(long, env = "RETUN_INSPECTOR_DISABLED", default_value_t = false)]
    pub inspector_disabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RETUN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "RETUN_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Path to an optional TOML config file, loaded before CLI parsing
    #[arg(long, env = "RETUN_CONFIG_FILE")]
    pub config_file: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ClientConfig {
    /// Mirrors `Config::validate` — refuse to start rather
    /// than fail confusingly deep in the connect sequence (§7
    /// Configuration-time errors).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server_url must not be empty".into()));
        }
        url::Url::parse(&self.server_url)
            .map_err(|e| ConfigError::Invalid(format!("server_url: {e}")))?;
        if self.auth_token.trim().is_empty() {
            return Err(ConfigError::Invalid("auth_token must not be empty".into()));
        }
        if self.data_sessions == 0 {
            return Err(ConfigError::Invalid("data_sessions must be >= 1".into()));
        }
        if self.reconnect_initial_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_initial_secs must be >= 1".into(),
            ));
        }
        if self.reconnect_max_secs < self.reconnect_initial_secs {
            return Err(ConfigError::Invalid(
                "reconnect_max_secs must be >= reconnect_initial_secs".into(),
            ));
        }
        for tunnel in &self.tunnels {
            if tunnel.name.trim().is_empty() {
                return Err(ConfigError::Invalid("tunnel name must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Serializable config for TOML file persistence; all fields optional so
/// a partial file only overrides what it sets.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_sessions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_initial_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_max_body_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_ring_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspector_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspector_disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Inject values as environment variables so clap picks them up.
    /// Only sets variables not already present, preserving
    /// CLI > env > file precedence.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("RETUN_SERVER_URL", self.server_url);
        set!("RETUN_AUTH_TOKEN", self.auth_token);
        set!("RETUN_DATA_SESSIONS", self.data_sessions);
        set!("RETUN_COMPRESSION", self.compression);
        set!("RETUN_RECONNECT_INITIAL_SECS", self.reconnect_initial_secs);
        set!("RETUN_RECONNECT_MAX_SECS", self.reconnect_max_secs);
        set!(
            "RETUN_RECONNECT_MAX_ATTEMPTS",
            self.reconnect_max_attempts
        );
        set!("RETUN_RECONNECT_DISABLED", self.reconnect_disabled);
        set!("RETUN_KEEPALIVE_INTERVAL_SECS", self.keepalive_interval_secs);
        set!("RETUN_CAPTURE_ENABLED", self.capture_enabled);
        set!("RETUN_CAPTURE_MAX_BODY", self.capture_max_body_bytes);
        set!("RETUN_CAPTURE_RING_CAPACITY", self.capture_ring_capacity);
        set!("RETUN_INSPECTOR_PORT", self.inspector_port);
        set!("RETUN_INSPECTOR_DISABLED", self.inspector_disabled);
        set!("RETUN_LOG_LEVEL", self.log_level);
        set!("RETUN_LOG_JSON", self.log_json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_tunnel_arg_without_remote_port() {
        let tunnel: TunnelArg = "web:http:127.0.0.1:8080".parse().unwrap();
        assert_eq!(tunnel.name, "web");
        assert_eq!(tunnel.kind, TunnelKind::Http);
        assert_eq!(tunnel.local_port, 8080);
        assert_eq!(tunnel.remote_port, None);
    }

    #[test]
    fn parses_a_tunnel_arg_with_remote_port() {
        let tunnel: TunnelArg = "game:udp:127.0.0.1:25565:25565".parse().unwrap();
        assert_eq!(tunnel.kind, TunnelKind::Udp);
        assert_eq!(tunnel.remote_port, Some(25565));
    }

    #[test]
    fn rejects_an_unknown_kind() {
        assert!("web:carrier-pigeon:127.0.0.1:80".parse::<TunnelArg>().is_err());
    }

    fn sample_config() -> ClientConfig {
        ClientConfig {
            server_url: "tcp://tunnel.example.test:7000".into(),
            auth_token: "tok".into(),
            tunnels: vec![],
            data_sessions: 15,
            compression: false,
            reconnect_initial_secs: 5,
            reconnect_max_secs: 120,
            reconnect_max_attempts: 0,
            reconnect_disabled: false,
            keepalive_interval_secs: 30,
            capture_enabled: true,
            capture_max_body_bytes: 65536,
            capture_ring_capacity: 1000,
            inspector_port: 4040,
            inspector_disabled: false,
            log_level: "info".into(),
            log_json: false,
            config_file: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn empty_server_url_is_rejected() {
        let mut config = sample_config();
        config.server_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_below_initial_backoff_is_rejected() {
        let mut config = sample_config();
        config.reconnect_max_secs = 1;
        config.reconnect_initial_secs = 5;
        assert!(config.validate().is_err());
    }
}
