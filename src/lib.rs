//! Reverse-tunnel client core.
//!
//! Wires together the framed codec, control protocol, transport/session
//! multiplexer, stream/UDP proxies, tunnel manager, reconnect loop, HTTP
//! capture, and traffic inspector described in the crate's design docs.
//! [`Client`] is the top-level entry point an embedder (or `main.rs`)
//! constructs and runs; everything else is exposed so a host application
//! can observe state (events, active tunnels, captured exchanges) or
//! supply narrow collaborators (a [`reconnect::TokenRefresher`]).

pub mod capture;
pub mod client;
pub mod codec;
pub mod config;
pub mod control;
pub mod dialer;
pub mod error;
pub mod events;
pub mod inspector;
pub mod keepalive;
pub mod protocol;
pub mod reconnect;
pub mod transport;
pub mod tunnel;

pub use client::Client;
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{ClientEvent, EventEmitter};
pub use reconnect::TokenRefresher;
