pub mod manager;
pub mod stream_handler;
pub mod udp;

pub use manager::{ActiveTunnel, TunnelManager};
pub use stream_handler::{handle_stream, HandlerContext};
