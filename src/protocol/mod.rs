pub mod message;
pub mod stream_header;

pub use message::{Message, ProtocolError};
pub use stream_header::StreamHeader;
