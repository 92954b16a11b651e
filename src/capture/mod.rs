pub mod http;
pub mod manager;
pub mod ring_buffer;

pub use http::{Capture, CapturedExchange};
pub use manager::CaptureManager;
pub use ring_buffer::RingBuffer;
