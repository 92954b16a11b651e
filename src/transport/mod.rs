pub mod boxed_stream;
pub mod compress;
pub mod mux;
pub mod session;
pub mod tls;

pub use boxed_stream::{box_stream, BoxedStream};
pub use mux::{MuxConnection, MuxControl};
pub use session::{connect, ConnectOutcome, SessionContext};
