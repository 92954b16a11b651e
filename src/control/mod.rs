pub mod pending;
pub mod router;

pub use pending::PendingRequests;
pub use router::{ControlSender, RouterExit};
