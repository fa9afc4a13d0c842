//! Utility functions and helpers.

mod ids;
mod logging;
mod shutdown;

pub use ids::{ConnectionId, RequestId};
pub use logging::init_logging;
pub use shutdown::ShutdownSignal;
