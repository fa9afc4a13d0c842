//! Readiness probing of the multiplexed port.

mod probe;

pub use probe::{ProbeError, grpc_probe, http_probe};
