//! Prometheus counters for the multiplexer, readiness probes and HTTP
//! requests, plus the optional exposition endpoint.

mod collector;
mod server;

pub use collector::{MetricsCollector, ProbeResult};
pub use server::MetricsServer;
