//! ultramux - HTTP/1.1 and gRPC on one TCP port
//!
//! This crate provides:
//! - A connection multiplexer that sniffs each accepted connection and
//!   routes it to a per-protocol virtual listener
//! - Composable protocol matchers, including gRPC detection by decoding the
//!   HTTP/2 HEADERS frame
//! - An HTTP server and a gRPC server sharing the multiplexed port
//! - A startup orchestrator with readiness probes and a loop-back gRPC client
//! - Prometheus metrics

pub mod config;
pub mod grpc;
pub mod health;
pub mod http;
pub mod metrics;
pub mod mux;
pub mod orchestrator;
pub mod state;
pub mod util;

pub use config::Config;
pub use orchestrator::{Running, StartupError, start};
