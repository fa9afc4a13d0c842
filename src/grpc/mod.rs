//! gRPC side of the multiplexed port.

mod client;
pub mod proto;
mod server;
mod service;

pub use client::UltraClient;
pub use server::GrpcServer;
pub use service::{SERVICE_NAME, UltraHandler, greeting, process};
