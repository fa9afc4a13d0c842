//! Synthetic readiness probes sent through the shared port.
//!
//! Both probes dial the multiplexed address, so a success proves the mux is
//! accepting, the matcher routed the connection, and the protocol server
//! answered.

use crate::grpc::UltraClient;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use thiserror::Error;

/// Payload sent by the gRPC probe.
const GRPC_PROBE_PAYLOAD: &str = "readiness";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid HTTP response")]
    InvalidResponse,

    #[error("unexpected status: {0} (expected 200)")]
    Status(u16),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC call failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("unexpected gRPC reply: {0:?}")]
    UnexpectedReply(String),
}

/// `GET /health` over a fresh HTTP/1.1 connection; passes on status 200.
pub async fn http_probe(addr: SocketAddr, probe_timeout: Duration) -> Result<(), ProbeError> {
    timeout(probe_timeout, http_health_check(addr))
        .await
        .map_err(|_| ProbeError::Timeout(probe_timeout))?
}

async fn http_health_check(addr: SocketAddr) -> Result<(), ProbeError> {
    let mut stream = TcpStream::connect(addr).await.map_err(ProbeError::Connect)?;

    let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Only the status line matters.
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(ProbeError::InvalidResponse);
    }

    let response = String::from_utf8_lossy(&buf[..n]);
    match parse_http_status(&response)? {
        200 => Ok(()),
        status => Err(ProbeError::Status(status)),
    }
}

/// Parse the status code from `HTTP/1.1 200 OK\r\n...`.
fn parse_http_status(response: &str) -> Result<u16, ProbeError> {
    let mut parts = response.split_whitespace();
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(ProbeError::InvalidResponse);
    };
    if !version.starts_with("HTTP/") {
        return Err(ProbeError::InvalidResponse);
    }

    code.parse().map_err(|_| ProbeError::InvalidResponse)
}

/// A real `ProcessData` round trip on a dedicated channel.
pub async fn grpc_probe(addr: SocketAddr, probe_timeout: Duration) -> Result<(), ProbeError> {
    timeout(probe_timeout, grpc_round_trip(addr, probe_timeout))
        .await
        .map_err(|_| ProbeError::Timeout(probe_timeout))?
}

async fn grpc_round_trip(addr: SocketAddr, probe_timeout: Duration) -> Result<(), ProbeError> {
    let client = UltraClient::connect(addr, probe_timeout).await?;
    let processed = client.process_data(GRPC_PROBE_PAYLOAD, probe_timeout).await?;

    if processed == GRPC_PROBE_PAYLOAD.to_uppercase() {
        Ok(())
    } else {
        Err(ProbeError::UnexpectedReply(processed))
    }
}
