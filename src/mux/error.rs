//! Multiplexer error types.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the multiplexing listener and its virtual listeners.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("matchers cannot be registered once the mux is serving")]
    AlreadyStarted,

    #[error("matcher '{rejected}' would never run: catch-all '{catch_all}' is already registered")]
    CatchAllNotLast { catch_all: String, rejected: String },

    #[error("accept failed {attempts} consecutive times: {source}")]
    Accept {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("listener is closed")]
    Closed,
}

/// Why a peek could not produce the requested bytes.
///
/// Matchers treat every variant as "does not match".
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("connection ended after {got} of {wanted} bytes")]
    ShortRead { wanted: usize, got: usize },

    #[error("refusing to buffer more than {limit} bytes while sniffing")]
    LimitExceeded { limit: usize },

    #[error("read failed while sniffing: {0}")]
    Io(#[from] io::Error),
}

/// A connection no registered matcher accepted.
#[derive(Debug, Error)]
#[error("no matcher accepted connection from {peer} ({buffered} bytes sniffed)")]
pub struct ClassificationFailure {
    pub peer: SocketAddr,
    pub buffered: usize,
}
