//! Identifiers for connections and HTTP requests.
//!
//! Connection ids tag every log line emitted while a connection is being
//! classified; request ids are echoed back to HTTP clients.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique id for an accepted TCP connection.
///
/// Format: `conn-{counter}` with the counter as 12 hex digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Allocate the next connection id.
    pub fn next() -> Self {
        let count = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn-{:012x}", count))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique id attached to each HTTP response as `x-request-id`.
#[derive(Clone, Debug)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new random request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
