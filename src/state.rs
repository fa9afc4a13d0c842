//! Shared startup state.
//!
//! Startup is a strict sequence of phases. The current phase and the
//! loop-back client live behind one lock, so a handler either sees a usable
//! client or a definite "not ready" answer.

use crate::grpc::UltraClient;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Startup phases, in the only order they may be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Created,
    ListenerBound,
    MuxBuilt,
    ServersStarted,
    MuxServing,
    ServersReady,
    LoopbackReady,
    /// Terminal. Reachable from any phase.
    Stopped,
}

impl Phase {
    /// The phase that must follow this one during startup.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Created => Some(Phase::ListenerBound),
            Phase::ListenerBound => Some(Phase::MuxBuilt),
            Phase::MuxBuilt => Some(Phase::ServersStarted),
            Phase::ServersStarted => Some(Phase::MuxServing),
            Phase::MuxServing => Some(Phase::ServersReady),
            Phase::ServersReady => Some(Phase::LoopbackReady),
            Phase::LoopbackReady | Phase::Stopped => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::ListenerBound => "listener_bound",
            Phase::MuxBuilt => "mux_built",
            Phase::ServersStarted => "servers_started",
            Phase::MuxServing => "mux_serving",
            Phase::ServersReady => "servers_ready",
            Phase::LoopbackReady => "loopback_ready",
            Phase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid startup transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

/// Returned to handlers that need the loop-back client too early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("gRPC client not ready (phase {phase})")]
pub struct ClientNotReady {
    pub phase: Phase,
}

/// Boolean view of the startup phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub http_ready: bool,
    pub grpc_ready: bool,
    pub client_ready: bool,
}

struct Inner {
    phase: Phase,
    client: Option<UltraClient>,
}

/// Shared state accessible from all tasks.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<Inner>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                phase: Phase::Created,
                client: None,
            })),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.read().phase
    }

    /// Move to `next`, which must be the immediate successor of the
    /// current phase.
    pub fn advance(&self, next: Phase) -> Result<(), InvalidTransition> {
        let mut inner = self.inner.write();
        Self::step(&mut inner, next)
    }

    fn step(inner: &mut Inner, next: Phase) -> Result<(), InvalidTransition> {
        if inner.phase.successor() != Some(next) {
            return Err(InvalidTransition {
                from: inner.phase,
                to: next,
            });
        }
        inner.phase = next;
        Ok(())
    }

    /// Store the loop-back client and enter [`Phase::LoopbackReady`].
    pub fn install_client(&self, client: UltraClient) -> Result<(), InvalidTransition> {
        let mut inner = self.inner.write();
        Self::step(&mut inner, Phase::LoopbackReady)?;
        inner.client = Some(client);
        Ok(())
    }

    /// The loop-back client, or an immediate error if startup is not done.
    pub fn grpc_client(&self) -> Result<UltraClient, ClientNotReady> {
        let inner = self.inner.read();
        match (&inner.client, inner.phase) {
            (Some(client), Phase::LoopbackReady) => Ok(client.clone()),
            (_, phase) => Err(ClientNotReady { phase }),
        }
    }

    pub fn readiness(&self) -> Readiness {
        let phase = self.phase();
        if phase == Phase::Stopped {
            return Readiness::default();
        }

        let servers_ready = phase >= Phase::ServersReady;
        Readiness {
            http_ready: servers_ready,
            grpc_ready: servers_ready,
            client_ready: phase == Phase::LoopbackReady,
        }
    }

    /// Enter [`Phase::Stopped`] and drop the loop-back client.
    ///
    /// Returns `false` if already stopped.
    pub fn mark_stopped(&self) -> bool {
        let client = {
            let mut inner = self.inner.write();
            if inner.phase == Phase::Stopped {
                return false;
            }
            inner.phase = Phase::Stopped;
            inner.client.take()
        };
        drop(client);
        true
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
