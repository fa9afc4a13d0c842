//! Startup sequencing and shutdown.
//!
//! Startup walks the [`Phase`] sequence strictly in order: bind the shared
//! listener, register matchers (gRPC first, catch-all HTTP last), start both
//! protocol servers, start the mux accept loop, probe both protocols through
//! the shared port, and only then dial the loop-back gRPC client.
//!
//! Any failure after the bind tears down everything started so far.

use crate::config::{Config, ReadinessConfig};
use crate::grpc::{GrpcServer, UltraClient};
use crate::health::{ProbeError, grpc_probe, http_probe};
use crate::http::{HttpContext, HttpServer};
use crate::metrics::{MetricsCollector, MetricsServer};
use crate::mux::{Any, Http2HeaderField, MuxError, MuxListener};
use crate::state::{AppState, InvalidTransition, Phase};
use crate::util::ShutdownSignal;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long shutdown waits for each task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const GRPC_PROTOCOL: &str = "grpc";
pub const HTTP_PROTOCOL: &str = "http";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind metrics server on {addr}: {source}")]
    Metrics {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("servers not ready after {attempts} attempts")]
    NotReady { attempts: u32 },

    #[error("failed to connect loop-back gRPC client: {0}")]
    Loopback(#[source] tonic::transport::Error),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// Handle to a fully started system.
pub struct Running {
    state: AppState,
    shutdown: ShutdownSignal,
    mux: Arc<MuxListener>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bring the whole system up. Returns once the loop-back client is ready.
pub async fn start(config: Config, metrics: MetricsCollector) -> Result<Running, StartupError> {
    let state = AppState::new();
    let shutdown = ShutdownSignal::new();

    let metrics_server = if config.metrics.enabled {
        let addr = config.metrics.address;
        let server = MetricsServer::bind(addr, &config.metrics.path, metrics.clone())
            .await
            .map_err(|source| StartupError::Metrics { addr, source })?;
        Some(server)
    } else {
        None
    };

    let mux = MuxListener::bind(config.listen, config.mux.clone(), metrics.clone()).map_err(
        |source| StartupError::Bind {
            addr: config.listen,
            source,
        },
    )?;
    state.advance(Phase::ListenerBound)?;

    let running = Running {
        state: state.clone(),
        shutdown: shutdown.clone(),
        mux: Arc::new(mux),
        tasks: Mutex::new(Vec::new()),
    };

    if let Some(server) = metrics_server {
        let shutdown = shutdown.clone();
        running.spawn(async move { server.run(shutdown).await });
    }

    match running.bring_up(&config, &metrics).await {
        Ok(()) => Ok(running),
        Err(e) => {
            error!(error = %e, phase = %state.phase(), "startup failed, tearing down");
            running.shutdown().await;
            Err(e)
        }
    }
}

impl Running {
    async fn bring_up(&self, config: &Config, metrics: &MetricsCollector) -> Result<(), StartupError> {
        // Order is load-bearing: the catch-all would swallow gRPC otherwise.
        let grpc_listener = self
            .mux
            .register(GRPC_PROTOCOL, Http2HeaderField::grpc().send_settings())?;
        let http_listener = self.mux.register(HTTP_PROTOCOL, Any)?;
        self.state.advance(Phase::MuxBuilt)?;

        let context = HttpContext::new(self.state.clone(), metrics.clone(), config.http.clone());
        let http_server = HttpServer::new(http_listener, context, config.http.header_read_timeout);
        let shutdown = self.shutdown.clone();
        self.spawn(async move { http_server.run(shutdown).await });

        let grpc_server = GrpcServer::new(grpc_listener);
        let shutdown = self.shutdown.clone();
        self.spawn(async move {
            if let Err(e) = grpc_server.run(shutdown).await {
                error!(error = %e, "gRPC server failed");
            }
        });
        self.state.advance(Phase::ServersStarted)?;

        let mux = Arc::clone(&self.mux);
        let shutdown = self.shutdown.clone();
        self.spawn(async move {
            if let Err(e) = mux.serve().await {
                error!(error = %e, "mux stopped");
                shutdown.shutdown();
            }
        });
        self.state.advance(Phase::MuxServing)?;

        let dial = loopback(self.mux.local_addr());
        wait_until_ready(dial, &config.readiness, metrics, &self.shutdown).await?;
        self.state.advance(Phase::ServersReady)?;

        let client = UltraClient::connect_lazy(dial, config.grpc.connect_timeout)
            .map_err(StartupError::Loopback)?;
        self.state.install_client(client)?;

        info!(
            address = %self.local_addr(),
            http_endpoints = "/health, /proxy, /grpc-call",
            grpc_methods = "SayHello, ProcessData",
            "ultramux is fully ready"
        );
        Ok(())
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.mux.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Resolves when something inside the system triggers shutdown, such as
    /// the mux giving up on accept errors.
    pub async fn wait(&self) {
        self.shutdown.wait().await
    }

    /// Stop everything: loop-back client, HTTP server, gRPC server, then the
    /// shared listener. Repeated calls return immediately.
    pub async fn shutdown(&self) {
        if !self.state.mark_stopped() {
            return;
        }
        info!("shutting down");

        self.shutdown.shutdown();
        self.mux.close();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("task did not stop within grace period, aborting");
                task.abort();
            }
        }

        info!("shutdown complete");
    }
}

/// Probe both protocols in rounds until one full round passes.
///
/// A failed probe restarts the whole round, so HTTP alone being up never
/// counts as progress.
async fn wait_until_ready(
    addr: SocketAddr,
    readiness: &ReadinessConfig,
    metrics: &MetricsCollector,
    shutdown: &ShutdownSignal,
) -> Result<(), StartupError> {
    info!(address = %addr, attempts = readiness.attempts, "waiting for servers to be ready");

    for attempt in 1..=readiness.attempts {
        match probe_round(addr, readiness.probe_timeout, metrics).await {
            Ok(()) => {
                info!(attempt, "both servers are ready");
                return Ok(());
            }
            Err((probe, e)) => {
                info!(
                    probe,
                    attempt,
                    attempts = readiness.attempts,
                    error = %e,
                    "server not ready yet"
                );
            }
        }

        if attempt < readiness.attempts {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(readiness.interval) => {}
            }
        }
    }

    Err(StartupError::NotReady {
        attempts: readiness.attempts,
    })
}

async fn probe_round(
    addr: SocketAddr,
    probe_timeout: Duration,
    metrics: &MetricsCollector,
) -> Result<(), (&'static str, ProbeError)> {
    let result = http_probe(addr, probe_timeout).await;
    metrics.record_probe(HTTP_PROTOCOL, result.is_ok());
    result.map_err(|e| (HTTP_PROTOCOL, e))?;

    let result = grpc_probe(addr, probe_timeout).await;
    metrics.record_probe(GRPC_PROTOCOL, result.is_ok());
    result.map_err(|e| (GRPC_PROTOCOL, e))
}

/// Address to dial for reaching our own listener.
fn loopback(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}
