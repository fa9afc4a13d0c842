//! Metrics collector using prometheus-client.
//!
//! Tracks what the multiplexer does with each accepted connection, the HTTP
//! requests served behind it, and the outcome of readiness probes.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for per-protocol routing metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtocolLabels {
    pub protocol: String,
}

/// Labels for HTTP request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: String,
}

/// Labels for readiness probe metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub probe: String,
    pub result: ProbeResult,
}

/// Result of a readiness probe.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ProbeResult {
    Success,
    Failure,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Connections accepted on the real listener.
    connections_total: Counter,
    /// Connections handed to a virtual listener, per protocol.
    connections_routed: Family<ProtocolLabels, Counter>,
    /// Classified connections whose protocol listener was gone.
    connections_dropped: Family<ProtocolLabels, Counter>,
    /// Connections closed because no matcher accepted them.
    classification_failures: Counter,
    /// Errors returned by the real listener's accept call.
    accept_errors: Counter,
    /// HTTP requests served.
    requests_total: Family<RequestLabels, Counter>,
    /// HTTP request duration histogram (in seconds).
    request_duration_seconds: Histogram,
    /// Readiness probes performed.
    probes_total: Family<ProbeLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_total = Counter::default();
        let connections_routed = Family::<ProtocolLabels, Counter>::default();
        let connections_dropped = Family::<ProtocolLabels, Counter>::default();
        let classification_failures = Counter::default();
        let accept_errors = Counter::default();
        let requests_total = Family::<RequestLabels, Counter>::default();
        // Buckets: 1ms .. ~60s
        let request_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.5, 13));
        let probes_total = Family::<ProbeLabels, Counter>::default();

        registry.register(
            "ultramux_connections",
            "Total number of connections accepted on the shared listener",
            connections_total.clone(),
        );
        registry.register(
            "ultramux_connections_routed",
            "Connections delivered to a protocol listener",
            connections_routed.clone(),
        );
        registry.register(
            "ultramux_connections_dropped",
            "Classified connections dropped because their protocol listener was closed",
            connections_dropped.clone(),
        );
        registry.register(
            "ultramux_classification_failures",
            "Connections closed because no matcher accepted them",
            classification_failures.clone(),
        );
        registry.register(
            "ultramux_accept_errors",
            "Errors returned by the shared listener's accept call",
            accept_errors.clone(),
        );
        registry.register(
            "ultramux_http_requests",
            "Total number of HTTP requests served",
            requests_total.clone(),
        );
        registry.register(
            "ultramux_http_request_duration_seconds",
            "HTTP request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "ultramux_readiness_probes",
            "Readiness probes performed during startup",
            probes_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                connections_total,
                connections_routed,
                connections_dropped,
                classification_failures,
                accept_errors,
                requests_total,
                request_duration_seconds,
                probes_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn connection_accepted(&self) {
        self.inner.connections_total.inc();
    }

    pub fn connection_routed(&self, protocol: &str) {
        let labels = ProtocolLabels {
            protocol: protocol.to_string(),
        };
        self.inner.connections_routed.get_or_create(&labels).inc();
    }

    pub fn connection_dropped(&self, protocol: &str) {
        let labels = ProtocolLabels {
            protocol: protocol.to_string(),
        };
        self.inner.connections_dropped.get_or_create(&labels).inc();
    }

    pub fn classification_failed(&self) {
        self.inner.classification_failures.inc();
    }

    pub fn accept_failed(&self) {
        self.inner.accept_errors.inc();
    }

    /// Record a completed HTTP request.
    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();
        self.inner
            .request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Record a readiness probe result.
    pub fn record_probe(&self, probe: &str, success: bool) {
        let labels = ProbeLabels {
            probe: probe.to_string(),
            result: if success {
                ProbeResult::Success
            } else {
                ProbeResult::Failure
            },
        };
        self.inner.probes_total.get_or_create(&labels).inc();
    }

    pub fn connections_accepted(&self) -> u64 {
        self.inner.connections_total.get()
    }

    pub fn connections_routed_to(&self, protocol: &str) -> u64 {
        let labels = ProtocolLabels {
            protocol: protocol.to_string(),
        };
        self.inner.connections_routed.get_or_create(&labels).get()
    }

    pub fn connections_dropped_for(&self, protocol: &str) -> u64 {
        let labels = ProtocolLabels {
            protocol: protocol.to_string(),
        };
        self.inner.connections_dropped.get_or_create(&labels).get()
    }

    pub fn classification_failures(&self) -> u64 {
        self.inner.classification_failures.get()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
