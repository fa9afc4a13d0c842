//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// The single real listener shared by every protocol
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Connection multiplexer tuning
    #[serde(default)]
    pub mux: MuxConfig,

    /// Startup readiness polling
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// HTTP server settings
    #[serde(default)]
    pub http: HttpConfig,

    /// gRPC server and loop-back client settings
    #[serde(default)]
    pub grpc: GrpcConfig,

    /// Metrics endpoint configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            listen: default_listen(),
            mux: MuxConfig::default(),
            readiness: ReadinessConfig::default(),
            http: HttpConfig::default(),
            grpc: GrpcConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Replace the port of the listen address, keeping the host.
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen.set_port(port);
        self
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Multiplexer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MuxConfig {
    /// Capacity of each virtual listener's accept queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a single matcher may wait for more bytes
    #[serde(default = "default_sniff_timeout", with = "humantime_serde")]
    pub sniff_timeout: Duration,

    /// Upper bound on bytes buffered while sniffing one connection
    #[serde(default = "default_max_sniff_bytes")]
    pub max_sniff_bytes: usize,

    /// Consecutive accept failures tolerated before the mux gives up
    #[serde(default = "default_accept_retries")]
    pub accept_retries: u32,

    /// Fixed pause between accept retries
    #[serde(default = "default_accept_backoff", with = "humantime_serde")]
    pub accept_backoff: Duration,

    /// TCP listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            sniff_timeout: default_sniff_timeout(),
            max_sniff_bytes: default_max_sniff_bytes(),
            accept_retries: default_accept_retries(),
            accept_backoff: default_accept_backoff(),
            backlog: default_backlog(),
        }
    }
}

/// Readiness polling settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadinessConfig {
    /// Number of full probe rounds before startup fails
    #[serde(default = "default_readiness_attempts")]
    pub attempts: u32,

    /// Pause between probe rounds
    #[serde(default = "default_readiness_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout applied to each individual probe
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: default_readiness_attempts(),
            interval: default_readiness_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Time allowed for a client to send request headers
    #[serde(default = "default_header_read_timeout", with = "humantime_serde")]
    pub header_read_timeout: Duration,

    /// Upstream timeout for `/proxy`
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub proxy_timeout: Duration,

    /// Deadline for the loop-back call made by `/grpc-call`
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub grpc_call_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            header_read_timeout: default_header_read_timeout(),
            proxy_timeout: default_call_timeout(),
            grpc_call_timeout: default_call_timeout(),
        }
    }
}

/// gRPC settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GrpcConfig {
    /// Dial timeout for the loop-back client
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_call_timeout(),
        }
    }
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for the metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_queue_capacity() -> usize {
    128
}

fn default_sniff_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_sniff_bytes() -> usize {
    64 * 1024
}

fn default_accept_retries() -> u32 {
    10
}

fn default_accept_backoff() -> Duration {
    Duration::from_millis(50)
}

fn default_backlog() -> u32 {
    1024
}

fn default_readiness_attempts() -> u32 {
    20
}

fn default_readiness_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_header_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
