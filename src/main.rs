//! ultramux - HTTP/1.1 and gRPC on one TCP port
//!
//! Usage:
//!     ultramux [--config <path>] [--port <port>]
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use ultramux::config::{Config, load_config, validate_config, validate_log_level};
use ultramux::metrics::MetricsCollector;
use ultramux::util::init_logging;

/// Serve HTTP/1.1 and gRPC on a single TCP port.
#[derive(Parser, Debug)]
#[command(name = "ultramux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (defaults apply when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config = config.with_port(port);
        validate_config(&config).map_err(anyhow::Error::msg)?;
    }

    // CLI overrides config
    if let Some(level) = &cli.log_level {
        validate_log_level(level).map_err(anyhow::Error::msg)?;
    }
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format).context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen);
        println!(
            "  Readiness: {} attempts, {} apart",
            config.readiness.attempts,
            humantime::format_duration(config.readiness.interval)
        );
        if config.metrics.enabled {
            println!("  Metrics: {}{}", config.metrics.address, config.metrics.path);
        }
        return Ok(());
    }

    info!(
        config_path = ?cli.config,
        listen = %config.listen,
        "ultramux starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let running = ultramux::start(config, MetricsCollector::new())
        .await
        .context("startup failed")?;

    info!("press Ctrl+C to stop");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        },
        _ = running.wait() => error!("a core component stopped unexpectedly"),
    }

    running.shutdown().await;
    info!("ultramux shut down complete");
    Ok(())
}
