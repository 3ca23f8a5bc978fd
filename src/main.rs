//! Edge Log Shipper - ships lines read from stdin to a log collector
//!
//! Every line on standard input becomes one log record. A line may start
//! with a level prefix (`error:`, `warn:`, `info:`, `debug:`); otherwise it
//! is shipped at `info`.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `LOG_SHIPPER_ENDPOINT`: collector URL (required)
//! - `LOG_SHIPPER_DEVICE_ID`: source identifier (required)
//! - `LOG_SHIPPER_BATCH_SIZE`: records per batch (default: 10)
//! - `LOG_SHIPPER_FLUSH_INTERVAL_MS`: milliseconds between drains (default: 5000)
//! - `LOG_SHIPPER_BUFFER_CAPACITY`: in-memory queue capacity (default: 100)
//! - `LOG_SHIPPER_OVERFLOW_PATH`: persistent overflow file (optional)
//! - `LOG_SHIPPER_REQUEST_TIMEOUT_MS`: per-request timeout (default: 5000)
//! - `RUST_LOG`: logging level filter (default: info)

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_log_shipper::{ClientConfig, LogLevel, LogShipper};

/// Module name attached to records read from stdin
const STDIN_MODULE: &str = "stdin";

/// Upper bound on the final drain at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Edge Log Shipper...");

    let config = match ClientConfig::from_env() {
        Ok(config) => {
            info!(
                endpoint = %config.endpoint,
                device_id = %config.device_id,
                batch_size = config.batch_size,
                flush_interval_ms = config.flush_interval.as_millis() as u64,
                overflow = config.overflow_path.is_some(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let shipper = match LogShipper::init(config) {
        Ok(shipper) => shipper,
        Err(e) => {
            error!(error = %e, "Failed to start log shipper");
            std::process::exit(1);
        }
    };

    let reader_shipper = shipper.clone();
    let reader_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let (level, message) = parse_line(&line);
                    if let Err(e) = reader_shipper.add(level, STDIN_MODULE, message) {
                        warn!(error = %e, "Failed to buffer line");
                        break;
                    }
                }
                Ok(None) => {
                    info!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });

    info!("Edge Log Shipper running. Press Ctrl+C to stop.");
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
        _ = reader_handle => {}
    }

    info!("Initiating graceful shutdown...");

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, shipper.flush()).await {
        Ok(Ok(sent)) => info!(sent, "Flushed remaining logs"),
        Ok(Err(e)) => warn!(error = %e, "Final flush skipped"),
        Err(_) => warn!("Final flush timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    let stats = shipper.stats();
    let pending = shipper.buffer_count() + shipper.overflow_count() as usize;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shipper.shutdown())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
    }

    info!(
        sent = stats.sent,
        dropped = stats.dropped,
        failed = stats.failed,
        undelivered = pending,
        "Edge Log Shipper stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Split an optional `level:` prefix off a line.
fn parse_line(line: &str) -> (LogLevel, &str) {
    if let Some((prefix, rest)) = line.split_once(':') {
        let prefix = prefix.trim();
        if let Some(level) = LogLevel::all()
            .iter()
            .copied()
            .find(|level| prefix.eq_ignore_ascii_case(level.as_str()))
        {
            return (level, rest.trim_start());
        }
    }
    (LogLevel::Info, line)
}
