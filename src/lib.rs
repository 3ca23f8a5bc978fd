//! Edge Log Shipper
//!
//! A buffered, fault-tolerant client that ships log records from a device
//! to an HTTP collector:
//!
//! - **record**: log record model, bounded formatting and the `ship_*!` macros
//! - **queue**: fixed-capacity in-memory ingestion queue
//! - **overflow**: persistent overflow store that survives restarts
//! - **backoff**: exponential retry delay after failed transmissions
//! - **transport**: HTTP transport to the collector
//! - **transmit**: payload serialization and circuit breaker
//! - **scheduler**: background drain timer
//! - **shipper**: the [`LogShipper`] client tying everything together
//! - **config**: configuration from code or environment variables
//!
//! # Example
//!
//! ```no_run
//! use edge_log_shipper::{ship_info, ClientConfig, LogLevel, LogShipper};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::new("http://192.168.2.62:3000", "sensor-node-1")
//!         .with_batch_size(20)
//!         .with_overflow_path("/var/lib/shipper/overflow.bin");
//!
//!     let shipper = LogShipper::init(config).expect("Failed to start shipper");
//!
//!     shipper.add(LogLevel::Warn, "power", "battery below 15%").ok();
//!     ship_info!(shipper, "uptime {} s", 3600).ok();
//!
//!     let sent = shipper.flush().await.unwrap_or(0);
//!     println!("sent {} records", sent);
//!
//!     shipper.shutdown().await;
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod overflow;
pub mod queue;
pub mod record;
pub mod scheduler;
pub mod shipper;
pub mod transmit;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use backoff::{Backoff, BackoffSnapshot};
pub use config::{ClientConfig, ConfigError, Endpoint};
pub use overflow::{ByteStore, FileStore, MemoryStore, OverflowStore, StorageError};
pub use queue::IngestionQueue;
pub use record::{LogLevel, LogRecord};
pub use shipper::{ClientError, LogShipper, ShipperStats};
pub use transmit::{TransmitError, Transmitter};
pub use transport::{HttpTransport, PostRequest, Transport, TransportError, TransportResponse};
