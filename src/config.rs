//! Configuration for the log shipper.
//!
//! A [`ClientConfig`] can be built in code or loaded from environment
//! variables, and is normalized once at [`LogShipper::init`](crate::LogShipper::init)
//! where zero values fall back to defaults and the collector endpoint is
//! parsed into an [`Endpoint`].

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default number of records per transmission.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Largest accepted batch size.
pub const MAX_BATCH_SIZE: usize = 100;

/// Default period between scheduled drains.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5_000);

/// Default ingestion queue capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

/// Largest accepted ingestion queue capacity.
pub const MAX_BUFFER_CAPACITY: usize = 10_000;

/// Default bound on a single network attempt.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Collector port used when the endpoint does not name one.
pub const DEFAULT_PORT: u16 = 3000;

/// Longest accepted device identifier, in bytes.
pub const MAX_DEVICE_ID_LEN: usize = 63;

/// Flush interval bounds enforced on environment input.
const MIN_FLUSH_INTERVAL_MS: u64 = 100;
const MAX_FLUSH_INTERVAL_MS: u64 = 300_000;

const ENV_ENDPOINT: &str = "LOG_SHIPPER_ENDPOINT";
const ENV_DEVICE_ID: &str = "LOG_SHIPPER_DEVICE_ID";
const ENV_BATCH_SIZE: &str = "LOG_SHIPPER_BATCH_SIZE";
const ENV_FLUSH_INTERVAL_MS: &str = "LOG_SHIPPER_FLUSH_INTERVAL_MS";
const ENV_BUFFER_CAPACITY: &str = "LOG_SHIPPER_BUFFER_CAPACITY";
const ENV_ENABLE_COMPRESSION: &str = "LOG_SHIPPER_ENABLE_COMPRESSION";
const ENV_OVERFLOW_PATH: &str = "LOG_SHIPPER_OVERFLOW_PATH";
const ENV_REQUEST_TIMEOUT_MS: &str = "LOG_SHIPPER_REQUEST_TIMEOUT_MS";

/// Error type for configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent or empty
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A setting has an unusable value
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    /// The collector endpoint could not be parsed
    #[error("invalid endpoint '{endpoint}': {message}")]
    Endpoint { endpoint: String, message: String },
}

/// Configuration for a [`LogShipper`](crate::LogShipper).
///
/// Settings recognized from the environment:
/// - `LOG_SHIPPER_ENDPOINT`: collector URL (required)
/// - `LOG_SHIPPER_DEVICE_ID`: identifier sent as the payload source (required)
/// - `LOG_SHIPPER_BATCH_SIZE`: records per transmission (default: 10)
/// - `LOG_SHIPPER_FLUSH_INTERVAL_MS`: milliseconds between drains (default: 5000)
/// - `LOG_SHIPPER_BUFFER_CAPACITY`: in-memory queue capacity (default: 100)
/// - `LOG_SHIPPER_ENABLE_COMPRESSION`: reserved, currently has no effect
/// - `LOG_SHIPPER_OVERFLOW_PATH`: file for the persistent overflow store (optional)
/// - `LOG_SHIPPER_REQUEST_TIMEOUT_MS`: per-attempt network timeout (default: 5000)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// URL of the collector, e.g. `http://192.168.2.62:3000`
    pub endpoint: String,

    /// Identifier of this client
    pub device_id: String,

    /// Maximum records per transmission; 0 selects the default
    pub batch_size: usize,

    /// Normal drain period; zero selects the default
    pub flush_interval: Duration,

    /// Ingestion queue capacity; 0 selects the default
    pub buffer_capacity: usize,

    /// Reserved, currently inert
    pub enable_compression: bool,

    /// Location of the persistent overflow store; `None` disables overflow
    pub overflow_path: Option<PathBuf>,

    /// Bound on one connect/send/receive cycle; zero selects the default
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            device_id: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            enable_compression: false,
            overflow_path: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Create a configuration with default tuning for the given collector.
    pub fn new(endpoint: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn with_overflow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.overflow_path = Some(path.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the endpoint or device id is missing, or if a
    /// numeric setting is not a number or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = required_var(ENV_ENDPOINT)?;
        let device_id = required_var(ENV_DEVICE_ID)?;

        let batch_size = parse_var(ENV_BATCH_SIZE)?.unwrap_or(DEFAULT_BATCH_SIZE);
        check_range(ENV_BATCH_SIZE, batch_size, 1, MAX_BATCH_SIZE)?;

        let flush_interval_ms = parse_var(ENV_FLUSH_INTERVAL_MS)?
            .unwrap_or(DEFAULT_FLUSH_INTERVAL.as_millis() as u64);
        check_range(
            ENV_FLUSH_INTERVAL_MS,
            flush_interval_ms,
            MIN_FLUSH_INTERVAL_MS,
            MAX_FLUSH_INTERVAL_MS,
        )?;

        let buffer_capacity = parse_var(ENV_BUFFER_CAPACITY)?.unwrap_or(DEFAULT_BUFFER_CAPACITY);
        check_range(ENV_BUFFER_CAPACITY, buffer_capacity, 1, MAX_BUFFER_CAPACITY)?;

        let request_timeout_ms = parse_var(ENV_REQUEST_TIMEOUT_MS)?
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT.as_millis() as u64);
        check_range(ENV_REQUEST_TIMEOUT_MS, request_timeout_ms, 1, u64::MAX)?;

        let enable_compression = match env::var(ENV_ENABLE_COMPRESSION) {
            Ok(value) => parse_bool(ENV_ENABLE_COMPRESSION, &value)?,
            Err(_) => false,
        };

        let overflow_path = env::var(ENV_OVERFLOW_PATH)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            endpoint,
            device_id,
            batch_size,
            flush_interval: Duration::from_millis(flush_interval_ms),
            buffer_capacity,
            enable_compression,
            overflow_path,
            request_timeout: Duration::from_millis(request_timeout_ms),
        })
    }

    /// Apply defaults for zero values and validate the result.
    ///
    /// Returns the normalized configuration together with the parsed
    /// collector endpoint.
    pub fn normalize(mut self) -> Result<(Self, Endpoint), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("endpoint"));
        }
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Missing("device_id"));
        }
        if self.device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(ConfigError::Invalid {
                key: "device_id",
                message: format!("longer than {} bytes", MAX_DEVICE_ID_LEN),
            });
        }

        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        check_range("batch_size", self.batch_size, 1, MAX_BATCH_SIZE)?;

        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }

        if self.buffer_capacity == 0 {
            self.buffer_capacity = DEFAULT_BUFFER_CAPACITY;
        }
        check_range("buffer_capacity", self.buffer_capacity, 1, MAX_BUFFER_CAPACITY)?;

        if self.request_timeout.is_zero() {
            self.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }

        let endpoint = Endpoint::parse(&self.endpoint)?;
        Ok((self, endpoint))
    }
}

/// Collector address extracted from the configured URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parse `[scheme://]host[:port][/path]`, where `host` may be a
    /// bracketed IPv6 literal such as `[::1]`.
    ///
    /// The scheme and path are ignored; the port defaults to [`DEFAULT_PORT`].
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::Endpoint {
            endpoint: url.to_string(),
            message: message.to_string(),
        };
        let parse_port = |port: &str| {
            port.parse::<u16>()
                .map_err(|_| invalid("port is not a number between 0 and 65535"))
        };

        let trimmed = url.trim();
        let rest = match trimmed.find("://") {
            Some(idx) => &trimmed[idx + 3..],
            None => trimmed,
        };
        let authority = rest.split('/').next().unwrap_or_default();

        // IPv6 literals keep their brackets so the host drops straight into a URL
        let (host, port) = if authority.starts_with('[') {
            let close = authority
                .find(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let (host, tail) = authority.split_at(close + 1);
            let port = match tail {
                "" => DEFAULT_PORT,
                _ => match tail.strip_prefix(':') {
                    Some(port) => parse_port(port)?,
                    None => return Err(invalid("unexpected text after IPv6 address")),
                },
            };
            if host == "[]" {
                return Err(invalid("host is empty"));
            }
            (host, port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (authority, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        if port == 0 {
            return Err(invalid("port must not be 0"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn required_var(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key,
                message: format!("'{}' is not a valid number", value),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            message: format!("'{}' is not a boolean", value),
        }),
    }
}

fn check_range<T>(key: &'static str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + fmt::Display,
{
    if value < min {
        return Err(ConfigError::Invalid {
            key,
            message: format!("{} is below minimum ({})", value, min),
        });
    }
    if value > max {
        return Err(ConfigError::Invalid {
            key,
            message: format!("{} exceeds maximum ({})", value, max),
        });
    }
    Ok(())
}
