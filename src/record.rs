//! Log record model shared by every buffering tier.
//!
//! A [`LogRecord`] is an immutable value: module and message are bounded at
//! construction time and the record is copied by value into whichever tier
//! holds it (memory queue, overflow slot, or an in-flight batch).

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::Serialize;

/// Maximum number of meaningful bytes in a module name.
pub const MAX_MODULE_LEN: usize = 31;

/// Maximum number of meaningful bytes in a formatted message.
pub const MAX_MESSAGE_LEN: usize = 255;

/// Module name used when the caller supplies an empty one.
const UNKNOWN_MODULE: &str = "unknown";

const TIMESTAMP_FIELD: usize = 8;
const LEVEL_FIELD: usize = 1;
const MODULE_FIELD: usize = MAX_MODULE_LEN + 1;
const MESSAGE_FIELD: usize = MAX_MESSAGE_LEN + 1;

const MODULE_OFFSET: usize = TIMESTAMP_FIELD + LEVEL_FIELD;
const MESSAGE_OFFSET: usize = MODULE_OFFSET + MODULE_FIELD;

/// Size of one persisted record slot in the overflow file.
pub const RECORD_SLOT_SIZE: usize = MESSAGE_OFFSET + MESSAGE_FIELD;

/// Last timestamp handed out, used to keep record timestamps non-decreasing.
static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

/// Log severity levels understood by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Get all possible log levels, most severe first.
    pub fn all() -> &'static [LogLevel] {
        &[LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug]
    }

    /// Wire name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Warn => 1,
            LogLevel::Info => 2,
            LogLevel::Debug => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(LogLevel::Error),
            1 => Some(LogLevel::Warn),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log event waiting to be shipped.
///
/// Serializes to the collector's per-record shape:
/// `{"timestamp", "level", "module", "message"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    timestamp: i64,
    level: LogLevel,
    module: String,
    message: String,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    ///
    /// Module and message are truncated to [`MAX_MODULE_LEN`] and
    /// [`MAX_MESSAGE_LEN`] bytes on a character boundary.
    pub fn new(level: LogLevel, module: &str, message: &str) -> Self {
        Self::with_timestamp(now_millis(), level, module, message)
    }

    /// Create a record whose message is produced by a bounded formatter.
    ///
    /// Formatting stops silently once [`MAX_MESSAGE_LEN`] bytes are written.
    pub fn from_args(level: LogLevel, module: &str, args: fmt::Arguments<'_>) -> Self {
        let message = format_bounded(args, MAX_MESSAGE_LEN);
        Self::with_timestamp(now_millis(), level, module, &message)
    }

    /// Create a record with an explicit timestamp (milliseconds since the Unix epoch).
    pub fn with_timestamp(timestamp: i64, level: LogLevel, module: &str, message: &str) -> Self {
        let module = bounded(module, MAX_MODULE_LEN);
        let module = if module.is_empty() {
            UNKNOWN_MODULE
        } else {
            module
        };

        Self {
            timestamp,
            level,
            module: module.to_owned(),
            message: bounded(message, MAX_MESSAGE_LEN).to_owned(),
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Encode into a fixed-size overflow slot.
    ///
    /// Layout: timestamp (i64 LE), level byte, module and message as
    /// NUL-padded fields of 32 and 256 bytes.
    pub(crate) fn encode_slot(&self) -> [u8; RECORD_SLOT_SIZE] {
        let mut slot = [0u8; RECORD_SLOT_SIZE];
        slot[..TIMESTAMP_FIELD].copy_from_slice(&self.timestamp.to_le_bytes());
        slot[TIMESTAMP_FIELD] = self.level.to_byte();

        let module = self.module.as_bytes();
        slot[MODULE_OFFSET..MODULE_OFFSET + module.len()].copy_from_slice(module);

        let message = self.message.as_bytes();
        slot[MESSAGE_OFFSET..MESSAGE_OFFSET + message.len()].copy_from_slice(message);

        slot
    }

    /// Decode a slot written by [`LogRecord::encode_slot`].
    ///
    /// Returns `None` for an unknown level byte or non UTF-8 text.
    pub(crate) fn decode_slot(slot: &[u8; RECORD_SLOT_SIZE]) -> Option<Self> {
        let mut timestamp = [0u8; TIMESTAMP_FIELD];
        timestamp.copy_from_slice(&slot[..TIMESTAMP_FIELD]);

        let level = LogLevel::from_byte(slot[TIMESTAMP_FIELD])?;
        let module = read_padded(&slot[MODULE_OFFSET..MESSAGE_OFFSET])?;
        let message = read_padded(&slot[MESSAGE_OFFSET..])?;

        Some(Self {
            timestamp: i64::from_le_bytes(timestamp),
            level,
            module,
            message,
        })
    }
}

/// Current time in milliseconds since the Unix epoch, never going backwards
/// across calls within this process.
pub fn now_millis() -> i64 {
    let wall = Utc::now().timestamp_millis();
    let previous = LAST_TIMESTAMP_MS.fetch_max(wall, Ordering::AcqRel);
    previous.max(wall)
}

/// Format `args` into a string of at most `limit` bytes.
///
/// Output past the limit is discarded; the cut always lands on a character
/// boundary so the result stays valid UTF-8.
pub fn format_bounded(args: fmt::Arguments<'_>, limit: usize) -> String {
    let mut writer = BoundedWriter {
        buf: String::with_capacity(limit.min(64)),
        limit,
        full: false,
    };
    // BoundedWriter never reports an error; a failing Display impl simply
    // leaves whatever it wrote so far.
    let _ = fmt::write(&mut writer, args);
    writer.buf
}

/// Last path segment of a `module_path!()` string.
pub fn module_name(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

struct BoundedWriter {
    buf: String,
    limit: usize,
    full: bool,
}

impl fmt::Write for BoundedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.full {
            return Ok(());
        }

        let room = self.limit - self.buf.len();
        if s.len() <= room {
            self.buf.push_str(s);
        } else {
            let cut = floor_char_boundary(s, room);
            self.buf.push_str(&s[..cut]);
            self.full = true;
        }
        Ok(())
    }
}

/// Text up to the first NUL, cut to `limit` bytes.
fn bounded(s: &str, limit: usize) -> &str {
    let s = s.split('\0').next().unwrap_or_default();
    &s[..floor_char_boundary(s, limit)]
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn read_padded(field: &[u8]) -> Option<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).ok().map(str::to_owned)
}

/// Ship a record through a [`LogShipper`](crate::LogShipper), using the
/// calling module's name.
///
/// ```no_run
/// # async fn demo(shipper: edge_log_shipper::LogShipper) {
/// use edge_log_shipper::{ship_log, LogLevel};
///
/// let _ = ship_log!(shipper, LogLevel::Info, "door opened after {} ms", 120);
/// # }
/// ```
#[macro_export]
macro_rules! ship_log {
    ($shipper:expr, $level:expr, $($arg:tt)+) => {
        $shipper.add_fmt(
            $level,
            $crate::record::module_name(module_path!()),
            format_args!($($arg)+),
        )
    };
}

#[macro_export]
macro_rules! ship_error {
    ($shipper:expr, $($arg:tt)+) => {
        $crate::ship_log!($shipper, $crate::LogLevel::Error, $($arg)+)
    };
}

#[macro_export]
macro_rules! ship_warn {
    ($shipper:expr, $($arg:tt)+) => {
        $crate::ship_log!($shipper, $crate::LogLevel::Warn, $($arg)+)
    };
}

#[macro_export]
macro_rules! ship_info {
    ($shipper:expr, $($arg:tt)+) => {
        $crate::ship_log!($shipper, $crate::LogLevel::Info, $($arg)+)
    };
}

#[macro_export]
macro_rules! ship_debug {
    ($shipper:expr, $($arg:tt)+) => {
        $crate::ship_log!($shipper, $crate::LogLevel::Debug, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_wire_names() {
        let names: Vec<&str> = LogLevel::all().iter().map(LogLevel::as_str).collect();
        assert_eq!(names, vec!["error", "warn", "info", "debug"]);
        assert_eq!(format!("{}", LogLevel::Warn), "warn");
    }

    #[test]
    fn test_record_truncates_module_and_message() {
        let module = "m".repeat(40);
        let message = "x".repeat(300);
        let record = LogRecord::new(LogLevel::Info, &module, &message);

        assert_eq!(record.module().len(), MAX_MODULE_LEN);
        assert_eq!(record.message().len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // 'é' is two bytes, so 128 of them are 256 bytes
        let message = "é".repeat(128);
        let record = LogRecord::new(LogLevel::Info, "test", &message);

        assert_eq!(record.message().len(), 254);
        assert!(record.message().chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_empty_module_becomes_unknown() {
        let record = LogRecord::new(LogLevel::Debug, "", "hello");
        assert_eq!(record.module(), "unknown");
    }

    #[test]
    fn test_text_stops_at_nul() {
        let record = LogRecord::new(LogLevel::Info, "net\0junk", "before\0after");
        assert_eq!(record.module(), "net");
        assert_eq!(record.message(), "before");
    }

    #[test]
    fn test_format_bounded() {
        assert_eq!(format_bounded(format_args!("{}-{}", 1, 2), 10), "1-2");
        assert_eq!(format_bounded(format_args!("{}", "abcdef"), 4), "abcd");
        assert_eq!(format_bounded(format_args!("{}{}", "ab", "cdef"), 3), "abc");
    }

    #[test]
    fn test_from_args_applies_message_limit() {
        let record = LogRecord::from_args(
            LogLevel::Warn,
            "sensor",
            format_args!("{}", "y".repeat(1000)),
        );
        assert_eq!(record.message().len(), MAX_MESSAGE_LEN);
        assert_eq!(record.level(), LogLevel::Warn);
    }

    #[test]
    fn test_slot_roundtrip_preserves_record() {
        let record = LogRecord::with_timestamp(
            1_700_000_000_123,
            LogLevel::Error,
            "battery",
            "voltage \"low\" at 3.1V",
        );
        let slot = record.encode_slot();
        assert_eq!(slot.len(), RECORD_SLOT_SIZE);
        assert_eq!(LogRecord::decode_slot(&slot), Some(record));
    }

    #[test]
    fn test_decode_rejects_unknown_level() {
        let record = LogRecord::with_timestamp(1, LogLevel::Info, "m", "msg");
        let mut slot = record.encode_slot();
        slot[TIMESTAMP_FIELD] = 9;
        assert!(LogRecord::decode_slot(&slot).is_none());
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let first = LogRecord::new(LogLevel::Info, "a", "1");
        let second = LogRecord::new(LogLevel::Info, "a", "2");
        assert!(second.timestamp() >= first.timestamp());
        assert!(first.timestamp() > 0);
    }

    #[test]
    fn test_module_name_takes_last_segment() {
        assert_eq!(module_name("edge_log_shipper::shipper"), "shipper");
        assert_eq!(module_name("main"), "main");
    }

    #[test]
    fn test_record_serializes_to_wire_shape() {
        let record = LogRecord::with_timestamp(42, LogLevel::Debug, "mod", "msg");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "timestamp": 42,
                "level": "debug",
                "module": "mod",
                "message": "msg"
            })
        );
    }
}
