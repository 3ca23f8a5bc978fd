//! Persistent overflow store.
//!
//! When the ingestion queue is full, records spill into a bounded FIFO kept
//! in a byte store so they survive restarts. The on-disk layout is a fixed
//! 20-byte header followed by a circular array of
//! [`MAX_OVERFLOW_RECORDS`] slots of [`RECORD_SLOT_SIZE`] bytes:
//!
//! ```text
//! +-------+---------+------------+-------------+------------+----------+-----+
//! | magic | version | total_logs | write_index | read_index | slot 0   | ... |
//! | u32LE | u32LE   | u32LE      | u32LE       | u32LE      | 297 bytes|     |
//! +-------+---------+------------+-------------+------------+----------+-----+
//! ```
//!
//! Every operation opens the backing resource, seeks, and drops the handle
//! before returning. The header is rewritten after each slot write, so a
//! crash between the slot write and the header write loses that record.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::record::{LogRecord, RECORD_SLOT_SIZE};

/// Header magic, "LOGS".
pub const OVERFLOW_MAGIC: u32 = 0x4C4F_4753;

/// Current file format version.
pub const OVERFLOW_VERSION: u32 = 1;

/// Maximum number of records the overflow store holds.
pub const MAX_OVERFLOW_RECORDS: u32 = 1000;

const HEADER_SIZE: usize = 20;

/// Errors that can occur during overflow store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Every slot is occupied
    #[error("overflow store is full ({capacity} records)")]
    CapacityExceeded { capacity: u32 },

    /// No records to read
    #[error("overflow store is empty")]
    Empty,

    /// Header or slot content failed validation
    #[error("overflow store is corrupt: {0}")]
    Corrupt(String),

    /// Backing resource could not be opened, read or written
    #[error("overflow store io error: {0}")]
    Io(#[from] io::Error),
}

/// A seekable handle on the backing resource.
pub trait StoreFile: Read + Write + Seek {}

impl<T: Read + Write + Seek> StoreFile for T {}

/// Append-capable, seekable byte storage the overflow store is kept in.
pub trait ByteStore: Send + Sync {
    /// Open the existing resource. Fails with `NotFound` if it was never created.
    fn open_existing(&self) -> io::Result<Box<dyn StoreFile>>;

    /// Create the resource, discarding any previous content.
    fn create(&self) -> io::Result<Box<dyn StoreFile>>;
}

/// Overflow storage in a regular file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteStore for FileStore {
    fn open_existing(&self) -> io::Result<Box<dyn StoreFile>> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(Box::new(file))
    }

    fn create(&self) -> io::Result<Box<dyn StoreFile>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(Box::new(file))
    }
}

/// Overflow storage kept in memory.
///
/// Clones share the same bytes, so dropping an [`OverflowStore`] and opening
/// a new one over a clone behaves like a process restart over the same file.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose resource already exists with the given content.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(Some(bytes))),
        }
    }

    /// Copy of the current content, `None` if never created.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ByteStore for MemoryStore {
    fn open_existing(&self) -> io::Result<Box<dyn StoreFile>> {
        let exists = self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();

        if !exists {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "memory store not created",
            ));
        }

        Ok(Box::new(MemoryFile {
            data: Arc::clone(&self.data),
            pos: 0,
        }))
    }

    fn create(&self) -> io::Result<Box<dyn StoreFile>> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(Vec::new());

        Ok(Box::new(MemoryFile {
            data: Arc::clone(&self.data),
            pos: 0,
        }))
    }
}

struct MemoryFile {
    data: Arc<Mutex<Option<Vec<u8>>>>,
    pos: u64,
}

impl MemoryFile {
    fn gone() -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, "memory store removed")
    }
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let data = guard.as_ref().ok_or_else(Self::gone)?;

        let start = usize::try_from(self.pos).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let data = guard.as_mut().ok_or_else(Self::gone)?;

        let start = usize::try_from(self.pos)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len) as i64;

        let next = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => u64::try_from(len + delta).ok(),
            SeekFrom::Current(delta) => u64::try_from(self.pos as i64 + delta).ok(),
        };

        let next = next.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start")
        })?;
        self.pos = next;
        Ok(next)
    }
}

/// Persisted header of the overflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OverflowHeader {
    magic: u32,
    version: u32,
    total_logs: u32,
    write_index: u32,
    read_index: u32,
}

impl OverflowHeader {
    fn fresh() -> Self {
        Self {
            magic: OVERFLOW_MAGIC,
            version: OVERFLOW_VERSION,
            total_logs: 0,
            write_index: 0,
            read_index: 0,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let fields = [
            self.magic,
            self.version,
            self.total_logs,
            self.write_index,
            self.read_index,
        ];
        for (chunk, field) in bytes.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut fields = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        let mut next = || fields.next().unwrap_or_default();

        Self {
            magic: next(),
            version: next(),
            total_logs: next(),
            write_index: next(),
            read_index: next(),
        }
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.magic != OVERFLOW_MAGIC {
            return Err(StorageError::Corrupt(format!(
                "bad magic {:#010x}",
                self.magic
            )));
        }
        if self.version != OVERFLOW_VERSION {
            return Err(StorageError::Corrupt(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.total_logs > MAX_OVERFLOW_RECORDS
            || self.write_index >= MAX_OVERFLOW_RECORDS
            || self.read_index >= MAX_OVERFLOW_RECORDS
        {
            return Err(StorageError::Corrupt(format!(
                "counters out of range (total {}, write {}, read {})",
                self.total_logs, self.write_index, self.read_index
            )));
        }
        Ok(())
    }
}

fn slot_offset(index: u32) -> u64 {
    (HEADER_SIZE + index as usize * RECORD_SLOT_SIZE) as u64
}

/// Bounded FIFO of log records over a [`ByteStore`].
pub struct OverflowStore {
    backend: Box<dyn ByteStore>,
}

impl OverflowStore {
    /// Open an existing overflow store or initialize a fresh one.
    ///
    /// An existing header with a wrong magic, version or out-of-range
    /// counters is reported as [`StorageError::Corrupt`].
    pub fn open_or_create(backend: impl ByteStore + 'static) -> Result<Self, StorageError> {
        let store = Self {
            backend: Box::new(backend),
        };

        match store.backend.open_existing() {
            Ok(mut file) => {
                let header = read_header(file.as_mut())?;
                if header.total_logs > 0 {
                    info!(
                        existing = header.total_logs,
                        "Found existing logs in overflow store"
                    );
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut file = store.backend.create()?;
                write_header(file.as_mut(), &OverflowHeader::fresh())?;
                debug!("Created empty overflow store");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(store)
    }

    /// Number of records currently stored, read from the persisted header.
    pub fn len(&self) -> Result<u32, StorageError> {
        let mut file = self.backend.open_existing()?;
        Ok(read_header(file.as_mut())?.total_logs)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> u32 {
        MAX_OVERFLOW_RECORDS
    }

    /// Append a record at the write position.
    pub fn write(&self, record: &LogRecord) -> Result<(), StorageError> {
        let mut file = self.backend.open_existing()?;
        let mut header = read_header(file.as_mut())?;

        if header.total_logs >= MAX_OVERFLOW_RECORDS {
            return Err(StorageError::CapacityExceeded {
                capacity: MAX_OVERFLOW_RECORDS,
            });
        }

        file.seek(SeekFrom::Start(slot_offset(header.write_index)))?;
        file.write_all(&record.encode_slot())?;

        header.write_index = (header.write_index + 1) % MAX_OVERFLOW_RECORDS;
        header.total_logs += 1;
        write_header(file.as_mut(), &header)
    }

    /// Remove and return the oldest record.
    pub fn read_oldest(&self) -> Result<LogRecord, StorageError> {
        let mut file = self.backend.open_existing()?;
        let mut header = read_header(file.as_mut())?;

        // total_logs decides emptiness: a full store also has read == write
        if header.total_logs == 0 {
            return Err(StorageError::Empty);
        }

        let mut slot = [0u8; RECORD_SLOT_SIZE];
        file.seek(SeekFrom::Start(slot_offset(header.read_index)))?;
        file.read_exact(&mut slot)?;

        let record = LogRecord::decode_slot(&slot).ok_or_else(|| {
            StorageError::Corrupt(format!("unreadable record in slot {}", header.read_index))
        })?;

        header.read_index = (header.read_index + 1) % MAX_OVERFLOW_RECORDS;
        header.total_logs -= 1;
        write_header(file.as_mut(), &header)?;

        Ok(record)
    }
}

fn read_header(file: &mut dyn StoreFile) -> Result<OverflowHeader, StorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut bytes).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => StorageError::Corrupt("truncated header".to_string()),
        _ => StorageError::Io(e),
    })?;

    let header = OverflowHeader::decode(&bytes);
    header.validate()?;
    Ok(header)
}

fn write_header(file: &mut dyn StoreFile, header: &OverflowHeader) -> Result<(), StorageError> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;
    use tempfile::tempdir;

    fn record(i: usize) -> LogRecord {
        LogRecord::with_timestamp(i as i64, LogLevel::Info, "overflow", &format!("log-{}", i))
    }

    #[test]
    fn test_create_writes_fresh_header() {
        let backend = MemoryStore::new();
        let store = OverflowStore::open_or_create(backend.clone()).unwrap();

        assert_eq!(store.len().unwrap(), 0);
        let bytes = backend.snapshot().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..4], &OVERFLOW_MAGIC.to_le_bytes());
    }

    #[test]
    fn test_write_then_read_is_fifo() {
        let store = OverflowStore::open_or_create(MemoryStore::new()).unwrap();
        for i in 0..5 {
            store.write(&record(i)).unwrap();
        }
        assert_eq!(store.len().unwrap(), 5);

        for i in 0..5 {
            assert_eq!(store.read_oldest().unwrap(), record(i));
        }
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_read_empty_store() {
        let store = OverflowStore::open_or_create(MemoryStore::new()).unwrap();
        assert!(matches!(store.read_oldest(), Err(StorageError::Empty)));
    }

    #[test]
    fn test_capacity_exceeded_when_full() {
        let store = OverflowStore::open_or_create(MemoryStore::new()).unwrap();
        assert_eq!(store.capacity(), MAX_OVERFLOW_RECORDS);
        for i in 0..store.capacity() as usize {
            store.write(&record(i)).unwrap();
        }

        let result = store.write(&record(9999));
        assert!(matches!(
            result,
            Err(StorageError::CapacityExceeded { capacity: 1000 })
        ));
        assert_eq!(store.len().unwrap(), MAX_OVERFLOW_RECORDS);

        // Full store has read == write but is not empty
        assert_eq!(store.read_oldest().unwrap(), record(0));
    }

    #[test]
    fn test_indices_wrap_around() {
        let store = OverflowStore::open_or_create(MemoryStore::new()).unwrap();

        for i in 0..MAX_OVERFLOW_RECORDS as usize {
            store.write(&record(i)).unwrap();
        }
        for _ in 0..10 {
            store.read_oldest().unwrap();
        }
        for i in 0..10 {
            store.write(&record(5000 + i)).unwrap();
        }

        assert_eq!(store.len().unwrap(), MAX_OVERFLOW_RECORDS);
        assert_eq!(store.read_oldest().unwrap(), record(10));
    }

    #[test]
    fn test_reopen_restores_fifo_state() {
        let backend = MemoryStore::new();
        {
            let store = OverflowStore::open_or_create(backend.clone()).unwrap();
            for i in 0..4 {
                store.write(&record(i)).unwrap();
            }
            store.read_oldest().unwrap();
        }

        let reopened = OverflowStore::open_or_create(backend).unwrap();
        assert_eq!(reopened.len().unwrap(), 3);
        for i in 1..4 {
            assert_eq!(reopened.read_oldest().unwrap(), record(i));
        }
    }

    #[test]
    fn test_file_store_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("overflow.bin");

        let backend = FileStore::new(&path);
        assert_eq!(backend.path(), path.as_path());

        {
            let store = OverflowStore::open_or_create(backend).unwrap();
            for i in 0..3 {
                store.write(&record(i)).unwrap();
            }
        }

        let store = OverflowStore::open_or_create(FileStore::new(&path)).unwrap();
        assert_eq!(store.len().unwrap(), 3);
        let restored: Vec<LogRecord> = (0..3).map(|_| store.read_oldest().unwrap()).collect();
        assert_eq!(restored, vec![record(0), record(1), record(2)]);
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let mut bytes = OverflowHeader::fresh().encode().to_vec();
        bytes[0] ^= 0xFF;

        let result = OverflowStore::open_or_create(MemoryStore::from_bytes(bytes));
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_wrong_version_is_corrupt() {
        let header = OverflowHeader {
            version: 7,
            ..OverflowHeader::fresh()
        };
        let result = OverflowStore::open_or_create(MemoryStore::from_bytes(header.encode().to_vec()));
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_header_is_corrupt() {
        let result = OverflowStore::open_or_create(MemoryStore::from_bytes(vec![0x53, 0x47]));
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_out_of_range_counters_are_corrupt() {
        let header = OverflowHeader {
            total_logs: MAX_OVERFLOW_RECORDS + 1,
            ..OverflowHeader::fresh()
        };
        let result = OverflowStore::open_or_create(MemoryStore::from_bytes(header.encode().to_vec()));
        assert!(matches!(result, Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_header_roundtrip() {
        let header = OverflowHeader {
            total_logs: 3,
            write_index: 7,
            read_index: 4,
            ..OverflowHeader::fresh()
        };
        assert_eq!(OverflowHeader::decode(&header.encode()), header);
    }
}
