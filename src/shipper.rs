//! The log shipper client.
//!
//! [`LogShipper`] owns the two buffering tiers (the in-memory
//! [`IngestionQueue`] and the optional persistent [`OverflowStore`]), the
//! [`Transmitter`], the [`Backoff`] controller and a [`FlushTimer`] that
//! drains batches in the background.
//!
//! Producers call [`LogShipper::add`] from any task or thread. Both tiers
//! sit behind one lock that is never held across the network call, so a
//! slow collector never blocks producers. Scheduled drains and explicit
//! flushes are serialized by an async drain gate.
//!
//! Every batch is assembled overflow-first: records waiting in the
//! overflow store are sent before the ones in memory, even though they
//! were produced later than whatever stayed in memory when the queue
//! filled up.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffSnapshot};
use crate::config::{ClientConfig, ConfigError, Endpoint};
use crate::overflow::{ByteStore, FileStore, OverflowStore, StorageError};
use crate::queue::{IngestionQueue, PushOutcome};
use crate::record::{LogLevel, LogRecord};
use crate::scheduler::{DrainJob, FlushTimer};
use crate::transmit::Transmitter;
use crate::transport::{HttpTransport, Transport, TransportError};

/// Errors reported to callers of [`LogShipper`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The shipper was shut down
    #[error("log shipper is not initialized")]
    NotInitialized,

    /// The configuration was rejected at init
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Shipping is switched off with `enable(false)`
    #[error("log shipper is disabled")]
    Disabled,

    /// `init` was called outside a tokio runtime
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The HTTP transport could not be created
    #[error("failed to create transport: {0}")]
    Transport(#[from] TransportError),
}

/// Cumulative shipping counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShipperStats {
    /// Records accepted by the collector
    pub sent: u64,

    /// Records lost to eviction or to a full queue on re-queue
    pub dropped: u64,

    /// Transmission attempts that failed
    pub failed: u64,
}

/// Handle on a running log shipper. Cloning is cheap and every clone
/// refers to the same client.
#[derive(Clone)]
pub struct LogShipper {
    inner: Arc<Inner>,
}

impl fmt::Debug for LogShipper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogShipper")
            .field("endpoint", self.inner.transmitter.endpoint())
            .field("initialized", &self.is_initialized())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

struct Inner {
    config: ClientConfig,
    initialized: AtomicBool,
    enabled: AtomicBool,
    tiers: Mutex<Tiers>,
    transmitter: Transmitter,
    backoff: Mutex<Backoff>,
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    drain_gate: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
    timer: Mutex<Option<FlushTimer>>,
}

/// Both buffering tiers plus the mirrored overflow count.
struct Tiers {
    queue: IngestionQueue,
    overflow: Option<OverflowStore>,
    overflow_count: u32,
}

/// Result of sending one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Idle,
    Sent(usize),
    Failed,
}

impl LogShipper {
    /// Validate `config` and start a shipper that posts over HTTP.
    ///
    /// Zero values for `batch_size`, `flush_interval`, `buffer_capacity`
    /// and `request_timeout` select their defaults. If `overflow_path` is
    /// set, the overflow store is opened or created there; failing to do so
    /// only disables overflow for this session.
    ///
    /// # Errors
    ///
    /// - `ClientError::NoRuntime` outside a tokio runtime
    /// - `ClientError::InvalidConfig` for a missing or malformed setting
    pub fn init(config: ClientConfig) -> Result<Self, ClientError> {
        Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let (config, endpoint) = config.normalize()?;
        let transport = HttpTransport::new(config.request_timeout)?;
        let overflow = config
            .overflow_path
            .as_ref()
            .and_then(|path| open_overflow(FileStore::new(path)));

        Ok(Self::launch(config, endpoint, Arc::new(transport), overflow))
    }

    /// Like [`LogShipper::init`], delivering through `transport`.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ClientError> {
        Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let (config, endpoint) = config.normalize()?;
        let overflow = config
            .overflow_path
            .as_ref()
            .and_then(|path| open_overflow(FileStore::new(path)));

        Ok(Self::launch(config, endpoint, transport, overflow))
    }

    /// Like [`LogShipper::with_transport`], keeping overflow records in
    /// `store` instead of the configured path.
    pub fn with_overflow_store(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: impl ByteStore + 'static,
    ) -> Result<Self, ClientError> {
        Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let (config, endpoint) = config.normalize()?;
        let overflow = open_overflow(store);

        Ok(Self::launch(config, endpoint, transport, overflow))
    }

    fn launch(
        config: ClientConfig,
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        overflow: Option<(OverflowStore, u32)>,
    ) -> Self {
        let (overflow, overflow_count) = match overflow {
            Some((store, count)) => (Some(store), count),
            None => (None, 0),
        };

        info!(
            endpoint = %endpoint,
            device_id = %config.device_id,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            buffer_capacity = config.buffer_capacity,
            overflow = overflow.is_some(),
            restored = overflow_count,
            "Log shipper initialized"
        );

        let inner = Arc::new(Inner {
            transmitter: Transmitter::new(transport, config.device_id.clone(), endpoint),
            tiers: Mutex::new(Tiers {
                queue: IngestionQueue::new(config.buffer_capacity),
                overflow,
                overflow_count,
            }),
            initialized: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            backoff: Mutex::new(Backoff::default()),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            drain_gate: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
            timer: Mutex::new(None),
            config,
        });

        let timer = FlushTimer::spawn(
            Arc::downgrade(&inner),
            inner.config.flush_interval,
            inner.wake.clone(),
        );
        *lock(&inner.timer) = Some(timer);

        Self { inner }
    }

    /// Buffer a record. Never blocks on the network.
    ///
    /// While disabled the record is discarded and `Ok(())` is returned.
    pub fn add(&self, level: LogLevel, module: &str, message: &str) -> Result<(), ClientError> {
        self.ensure_initialized()?;
        if self.is_enabled() {
            self.inner.enqueue(LogRecord::new(level, module, message));
        }
        Ok(())
    }

    /// Buffer a record whose message is formatted from `args`, truncated
    /// to the maximum message length.
    pub fn add_fmt(
        &self,
        level: LogLevel,
        module: &str,
        args: fmt::Arguments<'_>,
    ) -> Result<(), ClientError> {
        self.ensure_initialized()?;
        if self.is_enabled() {
            self.inner.enqueue(LogRecord::from_args(level, module, args));
        }
        Ok(())
    }

    /// Send everything buffered now, overflow first, in batches.
    ///
    /// Stops at the first failed batch. Returns the number of records the
    /// collector accepted; failures are only visible through
    /// [`LogShipper::stats`] and [`LogShipper::backoff`]. The background
    /// timer restarts at the normal flush interval afterwards.
    pub async fn flush(&self) -> Result<usize, ClientError> {
        self.ensure_initialized()?;
        if !self.is_enabled() {
            return Err(ClientError::Disabled);
        }

        // Push back the pending timer run while flushing
        self.inner.rearm(self.inner.config.flush_interval);

        let sent = {
            let _gate = self.inner.drain_gate.lock().await;
            self.inner.drain_all().await
        };

        self.inner.rearm(self.inner.config.flush_interval);
        debug!(sent, "Flush complete");
        Ok(sent)
    }

    /// Run one drain cycle, exactly as the background timer does, and
    /// return the delay the timer would wait before the next one.
    pub async fn drain_cycle(&self) -> Duration {
        self.inner.run_cycle().await
    }

    pub fn enable(&self, enable: bool) {
        self.inner.enabled.store(enable, Ordering::SeqCst);
        info!("Log shipper {}", if enable { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Records waiting in the in-memory queue.
    pub fn buffer_count(&self) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        self.inner.lock_tiers().queue.len()
    }

    /// Records waiting in the overflow store.
    pub fn overflow_count(&self) -> u32 {
        if !self.is_initialized() {
            return 0;
        }
        self.inner.lock_tiers().overflow_count
    }

    pub fn stats(&self) -> ShipperStats {
        if !self.is_initialized() {
            return ShipperStats::default();
        }
        ShipperStats {
            sent: self.inner.sent.load(Ordering::SeqCst),
            dropped: self.inner.dropped.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
        }
    }

    pub fn backoff(&self) -> BackoffSnapshot {
        lock(&self.inner.backoff).snapshot()
    }

    /// Normalized configuration in effect.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Stop the background timer, make a final attempt to send everything
    /// buffered, then release all state.
    ///
    /// The final drain is skipped while disabled. Afterwards every
    /// operation on this shipper (and its clones) reports `NotInitialized`.
    pub async fn shutdown(&self) {
        if !self.inner.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        // The release runs in its own task so it completes even if the
        // caller stops waiting (e.g. under a timeout).
        let inner = self.inner.clone();
        if let Err(e) = tokio::spawn(async move { inner.shut_down().await }).await {
            warn!(error = %e, "Shutdown task panicked");
        }
    }

    fn ensure_initialized(&self) -> Result<(), ClientError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ClientError::NotInitialized)
        }
    }
}

impl Inner {
    fn lock_tiers(&self) -> MutexGuard<'_, Tiers> {
        lock(&self.tiers)
    }

    fn enqueue(&self, record: LogRecord) {
        let occupancy = {
            let mut tiers = self.lock_tiers();
            if let PushOutcome::Evicted(_) = tiers.push(record) {
                let total = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(dropped_total = total, "Log buffer full, dropped oldest record");
            }
            tiers.queue.len()
        };

        if occupancy >= self.config.batch_size {
            self.wake.notify_one();
        }
    }

    fn rearm(&self, delay: Duration) {
        if let Some(timer) = lock(&self.timer).as_ref() {
            timer.rearm(delay);
        }
    }

    /// Stop the timer, drain if enabled, then reset every tier and counter.
    async fn shut_down(&self) {
        let timer = lock(&self.timer).take();
        if let Some(timer) = timer {
            timer.shutdown().await;
        }

        let _gate = self.drain_gate.lock().await;

        if self.enabled.load(Ordering::SeqCst) {
            let sent = self.drain_all().await;
            info!(sent, "Final drain complete");
        }

        let discarded = self.lock_tiers().release();
        if discarded > 0 {
            warn!(discarded, "Discarding undelivered in-memory records at shutdown");
        }

        self.sent.store(0, Ordering::SeqCst);
        self.dropped.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        lock(&self.backoff).record_success();

        info!("Log shipper shut down");
    }

    /// One scheduled drain: at most one batch, then the next delay.
    async fn run_cycle(&self) -> Duration {
        let _gate = self.drain_gate.lock().await;

        if self.initialized.load(Ordering::SeqCst) && self.enabled.load(Ordering::SeqCst) {
            self.send_batch(false).await;
        }

        lock(&self.backoff).next_delay(self.config.flush_interval)
    }

    /// Send batches until both tiers are empty or one fails.
    async fn drain_all(&self) -> usize {
        let mut total = 0;
        while let BatchOutcome::Sent(sent) = self.send_batch(true).await {
            total += sent;
        }
        total
    }

    async fn send_batch(&self, bypass_breaker: bool) -> BatchOutcome {
        let batch = self.lock_tiers().take_batch(self.config.batch_size);
        if batch.is_empty() {
            return BatchOutcome::Idle;
        }

        let in_flight = InFlight {
            inner: self,
            records: batch,
        };
        let consecutive_failures = lock(&self.backoff).consecutive_failures();

        let result = self
            .transmitter
            .transmit(&in_flight.records, consecutive_failures, bypass_breaker)
            .await;
        let mut batch = in_flight.settle();

        match result {
            Ok(sent) => {
                self.sent.fetch_add(sent as u64, Ordering::SeqCst);
                lock(&self.backoff).record_success();

                if sent < batch.len() {
                    let rest = batch.split_off(sent);
                    self.requeue(rest);
                }
                BatchOutcome::Sent(sent)
            }
            Err(e) => {
                if e.is_attempt() {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                }
                let snapshot = {
                    let mut backoff = lock(&self.backoff);
                    backoff.record_failure();
                    backoff.snapshot()
                };
                warn!(
                    error = %e,
                    records = batch.len(),
                    consecutive_failures = snapshot.consecutive_failures,
                    retry_in_ms = snapshot.delay.as_millis() as u64,
                    "Failed to ship log batch"
                );

                self.requeue(batch);
                BatchOutcome::Failed
            }
        }
    }

    fn requeue(&self, records: Vec<LogRecord>) {
        let lost = self.lock_tiers().requeue(records);
        if lost > 0 {
            let total = self.dropped.fetch_add(lost as u64, Ordering::SeqCst) + lost as u64;
            warn!(
                lost,
                dropped_total = total,
                "Log buffer full, dropped records from unsent batch"
            );
        }
    }
}

/// Records taken out of the tiers for one transmission.
///
/// If the sending future is dropped before the outcome is known, the
/// records go back to the front of the queue like a failed batch.
struct InFlight<'a> {
    inner: &'a Inner,
    records: Vec<LogRecord>,
}

impl InFlight<'_> {
    /// The transmission finished; hand the records back to the caller.
    fn settle(mut self) -> Vec<LogRecord> {
        std::mem::take(&mut self.records)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.records.is_empty() {
            return;
        }
        warn!(
            records = self.records.len(),
            "Transmission cancelled, returning batch to the queue"
        );
        self.inner.requeue(std::mem::take(&mut self.records));
    }
}

#[async_trait]
impl DrainJob for Inner {
    async fn run(&self) -> Duration {
        self.run_cycle().await
    }
}

impl Tiers {
    /// Queue a record, spilling to the overflow store when memory is full.
    fn push(&mut self, record: LogRecord) -> PushOutcome {
        if self.queue.is_full() && self.spill(&record) {
            return PushOutcome::Stored;
        }
        self.queue.push(record)
    }

    fn spill(&mut self, record: &LogRecord) -> bool {
        let Some(store) = &self.overflow else {
            return false;
        };

        match store.write(record) {
            Ok(()) => {
                self.overflow_count += 1;
                true
            }
            Err(StorageError::CapacityExceeded { .. }) => false,
            Err(e) => {
                self.disable_overflow(&e);
                false
            }
        }
    }

    /// Up to `batch_size` records, overflow store first.
    fn take_batch(&mut self, batch_size: usize) -> Vec<LogRecord> {
        let mut batch = Vec::with_capacity(batch_size);

        while batch.len() < batch_size && self.overflow_count > 0 {
            let Some(store) = &self.overflow else {
                break;
            };

            match store.read_oldest() {
                Ok(record) => {
                    self.overflow_count -= 1;
                    batch.push(record);
                }
                Err(StorageError::Empty) => {
                    warn!(
                        expected = self.overflow_count,
                        "Overflow store unexpectedly empty, resetting count"
                    );
                    self.overflow_count = 0;
                }
                Err(e) => self.disable_overflow(&e),
            }
        }

        while batch.len() < batch_size {
            match self.queue.pop_oldest() {
                Some(record) => batch.push(record),
                None => break,
            }
        }

        batch
    }

    /// Put unsent records back at the front of the queue. Returns how many
    /// did not fit.
    fn requeue(&mut self, records: Vec<LogRecord>) -> usize {
        let total = records.len();
        total - self.queue.requeue_front(records)
    }

    fn disable_overflow(&mut self, error: &StorageError) {
        warn!(
            error = %error,
            stranded = self.overflow_count,
            "Overflow store failed, continuing with memory only"
        );
        self.overflow = None;
        self.overflow_count = 0;
    }

    /// Drop everything; returns the number of in-memory records discarded.
    fn release(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        self.overflow = None;
        self.overflow_count = 0;
        discarded
    }
}

fn open_overflow(store: impl ByteStore + 'static) -> Option<(OverflowStore, u32)> {
    let opened = OverflowStore::open_or_create(store).and_then(|store| {
        let count = store.len()?;
        Ok((store, count))
    });

    match opened {
        Ok(opened) => Some(opened),
        Err(e) => {
            warn!(error = %e, "Overflow store unavailable, buffering in memory only");
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
