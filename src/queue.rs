//! Fixed-capacity in-memory ingestion queue.
//!
//! The queue is the first tier records land in. It never grows past its
//! capacity: when full, the caller decides whether the record goes to the
//! overflow store, and otherwise [`IngestionQueue::push`] evicts the oldest
//! record to make room.

use std::collections::VecDeque;

use crate::record::LogRecord;

/// Result of pushing a record into the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// The record was appended and nothing was lost.
    Stored,

    /// The queue was full; the returned oldest record was evicted.
    Evicted(LogRecord),
}

/// Bounded FIFO ring buffer of log records.
#[derive(Debug)]
pub struct IngestionQueue {
    records: VecDeque<LogRecord>,
    capacity: usize,
}

impl IngestionQueue {
    /// Create a queue holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record, evicting the oldest one if the queue is full.
    pub fn push(&mut self, record: LogRecord) -> PushOutcome {
        let outcome = if self.is_full() {
            match self.records.pop_front() {
                Some(oldest) => PushOutcome::Evicted(oldest),
                None => PushOutcome::Stored,
            }
        } else {
            PushOutcome::Stored
        };

        self.records.push_back(record);
        outcome
    }

    /// Remove and return the oldest record.
    pub fn pop_oldest(&mut self) -> Option<LogRecord> {
        self.records.pop_front()
    }

    /// Put in-flight records back at the front of the queue.
    ///
    /// `records` must be in delivery order (oldest first). Only as many as
    /// fit are re-inserted; when space runs out the newest records of the
    /// batch are kept and the oldest are discarded. Returns the number of
    /// records actually re-queued.
    pub fn requeue_front(&mut self, records: Vec<LogRecord>) -> usize {
        let mut requeued = 0;
        for record in records.into_iter().rev() {
            if self.is_full() {
                break;
            }
            self.records.push_front(record);
            requeued += 1;
        }
        requeued
    }

    /// Drop every buffered record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Iterate over buffered records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
