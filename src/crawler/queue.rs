//! The in-memory fetch queue shared by the feeder and the workers

use crate::record::FetchRecord;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// FIFO of records waiting for a worker
///
/// Holds no bound itself; the feeder keeps it near its target size.
#[derive(Debug, Default)]
pub struct FetchQueue {
    records: Mutex<VecDeque<FetchRecord>>,
    total: AtomicUsize,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record; never blocks on capacity
    pub fn add_record(&self, record: FetchRecord) {
        let mut records = self.lock();
        records.push_back(record);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes the oldest record, or `None` when the queue is empty
    pub fn take_record(&self) -> Option<FetchRecord> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Records ever added
    pub fn total_enqueued(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Drops every queued record and returns how many there were
    pub fn clear(&self) -> usize {
        let mut records = self.lock();
        let dropped = records.len();
        records.clear();
        dropped
    }

    /// Logs the URLs still queued
    pub fn dump(&self) {
        let records = self.lock();
        for record in records.iter() {
            debug!("Queued: {}", record.brief());
        }
    }

    // A panic while holding the lock leaves the deque intact, so a poisoned
    // lock is still usable.
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<FetchRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
