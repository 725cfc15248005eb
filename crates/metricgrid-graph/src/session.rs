//! Session cache: rows this node persisted recently, kept so the next sweep
//! round can merge into them without reading storage.
//!
//! The owner of a key is the only node that writes its row, so a cached row
//! stays equal to the stored one until it is evicted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use metricgrid_core::Record;

#[derive(Debug)]
struct Entry {
    row: Record,
    touched: Instant,
}

#[derive(Debug)]
pub struct SessionCache {
    timeout: Duration,
    rows: Mutex<HashMap<String, Entry>>,
}

impl SessionCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            rows: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Copy of the cached row of `key`.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.rows.lock().get(key).map(|e| e.row.clone())
    }

    /// Remember rows that were just written.
    pub fn store(&self, rows: impl IntoIterator<Item = Record>) {
        let now = Instant::now();
        let mut cached = self.rows.lock();
        for row in rows {
            cached.insert(row.key().to_string(), Entry { row, touched: now });
        }
    }

    /// Drop rows not written within the timeout. Returns how many were
    /// dropped.
    pub fn evict_expired(&self) -> usize {
        self.evict_before(Instant::now())
    }

    fn evict_before(&self, now: Instant) -> usize {
        let mut cached = self.rows.lock();
        let before = cached.len();
        cached.retain(|_, e| now.saturating_duration_since(e.touched) < self.timeout);
        before - cached.len()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}
