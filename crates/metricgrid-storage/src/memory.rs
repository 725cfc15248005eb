//! In-memory storage backend.
//!
//! Keeps rows in per-model maps and records every batch it receives, so
//! tests can assert on exactly what the sweep wrote.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use metricgrid_core::{Record, StoredRecord};

use crate::dao::StorageDao;
use crate::error::{StorageError, StorageResult};
use crate::model::{Model, row_id};

/// One `batch_write` call as received.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub model: String,
    pub inserts: Vec<Record>,
    pub updates: Vec<Record>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<HashMap<String, BTreeMap<String, StoredRecord>>>,
    log: Mutex<Vec<WriteBatch>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail with [`StorageError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Batches received so far.
    pub fn writes(&self) -> Vec<WriteBatch> {
        self.log.lock().clone()
    }

    /// Every row currently stored for `model`, ordered by bucket and key.
    pub fn rows(&self, model: &Model) -> StorageResult<Vec<Record>> {
        let tables = self.tables.lock();
        let Some(table) = tables.get(&model.name) else {
            return Ok(Vec::new());
        };
        table
            .values()
            .map(|stored| {
                Record::from_stored(model.schema.clone(), stored.clone()).map_err(StorageError::from)
            })
            .collect()
    }
}

impl StorageDao for MemoryStorage {
    fn exists(&self, model: &Model, key: &str, time_bucket: i64) -> StorageResult<Option<Record>> {
        let tables = self.tables.lock();
        let stored = tables
            .get(&model.name)
            .and_then(|t| t.get(&row_id(key, time_bucket)))
            .cloned();
        drop(tables);
        match stored {
            Some(stored) => Ok(Some(Record::from_stored(model.schema.clone(), stored)?)),
            None => Ok(None),
        }
    }

    fn batch_write(&self, model: &Model, inserts: Vec<Record>, updates: Vec<Record>) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{} is failing", model.name)));
        }

        {
            let mut tables = self.tables.lock();
            let table = tables.entry(model.name.clone()).or_default();
            for record in inserts.iter().chain(&updates) {
                table.insert(row_id(record.key(), record.time_bucket()), record.to_stored());
            }
        }
        debug!(
            model = %model.name,
            inserts = inserts.len(),
            updates = updates.len(),
            "memory batch written"
        );
        self.log.lock().push(WriteBatch {
            model: model.name.clone(),
            inserts,
            updates,
        });
        Ok(())
    }
}
