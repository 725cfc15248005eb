//! RedbStorage: embedded metric storage backed by redb.
//!
//! Each model is one redb table with `&str` row ids (`{time_bucket}:{key}`)
//! and JSON-serialized [`StoredRecord`] values. A batch is a single write
//! transaction, so it lands completely or not at all.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use tracing::debug;

use metricgrid_core::{Record, StoredRecord};

use crate::dao::StorageDao;
use crate::error::{StorageError, StorageResult};
use crate::model::{Model, row_id};

/// Convert any `Display` error into a `StorageError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StorageError::$variant(e.to_string())
    };
}

fn table(model: &Model) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(&model.name)
}

/// Thread-safe metric storage backed by redb.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        debug!(?path, "metric storage opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StorageResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        debug!("in-memory metric storage opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Every row stored for `model`, ordered by row id.
    pub fn rows(&self, model: &Model) -> StorageResult<Vec<Record>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = match txn.open_table(table(model)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Table(e.to_string())),
        };
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let stored: StoredRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(Record::from_stored(model.schema.clone(), stored)?);
        }
        Ok(results)
    }
}

impl StorageDao for RedbStorage {
    fn exists(&self, model: &Model, key: &str, time_bucket: i64) -> StorageResult<Option<Record>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = match txn.open_table(table(model)) {
            Ok(table) => table,
            // Nothing has been written to this model yet.
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(StorageError::Table(e.to_string())),
        };
        let id = row_id(key, time_bucket);
        match table.get(id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let stored: StoredRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(Record::from_stored(model.schema.clone(), stored)?))
            }
            None => Ok(None),
        }
    }

    fn batch_write(&self, model: &Model, inserts: Vec<Record>, updates: Vec<Record>) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table(model)).map_err(map_err!(Table))?;
            for record in inserts.iter().chain(&updates) {
                let id = row_id(record.key(), record.time_bucket());
                let value = serde_json::to_vec(&record.to_stored()).map_err(map_err!(Serialize))?;
                table
                    .insert(id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            model = %model.name,
            inserts = inserts.len(),
            updates = updates.len(),
            "batch written"
        );
        Ok(())
    }
}
