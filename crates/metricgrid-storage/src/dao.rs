//! The storage collaborator consumed by the persistence sweep.

use metricgrid_core::Record;

use crate::error::StorageResult;
use crate::model::Model;

/// Batched metric storage.
///
/// The sweep is the only writer; it never issues single-row writes.
pub trait StorageDao: Send + Sync {
    /// Stored row of `key` in bucket `time_bucket`, if any.
    fn exists(&self, model: &Model, key: &str, time_bucket: i64) -> StorageResult<Option<Record>>;

    /// Look up several rows at once. Missing rows are omitted.
    fn multi_get(&self, model: &Model, keys: &[(String, i64)]) -> StorageResult<Vec<Record>> {
        let mut found = Vec::new();
        for (key, bucket) in keys {
            if let Some(record) = self.exists(model, key, *bucket)? {
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Write new rows and replace existing ones in one batch.
    fn batch_write(&self, model: &Model, inserts: Vec<Record>, updates: Vec<Record>) -> StorageResult<()>;
}
