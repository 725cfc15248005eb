//! AggregationTable: the active in-memory accumulation of a stage.
//!
//! Merges and the sweep's retire share one short lock. `retire` swaps the
//! whole map for an empty one, so a merge lands either in the map being
//! retired or in its replacement, never in both and never nowhere.

use std::collections::HashMap;
use std::mem;

use parking_lot::Mutex;
use tracing::warn;

use metricgrid_core::{MergeResult, Record};

#[derive(Debug, Default)]
pub struct AggregationTable {
    active: Mutex<HashMap<String, Record>>,
}

impl AggregationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one record into the active table. On error the table is unchanged.
    pub fn merge(&self, record: Record) -> MergeResult<()> {
        let mut active = self.active.lock();
        match active.get_mut(record.key()) {
            Some(existing) => existing.merge_from(&record),
            None => {
                active.insert(record.key().to_string(), record);
                Ok(())
            }
        }
    }

    /// Merge a batch under a single lock; rejected records are logged and
    /// skipped. Returns how many were rejected.
    pub fn merge_batch(&self, records: impl IntoIterator<Item = Record>) -> usize {
        let mut rejected = 0;
        let mut active = self.active.lock();
        for record in records {
            let result = match active.get_mut(record.key()) {
                Some(existing) => existing.merge_from(&record),
                None => {
                    active.insert(record.key().to_string(), record);
                    Ok(())
                }
            };
            if let Err(e) = result {
                rejected += 1;
                warn!(error = %e, "record rejected by aggregation table");
            }
        }
        rejected
    }

    /// Detach the active entries, leaving an empty table in their place.
    /// The caller owns the returned entries exclusively.
    pub fn retire(&self) -> HashMap<String, Record> {
        mem::take(&mut *self.active.lock())
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    /// Copy of one active entry.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.active.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use metricgrid_core::{MergeOperator, Schema, Value, ValueType};

    fn schema() -> Arc<Schema> {
        Schema::builder(1, "service_cpm")
            .column("total", ValueType::Long, MergeOperator::Sum)
            .build()
            .unwrap()
    }

    fn one(schema: &Arc<Schema>, entity: &str) -> Record {
        Record::new(Arc::clone(schema), entity, 202401010000)
            .with("total", 1_i64)
            .unwrap()
    }

    fn total(entries: &HashMap<String, Record>) -> i64 {
        entries
            .values()
            .map(|r| match r.get_by_name("total") {
                Some(Value::Long(v)) => v,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn merge_accumulates_per_key() {
        let schema = schema();
        let table = AggregationTable::new();
        table.merge(one(&schema, "a")).unwrap();
        table.merge(one(&schema, "a")).unwrap();
        table.merge(one(&schema, "b")).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get("a_202401010000").unwrap().get_by_name("total"),
            Some(Value::Long(2))
        );
    }

    #[test]
    fn rejected_merge_keeps_existing_entry() {
        let schema = schema();
        let other = Schema::builder(2, "other")
            .column("total", ValueType::Long, MergeOperator::Sum)
            .build()
            .unwrap();
        let table = AggregationTable::new();
        table.merge(one(&schema, "a")).unwrap();
        assert!(table.merge(one(&other, "a")).is_err());
        assert_eq!(table.merge_batch(vec![one(&other, "a"), one(&schema, "a")]), 1);
        assert_eq!(
            table.get("a_202401010000").unwrap().get_by_name("total"),
            Some(Value::Long(2))
        );
    }

    #[test]
    fn retire_concurrent_with_merges_loses_nothing() {
        let schema = schema();
        let table = Arc::new(AggregationTable::new());
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let table = Arc::clone(&table);
                let schema = Arc::clone(&schema);
                thread::spawn(move || {
                    for i in 0..5_000 {
                        table.merge(one(&schema, &format!("e{}", (w + i) % 7))).unwrap();
                    }
                })
            })
            .collect();

        let sweeper = {
            let table = Arc::clone(&table);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut swept = 0;
                while !done.load(Ordering::SeqCst) {
                    swept += total(&table.retire());
                    thread::yield_now();
                }
                swept
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        let swept = sweeper.join().unwrap() + total(&table.retire());
        assert_eq!(swept, 4 * 5_000);
    }
}
