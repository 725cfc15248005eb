//! Workers of the metrics stream stages.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use metricgrid_core::{Record, RoleId};

use crate::error::GraphResult;
use crate::stage::{Outputs, Worker};
use crate::table::AggregationTable;

/// Pre-aggregates one batch locally, then tells each merged record to the
/// persist stage once.
pub struct AggregateWorker {
    next: RoleId,
    pending: HashMap<String, Record>,
}

impl AggregateWorker {
    pub fn new(next: RoleId) -> Self {
        Self {
            next,
            pending: HashMap::new(),
        }
    }
}

impl Worker for AggregateWorker {
    fn on_record(&mut self, record: Record, _out: &Outputs) -> GraphResult<()> {
        match self.pending.get_mut(record.key()) {
            Some(existing) => existing.merge_from(&record)?,
            None => {
                self.pending.insert(record.key().to_string(), record);
            }
        }
        Ok(())
    }

    fn on_batch_end(&mut self, out: &Outputs) {
        let flushed = self.pending.len();
        for (key, record) in self.pending.drain() {
            if let Err(e) = out.tell(self.next, record) {
                warn!(role = %self.next, %key, error = %e, "dropped aggregated record");
            }
        }
        trace!(role = %self.next, flushed, "aggregate batch flushed");
    }
}

/// Merges owned records into the stage's active aggregation table.
pub struct PersistWorker {
    table: Arc<AggregationTable>,
    buffer: Vec<Record>,
}

impl PersistWorker {
    pub fn new(table: Arc<AggregationTable>) -> Self {
        Self {
            table,
            buffer: Vec::new(),
        }
    }
}

impl Worker for PersistWorker {
    fn on_record(&mut self, record: Record, _out: &Outputs) -> GraphResult<()> {
        self.buffer.push(record);
        Ok(())
    }

    fn on_batch_end(&mut self, _out: &Outputs) {
        if !self.buffer.is_empty() {
            self.table.merge_batch(self.buffer.drain(..));
        }
    }
}
