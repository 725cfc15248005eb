//! PersistenceSweep: periodic retire-and-persist of aggregation tables.
//!
//! Each round walks the registered targets in registration order. For a
//! target it retires the active table, feeds the retired entries into the
//! target's down-sampling stages, then merges them with what storage holds
//! and writes them in batches. A failing batch or target is logged and
//! counted; the remaining targets are still swept.
//!
//! A target with a [`SessionCache`] reads storage only for keys it has not
//! written recently. An insert-only target never updates a stored row; a
//! later value for it is skipped.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use metricgrid_core::{DownSampling, Record};
use metricgrid_metrics::{Counter, Histogram, LATENCY_BUCKETS_MS, MetricsRegistry};
use metricgrid_storage::{Model, StorageDao, StorageResult};

use crate::error::GraphResult;
use crate::session::SessionCache;
use crate::stage::Stage;
use crate::table::AggregationTable;

/// Timer and batching parameters of the sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    pub initial_delay: Duration,
    /// Upper bound on inserts plus updates per `batch_write`.
    pub max_batch_size: usize,
    /// Session cache timeout of metrics stream targets. `None` disables the
    /// cache.
    pub session_timeout: Option<Duration>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(25),
            initial_delay: Duration::from_secs(10),
            max_batch_size: 2000,
            session_timeout: Some(Duration::from_secs(70)),
        }
    }
}

/// A coarser level fed from a target's retired entries.
pub struct Rollup {
    pub level: DownSampling,
    /// Routed stage owning the coarser rows.
    pub stage: Arc<Stage>,
    /// Local table of that stage, merged into directly when this node owns
    /// the rolled-up key.
    pub table: Arc<AggregationTable>,
}

/// One aggregation table and where its rows are stored.
pub struct SweepTarget {
    pub name: String,
    pub model: Model,
    pub table: Arc<AggregationTable>,
    pub rollups: Vec<Rollup>,
    pub session: Option<SessionCache>,
    /// Merge new values into stored rows. When false, a stored row is final.
    pub support_update: bool,
}

impl SweepTarget {
    pub fn new(name: impl Into<String>, model: Model, table: Arc<AggregationTable>) -> Self {
        Self {
            name: name.into(),
            model,
            table,
            rollups: Vec::new(),
            session: None,
            support_update: true,
        }
    }

    pub fn with_session(mut self, timeout: Duration) -> Self {
        self.session = Some(SessionCache::new(timeout));
        self
    }

    pub fn insert_only(mut self) -> Self {
        self.support_update = false;
        self
    }
}

/// Outcome of one target in one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub retired: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Entries of an insert-only target whose row was already stored.
    pub skipped: usize,
    pub dropped: usize,
}

/// Outcome of one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stages: Vec<StageReport>,
}

impl SweepReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn written(&self) -> usize {
        self.stages.iter().map(|s| s.inserted + s.updated).sum()
    }

    pub fn dropped(&self) -> usize {
        self.stages.iter().map(|s| s.dropped).sum()
    }

    pub fn skipped(&self) -> usize {
        self.stages.iter().map(|s| s.skipped).sum()
    }
}

#[derive(Default)]
struct ChunkOutcome {
    inserted: usize,
    updated: usize,
    skipped: usize,
    dropped: usize,
}

/// Re-bucket one entry and hand it to its owner at `rollup.level`.
/// Returns whether it was forwarded to another peer.
fn roll_one(rollup: &Rollup, record: &Record) -> GraphResult<bool> {
    let rolled = record.rebucket(rollup.level)?;
    match rollup.stage.owner(&rolled)? {
        None => {
            rollup.table.merge(rolled)?;
            Ok(false)
        }
        Some(peer) => {
            rollup.stage.push_remote(&peer, &rolled)?;
            Ok(true)
        }
    }
}

pub struct PersistenceSweep {
    targets: Vec<SweepTarget>,
    storage: Arc<dyn StorageDao>,
    config: SweepConfig,
    /// Serializes rounds; the timer and shutdown may race.
    round: Mutex<()>,
    errors: Arc<Counter>,
    written: Arc<Counter>,
    latency: Arc<Histogram>,
}

impl PersistenceSweep {
    pub fn new(
        targets: Vec<SweepTarget>,
        storage: Arc<dyn StorageDao>,
        config: SweepConfig,
        telemetry: &MetricsRegistry,
    ) -> Self {
        Self {
            targets,
            storage,
            config,
            round: Mutex::new(()),
            errors: telemetry.counter(
                "persistence_sweep_error_count",
                "Failed storage batches and sweep targets.",
                &[],
            ),
            written: telemetry.counter(
                "persistence_written_count",
                "Rows inserted or updated by the sweep.",
                &[],
            ),
            latency: telemetry.histogram(
                "persistence_sweep_latency_ms",
                "Duration of one sweep round.",
                &[],
                LATENCY_BUCKETS_MS,
            ),
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn targets(&self) -> &[SweepTarget] {
        &self.targets
    }

    /// Run one round over every target.
    pub fn sweep_once(&self) -> SweepReport {
        let _round = self.round.lock();
        let started = Instant::now();
        let mut report = SweepReport::default();

        for target in &self.targets {
            match panic::catch_unwind(AssertUnwindSafe(|| self.sweep_target(target))) {
                Ok(stage) => report.stages.push(stage),
                Err(_) => {
                    self.errors.inc();
                    error!(stage = %target.name, "sweep of stage panicked");
                    report.stages.push(StageReport {
                        name: target.name.clone(),
                        ..StageReport::default()
                    });
                }
            }
        }

        let elapsed = started.elapsed();
        self.latency.observe(elapsed.as_secs_f64() * 1000.0);
        debug!(
            written = report.written(),
            dropped = report.dropped(),
            elapsed = ?elapsed,
            "sweep finished"
        );
        report
    }

    fn sweep_target(&self, target: &SweepTarget) -> StageReport {
        let mut report = StageReport {
            name: target.name.clone(),
            ..StageReport::default()
        };
        if let Some(session) = &target.session {
            let evicted = session.evict_expired();
            if evicted > 0 {
                debug!(stage = %target.name, evicted, "session rows expired");
            }
        }
        let retired = target.table.retire();
        report.retired = retired.len();
        if retired.is_empty() {
            return report;
        }

        let mut entries: Vec<Record> = retired.into_values().collect();
        self.roll_up(target, &entries);

        let limit = self.config.max_batch_size.max(1);
        while !entries.is_empty() {
            let rest = entries.split_off(limit.min(entries.len()));
            let chunk = std::mem::replace(&mut entries, rest);
            let size = chunk.len();
            match self.write_chunk(target, chunk) {
                Ok(outcome) => {
                    report.inserted += outcome.inserted;
                    report.updated += outcome.updated;
                    report.skipped += outcome.skipped;
                    report.dropped += outcome.dropped;
                    self.written.add((outcome.inserted + outcome.updated) as u64);
                }
                Err(e) => {
                    self.errors.inc();
                    report.dropped += size;
                    error!(stage = %target.name, model = %target.model.name, size, error = %e, "storage batch failed, entries dropped");
                }
            }
        }
        report
    }

    /// Feed retired entries into the coarser levels of the same stream.
    fn roll_up(&self, target: &SweepTarget, entries: &[Record]) {
        for rollup in &target.rollups {
            let mut forwarded = 0;
            let mut failed = 0;
            let mut last_error = None;
            for record in entries {
                match roll_one(rollup, record) {
                    Ok(true) => forwarded += 1,
                    Ok(false) => {}
                    Err(e) => {
                        failed += 1;
                        last_error = Some(e.to_string());
                    }
                }
            }
            if let Some(error) = last_error {
                warn!(stage = %target.name, level = ?rollup.level, failed, %error, "down-sampling entries dropped");
            }
            debug!(stage = %target.name, level = ?rollup.level, forwarded, "down-sampling fed");
        }
    }

    fn write_chunk(&self, target: &SweepTarget, chunk: Vec<Record>) -> StorageResult<ChunkOutcome> {
        let model = &target.model;
        let session = target.session.as_ref();

        let mut stored: HashMap<String, Record> = HashMap::with_capacity(chunk.len());
        let mut missing: Vec<(String, i64)> = Vec::new();
        for record in &chunk {
            match session.and_then(|s| s.get(record.key())) {
                Some(row) => {
                    stored.insert(record.key().to_string(), row);
                }
                None => missing.push((record.key().to_string(), record.time_bucket())),
            }
        }
        if !missing.is_empty() {
            stored.extend(
                self.storage
                    .multi_get(model, &missing)?
                    .into_iter()
                    .map(|r| (r.key().to_string(), r)),
            );
        }

        let mut outcome = ChunkOutcome::default();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for record in chunk {
            match stored.remove(record.key()) {
                None => inserts.push(record),
                Some(_) if !target.support_update => outcome.skipped += 1,
                Some(mut existing) => match existing.merge_from(&record) {
                    Ok(()) => updates.push(existing),
                    Err(e) => {
                        outcome.dropped += 1;
                        warn!(model = %model.name, key = record.key(), error = %e, "cannot merge with stored row");
                    }
                },
            }
        }

        outcome.inserted = inserts.len();
        outcome.updated = updates.len();
        if outcome.inserted + outcome.updated == 0 {
            return Ok(outcome);
        }
        let written: Vec<Record> = match session {
            Some(_) => inserts.iter().chain(updates.iter()).cloned().collect(),
            None => Vec::new(),
        };
        self.storage.batch_write(model, inserts, updates)?;
        if let Some(session) = session {
            session.store(written);
        }
        Ok(outcome)
    }

    /// Sweep every `interval` after `initial_delay` until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.initial_delay) => {}
            _ = shutdown.changed() => return,
        }
        info!(interval = ?self.config.interval, targets = self.targets.len(), "persistence sweep started");

        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sweep = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || sweep.sweep_once()).await {
                        error!(error = %e, "sweep task failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("persistence sweep shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricgrid_core::{MergeOperator, Schema, Value, ValueType};
    use metricgrid_storage::{MemoryStorage, StorageError};

    fn schema() -> Arc<Schema> {
        Schema::builder(1, "service_cpm")
            .column("total", ValueType::Long, MergeOperator::Sum)
            .column("latency", ValueType::Long, MergeOperator::Avg)
            .build()
            .unwrap()
    }

    fn record(schema: &Arc<Schema>, entity: &str, total: i64) -> Record {
        Record::new(Arc::clone(schema), entity, 202401010000)
            .with("total", total)
            .unwrap()
            .with("latency", total * 10)
            .unwrap()
    }

    fn target(name: &str, schema: &Arc<Schema>) -> SweepTarget {
        SweepTarget::new(
            name,
            Model::new(name, Arc::clone(schema), DownSampling::Minute),
            Arc::new(AggregationTable::new()),
        )
    }

    fn sweep(targets: Vec<SweepTarget>, storage: Arc<dyn StorageDao>, max_batch_size: usize) -> (PersistenceSweep, MetricsRegistry) {
        let telemetry = MetricsRegistry::new();
        let config = SweepConfig {
            max_batch_size,
            ..SweepConfig::default()
        };
        (PersistenceSweep::new(targets, storage, config, &telemetry), telemetry)
    }

    /// Fails every write to one model.
    struct FailingModel {
        inner: MemoryStorage,
        model: String,
    }

    impl StorageDao for FailingModel {
        fn exists(&self, model: &Model, key: &str, time_bucket: i64) -> StorageResult<Option<Record>> {
            self.inner.exists(model, key, time_bucket)
        }

        fn batch_write(&self, model: &Model, inserts: Vec<Record>, updates: Vec<Record>) -> StorageResult<()> {
            if model.name == self.model {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            self.inner.batch_write(model, inserts, updates)
        }
    }

    /// Counts row reads.
    #[derive(Default)]
    struct CountingReads {
        inner: MemoryStorage,
        reads: std::sync::atomic::AtomicUsize,
    }

    impl CountingReads {
        fn reads(&self) -> usize {
            self.reads.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl StorageDao for CountingReads {
        fn exists(&self, model: &Model, key: &str, time_bucket: i64) -> StorageResult<Option<Record>> {
            self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.exists(model, key, time_bucket)
        }

        fn batch_write(&self, model: &Model, inserts: Vec<Record>, updates: Vec<Record>) -> StorageResult<()> {
            self.inner.batch_write(model, inserts, updates)
        }
    }

    #[test]
    fn new_rows_insert_then_merge_into_stored() {
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let (sweep, telemetry) = sweep(vec![target("service_cpm", &schema)], storage.clone(), 100);
        let table = Arc::clone(&sweep.targets()[0].table);

        table.merge(record(&schema, "svc", 3)).unwrap();
        let report = sweep.sweep_once();
        assert_eq!(
            report.stage("service_cpm"),
            Some(&StageReport {
                name: "service_cpm".into(),
                retired: 1,
                inserted: 1,
                updated: 0,
                skipped: 0,
                dropped: 0,
            })
        );
        assert!(table.is_empty());

        table.merge(record(&schema, "svc", 1)).unwrap();
        let report = sweep.sweep_once();
        assert_eq!(report.stage("service_cpm").unwrap().updated, 1);

        let rows = storage.rows(&sweep.targets()[0].model).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("total"), Some(Value::Long(4)));
        assert_eq!(rows[0].get_by_name("latency"), Some(Value::Long(20)));
        assert_eq!(telemetry.counter_value("persistence_written_count", &[]), Some(2));
    }

    #[test]
    fn empty_round_writes_nothing() {
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let (sweep, _) = sweep(vec![target("service_cpm", &schema)], storage.clone(), 100);
        let report = sweep.sweep_once();
        assert_eq!(report.written(), 0);
        assert!(storage.writes().is_empty());
    }

    #[test]
    fn writes_are_split_by_max_batch_size() {
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let (sweep, _) = sweep(vec![target("service_cpm", &schema)], storage.clone(), 2);
        for e in 0..5 {
            sweep.targets()[0].table.merge(record(&schema, &format!("svc-{e}"), 1)).unwrap();
        }

        let report = sweep.sweep_once();
        assert_eq!(report.written(), 5);
        let writes = storage.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.inserts.len() + w.updates.len() <= 2));
    }

    #[test]
    fn failed_batch_is_dropped_and_other_stages_continue() {
        let schema = schema();
        let storage = Arc::new(FailingModel {
            inner: MemoryStorage::new(),
            model: "broken".into(),
        });
        let (sweep, telemetry) = sweep(
            vec![target("broken", &schema), target("healthy", &schema)],
            storage.clone(),
            100,
        );
        for t in sweep.targets() {
            t.table.merge(record(&schema, "svc", 1)).unwrap();
        }

        let report = sweep.sweep_once();
        assert_eq!(report.stage("broken").unwrap().dropped, 1);
        assert_eq!(report.stage("healthy").unwrap().inserted, 1);
        assert_eq!(telemetry.counter_value("persistence_sweep_error_count", &[]), Some(1));

        // Dropped entries are not retried.
        let report = sweep.sweep_once();
        assert_eq!(report.stage("broken").unwrap().retired, 0);
        assert!(sweep.targets()[0].table.is_empty());
    }

    #[test]
    fn stored_row_of_foreign_schema_is_dropped() {
        let schema = schema();
        let other = Schema::builder(2, "other")
            .column("total", ValueType::Long, MergeOperator::Sum)
            .column("latency", ValueType::Long, MergeOperator::Avg)
            .build()
            .unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let (sweep, telemetry) = sweep(vec![target("service_cpm", &schema)], storage.clone(), 100);

        // A row written under another schema id fails to decode, which
        // fails the whole chunk.
        let foreign = Model::new("service_cpm", other.clone(), DownSampling::Minute);
        storage
            .batch_write(&foreign, vec![record(&other, "svc", 1)], Vec::new())
            .unwrap();
        sweep.targets()[0].table.merge(record(&schema, "svc", 1)).unwrap();

        let report = sweep.sweep_once();
        assert_eq!(report.stage("service_cpm").unwrap().dropped, 1);
        assert_eq!(telemetry.counter_value("persistence_sweep_error_count", &[]), Some(1));
    }

    #[test]
    fn session_cache_skips_storage_reads() {
        let schema = schema();
        let storage = Arc::new(CountingReads::default());
        let target = target("service_cpm", &schema).with_session(Duration::from_secs(60));
        let (sweep, _) = sweep(vec![target], storage.clone(), 100);
        let table = Arc::clone(&sweep.targets()[0].table);

        table.merge(record(&schema, "svc", 3)).unwrap();
        assert_eq!(sweep.sweep_once().stage("service_cpm").unwrap().inserted, 1);
        assert_eq!(storage.reads(), 1);

        table.merge(record(&schema, "svc", 2)).unwrap();
        table.merge(record(&schema, "db", 1)).unwrap();
        let report = sweep.sweep_once();
        let stage = report.stage("service_cpm").unwrap();
        assert_eq!((stage.inserted, stage.updated), (1, 1));
        // Only the key never written before is read.
        assert_eq!(storage.reads(), 2);

        let row = storage
            .inner
            .exists(&sweep.targets()[0].model, "svc_202401010000", 202401010000)
            .unwrap()
            .unwrap();
        assert_eq!(row.get_by_name("total"), Some(Value::Long(5)));
        assert_eq!(sweep.targets()[0].session.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn expired_session_rows_are_read_again() {
        let schema = schema();
        let storage = Arc::new(CountingReads::default());
        let target = target("service_cpm", &schema).with_session(Duration::ZERO);
        let (sweep, _) = sweep(vec![target], storage.clone(), 100);
        let table = Arc::clone(&sweep.targets()[0].table);

        table.merge(record(&schema, "svc", 3)).unwrap();
        sweep.sweep_once();
        table.merge(record(&schema, "svc", 2)).unwrap();
        assert_eq!(sweep.sweep_once().stage("service_cpm").unwrap().updated, 1);
        assert_eq!(storage.reads(), 2);
    }

    #[test]
    fn insert_only_target_keeps_the_first_row() {
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let target = target("service_cpm", &schema).insert_only();
        let (sweep, _) = sweep(vec![target], storage.clone(), 100);
        let table = Arc::clone(&sweep.targets()[0].table);

        table.merge(record(&schema, "svc", 3)).unwrap();
        sweep.sweep_once();
        table.merge(record(&schema, "svc", 1)).unwrap();
        table.merge(record(&schema, "db", 1)).unwrap();
        let report = sweep.sweep_once();
        let stage = report.stage("service_cpm").unwrap();
        assert_eq!((stage.inserted, stage.updated, stage.skipped), (1, 0, 1));
        assert_eq!(report.skipped(), 1);

        let rows = storage.rows(&sweep.targets()[0].model).unwrap();
        let svc = rows.iter().find(|r| r.entity_id() == "svc").unwrap();
        assert_eq!(svc.get_by_name("total"), Some(Value::Long(3)));
        assert!(storage.writes().iter().all(|w| w.updates.is_empty()));
    }
}
