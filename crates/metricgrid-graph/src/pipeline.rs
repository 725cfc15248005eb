//! Pipeline: the built worker graph of a node.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use metricgrid_cluster::{DispatchError, LocalDispatch};
use metricgrid_core::{Record, RoleId, Schema};

use crate::context::AppContext;
use crate::error::{GraphError, GraphResult};
use crate::stage::Stage;
use crate::sweep::{PersistenceSweep, SweepReport};

/// Stages by role id. Receives records forwarded by peers.
pub struct WorkerRegistry {
    roles: HashMap<RoleId, Arc<Stage>>,
}

impl WorkerRegistry {
    pub(crate) fn new(roles: HashMap<RoleId, Arc<Stage>>) -> Self {
        Self { roles }
    }

    pub fn get(&self, role: RoleId) -> Option<&Arc<Stage>> {
        self.roles.get(&role)
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl LocalDispatch for WorkerRegistry {
    fn schema_of(&self, role: RoleId) -> Option<Arc<Schema>> {
        self.roles.get(&role).map(|s| Arc::clone(s.role().schema()))
    }

    /// A forwarded record was routed by the sender, so it is enqueued here
    /// without consulting the selector again. A full queue rejects it after
    /// a bounded wait.
    fn dispatch_local(&self, role: RoleId, record: Record) -> Result<(), DispatchError> {
        let stage = self.roles.get(&role).ok_or(DispatchError::UnknownRole(role))?;
        stage.tell_forwarded(record).map_err(|e| DispatchError::Rejected {
            role,
            reason: e.to_string(),
        })
    }
}

pub struct Pipeline {
    ctx: AppContext,
    /// In registration order; downstream stages come first.
    stages: Vec<Arc<Stage>>,
    registry: Arc<WorkerRegistry>,
    entries: HashMap<u32, RoleId>,
    sweep: Arc<PersistenceSweep>,
}

impl Pipeline {
    pub(crate) fn new(
        ctx: AppContext,
        stages: Vec<Arc<Stage>>,
        registry: Arc<WorkerRegistry>,
        entries: HashMap<u32, RoleId>,
        sweep: Arc<PersistenceSweep>,
    ) -> Self {
        Self {
            ctx,
            stages,
            registry,
            entries,
            sweep,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Feed a decoded record into the entry stage of its schema.
    pub fn ingest(&self, record: Record) -> GraphResult<()> {
        let schema_id = record.schema_id();
        let role = self
            .entries
            .get(&schema_id)
            .ok_or(GraphError::UnknownSchema(schema_id))?;
        self.tell(*role, record)
    }

    /// Tell any registered stage.
    pub fn tell(&self, role: RoleId, record: Record) -> GraphResult<()> {
        self.registry
            .get(role)
            .ok_or(GraphError::UnknownRole(role))?
            .tell(record)
    }

    pub fn stage(&self, role: RoleId) -> Option<&Arc<Stage>> {
        self.registry.get(role)
    }

    pub fn stages(&self) -> &[Arc<Stage>] {
        &self.stages
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn sweep(&self) -> Arc<PersistenceSweep> {
        Arc::clone(&self.sweep)
    }

    /// Whether every stage has consumed all it accepted. Upstream stages
    /// are checked first, so a record in flight between two stages is seen.
    pub fn is_idle(&self) -> bool {
        self.stages.iter().rev().all(|s| s.is_idle())
    }

    /// Poll [`Pipeline::is_idle`] until it holds or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Publish per-stage queue depth and counters as gauges.
    pub fn publish_queue_stats(&self) {
        let telemetry = &self.ctx.telemetry;
        for stage in &self.stages {
            let labels = [("stage", stage.role().name())];
            let stats = stage.stats();
            telemetry
                .gauge("queue_depth", "Records waiting in a stage queue.", &labels)
                .set(stage.depth() as i64);
            telemetry
                .gauge("queue_dropped", "Records rejected by a stage queue.", &labels)
                .set(stats.dropped as i64);
            telemetry
                .gauge("queue_failed", "Records whose handler failed.", &labels)
                .set(stats.failed as i64);
        }
    }

    /// Stop stages upstream first, each draining its queue, then persist
    /// what was aggregated with a final sweep.
    pub fn shutdown(&self) -> GraphResult<SweepReport> {
        let mut result = Ok(());
        for stage in self.stages.iter().rev() {
            if let Err(e) = stage.shutdown() {
                error!(role = %stage.id(), error = %e, "stage did not stop cleanly");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        let report = self.sweep.sweep_once();
        info!(written = report.written(), "pipeline stopped");
        result?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use metricgrid_cluster::SelectorKind;
    use metricgrid_core::{DownSampling, MergeError, MergeOperator, Value, ValueType};
    use metricgrid_queue::{Backpressure, QueueConfig};
    use metricgrid_storage::{MemoryStorage, Model};
    use tokio::runtime::Runtime;

    use crate::builder::{GraphBuilder, MetricsStreamDef, StageOptions};
    use crate::role::WorkerRole;
    use crate::stage::Outputs;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn schema() -> Arc<Schema> {
        Schema::builder(1, "service_cpm")
            .column("total", ValueType::Long, MergeOperator::Sum)
            .build()
            .unwrap()
    }

    fn stream(schema: &Arc<Schema>, downsampling: Vec<DownSampling>) -> MetricsStreamDef {
        MetricsStreamDef {
            id: 1,
            name: "service_cpm".into(),
            schema: Arc::clone(schema),
            selector: SelectorKind::HashCode,
            downsampling,
            support_update: true,
        }
    }

    fn builder(rt: &Runtime, storage: Arc<MemoryStorage>) -> GraphBuilder {
        let ctx = AppContext::standalone("127.0.0.1:11800", storage, rt.handle().clone());
        GraphBuilder::new(ctx).with_defaults(StageOptions {
            queue: QueueConfig::default()
                .with_capacity(1024)
                .with_partitions(4)
                .with_backpressure(Backpressure::Blocking)
                .with_batch_size(64),
            consumers: 2,
        })
    }

    fn one(schema: &Arc<Schema>, entity: &str, bucket: i64, total: i64) -> Record {
        Record::new(Arc::clone(schema), entity, bucket)
            .with("total", total)
            .unwrap()
    }

    #[test]
    fn thousand_concurrent_sums_become_one_write() {
        let rt = runtime();
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let mut builder = builder(&rt, storage.clone());
        builder.metrics_stream(&stream(&schema, Vec::new())).unwrap();
        let pipeline = builder.build();

        thread::scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    for _ in 0..100 {
                        pipeline.ingest(one(&schema, "svc-A", 2024010100, 1)).unwrap();
                    }
                });
            }
        });
        assert!(pipeline.wait_idle(Duration::from_secs(10)));

        let report = pipeline.sweep().sweep_once();
        assert_eq!(report.written(), 1);

        let writes = storage.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].inserts.len(), 1);
        assert!(writes[0].updates.is_empty());
        let row = &writes[0].inserts[0];
        assert_eq!(row.key(), "svc-A_2024010100");
        assert_eq!(row.get_by_name("total"), Some(Value::Long(1000)));

        pipeline.shutdown().unwrap();
    }

    #[test]
    fn minute_entries_roll_up_in_the_same_round() {
        let rt = runtime();
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let mut builder = builder(&rt, storage.clone());
        builder
            .metrics_stream(&stream(&schema, vec![DownSampling::Day, DownSampling::Hour, DownSampling::Hour]))
            .unwrap();
        let pipeline = builder.build();

        pipeline.ingest(one(&schema, "svc", 202401011230, 2)).unwrap();
        pipeline.ingest(one(&schema, "svc", 202401011245, 3)).unwrap();
        pipeline.ingest(one(&schema, "svc", 202401011305, 4)).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(10)));

        let report = pipeline.sweep().sweep_once();
        let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["service_cpm", "service_cpm_hour", "service_cpm_day"]);
        assert_eq!(report.stage("service_cpm").unwrap().inserted, 3);
        assert_eq!(report.stage("service_cpm_hour").unwrap().inserted, 2);
        assert_eq!(report.stage("service_cpm_day").unwrap().inserted, 1);

        let hour = Model::for_level("service_cpm", Arc::clone(&schema), DownSampling::Hour);
        let rows = storage.rows(&hour).unwrap();
        let totals: Vec<(i64, Option<Value>)> = rows
            .iter()
            .map(|r| (r.time_bucket(), r.get_by_name("total")))
            .collect();
        assert_eq!(
            totals,
            vec![(2024010112, Some(Value::Long(5))), (2024010113, Some(Value::Long(4)))]
        );

        let day = Model::for_level("service_cpm", Arc::clone(&schema), DownSampling::Day);
        let rows = storage.rows(&day).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_bucket(), 20240101);
        assert_eq!(rows[0].get_by_name("total"), Some(Value::Long(9)));

        pipeline.shutdown().unwrap();
    }

    #[test]
    fn shutdown_drains_stages_and_persists() {
        let rt = runtime();
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let mut builder = builder(&rt, storage.clone());
        builder.metrics_stream(&stream(&schema, Vec::new())).unwrap();
        let pipeline = builder.build();

        for i in 0..50 {
            pipeline.ingest(one(&schema, &format!("svc-{}", i % 5), 202401010000, 1)).unwrap();
        }
        let report = pipeline.shutdown().unwrap();
        assert_eq!(report.written(), 5);

        let err = pipeline.ingest(one(&schema, "svc-0", 202401010000, 1)).unwrap_err();
        assert!(matches!(err, GraphError::Rejected { .. }));
    }

    #[test]
    fn custom_stage_feeds_a_stream() {
        let rt = runtime();
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let mut builder = builder(&rt, storage.clone());
        let roles = builder.metrics_stream(&stream(&schema, Vec::new())).unwrap();

        let aggregate = roles.aggregate;
        let decorate = WorkerRole::new(RoleId(9000), "decorate", Arc::clone(&schema));
        builder
            .stage(decorate, &[aggregate], move |_| {
                move |record: Record, out: &Outputs| -> GraphResult<()> {
                    let doubled = Record::new(Arc::clone(record.schema()), record.entity_id(), record.time_bucket())
                        .with("total", 2_i64)?;
                    out.tell(aggregate, doubled)
                }
            })
            .unwrap();
        let pipeline = builder.build();

        pipeline.tell(RoleId(9000), one(&schema, "svc", 202401010000, 1)).unwrap();
        let report = pipeline.shutdown().unwrap();
        assert_eq!(report.written(), 1);
        let rows = storage.rows(&Model::new("service_cpm", schema, DownSampling::Minute)).unwrap();
        assert_eq!(rows[0].get_by_name("total"), Some(Value::Long(2)));
    }

    #[test]
    fn wiring_errors() {
        let rt = runtime();
        let schema = schema();
        let mut builder = builder(&rt, Arc::new(MemoryStorage::new()));
        let noop = |_| |_: Record, _: &Outputs| -> GraphResult<()> { Ok(()) };

        builder
            .stage(WorkerRole::new(RoleId(1), "first", Arc::clone(&schema)), &[], noop)
            .unwrap();
        let err = builder
            .stage(WorkerRole::new(RoleId(1), "again", Arc::clone(&schema)), &[], noop)
            .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateRole(RoleId(1))));

        let err = builder
            .stage(WorkerRole::new(RoleId(2), "second", Arc::clone(&schema)), &[RoleId(3)], noop)
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownDownstream {
                stage: RoleId(2),
                downstream: RoleId(3)
            }
        ));

        let err = builder
            .stage_with(
                WorkerRole::new(RoleId(4), "odd", Arc::clone(&schema)),
                StageOptions {
                    queue: QueueConfig::default().with_capacity(1000),
                    consumers: 1,
                },
                &[],
                noop,
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::Queue(_)));

        builder.entry(1, RoleId(1)).unwrap();
        assert!(matches!(builder.entry(1, RoleId(1)), Err(GraphError::Config(_))));
        assert!(matches!(builder.entry(2, RoleId(7)), Err(GraphError::UnknownRole(RoleId(7)))));
        builder.build().shutdown().unwrap();
    }

    #[test]
    fn misaddressed_records_are_rejected() {
        let rt = runtime();
        let schema = schema();
        let mut builder = builder(&rt, Arc::new(MemoryStorage::new()));
        let roles = builder.metrics_stream(&stream(&schema, Vec::new())).unwrap();
        let pipeline = builder.build();

        let other = Schema::builder(2, "other")
            .column("total", ValueType::Long, MergeOperator::Sum)
            .build()
            .unwrap();
        let stray = one(&other, "svc", 202401010000, 1);
        assert!(matches!(
            pipeline.ingest(stray.clone()),
            Err(GraphError::UnknownSchema(2))
        ));
        assert!(matches!(
            pipeline.tell(roles.persist, stray),
            Err(GraphError::Merge(MergeError::SchemaMismatch { expected: 1, found: 2 }))
        ));

        let registry = pipeline.registry();
        assert_eq!(registry.schema_of(roles.persist).map(|s| s.id()), Some(1));
        assert!(matches!(
            registry.dispatch_local(RoleId(12345), one(&schema, "svc", 202401010000, 1)),
            Err(DispatchError::UnknownRole(RoleId(12345)))
        ));
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn forwarded_dispatch_to_a_stalled_stage_gives_up() {
        use std::sync::mpsc;

        use crate::stage::FORWARDED_WAIT;

        let rt = runtime();
        let schema = schema();
        let mut builder = builder(&rt, Arc::new(MemoryStorage::new()));
        let (release, gate) = mpsc::channel::<()>();
        let mut gate = Some(gate);
        builder
            .stage_with(
                WorkerRole::new(RoleId(77), "stalled", Arc::clone(&schema)),
                StageOptions {
                    queue: QueueConfig::default()
                        .with_capacity(1)
                        .with_backpressure(Backpressure::Blocking),
                    consumers: 1,
                },
                &[],
                move |_| {
                    let gate = gate.take().unwrap();
                    move |_: Record, _: &Outputs| -> GraphResult<()> {
                        let _ = gate.recv();
                        Ok(())
                    }
                },
            )
            .unwrap();
        let pipeline = builder.build();
        let stage = Arc::clone(pipeline.stage(RoleId(77)).unwrap());

        // One record held by the worker, one filling the only slot.
        stage.tell_local(one(&schema, "a", 202401010000, 1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while stage.depth() > 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        stage.tell_local(one(&schema, "b", 202401010000, 1)).unwrap();

        let started = Instant::now();
        let err = pipeline
            .registry()
            .dispatch_local(RoleId(77), one(&schema, "c", 202401010000, 1))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { role: RoleId(77), .. }));
        let waited = started.elapsed();
        assert!(waited >= FORWARDED_WAIT);
        assert!(waited < Duration::from_secs(5));

        drop(release);
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn insert_only_stream_keeps_first_minute_row() {
        let rt = runtime();
        let schema = schema();
        let storage = Arc::new(MemoryStorage::new());
        let mut builder = builder(&rt, storage.clone());
        let def = MetricsStreamDef {
            support_update: false,
            ..stream(&schema, vec![DownSampling::Hour])
        };
        builder.metrics_stream(&def).unwrap();
        let pipeline = builder.build();

        let sweep = pipeline.sweep();
        assert!(sweep.targets().iter().all(|t| !t.support_update && t.session.is_some()));

        pipeline.ingest(one(&schema, "svc", 202401010000, 4)).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(10)));
        sweep.sweep_once();
        pipeline.ingest(one(&schema, "svc", 202401010000, 1)).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(10)));
        let report = sweep.sweep_once();
        assert_eq!(report.stage("service_cpm").unwrap().skipped, 1);

        let rows = storage.rows(&Model::new("service_cpm", Arc::clone(&schema), DownSampling::Minute)).unwrap();
        assert_eq!(rows[0].get_by_name("total"), Some(Value::Long(4)));
        pipeline.shutdown().unwrap();
    }
}
