//! GraphBuilder: static wiring of the worker graph at startup.
//!
//! A stage may only declare downstream stages that are already registered,
//! so the resulting graph is acyclic by construction.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use metricgrid_cluster::SelectorKind;
use metricgrid_core::{ConfigError, DownSampling, RoleId, Schema, StageKind};
use metricgrid_queue::{IntakeQueue, QueueConfig};
use metricgrid_storage::Model;

use crate::context::AppContext;
use crate::error::{GraphError, GraphResult};
use crate::pipeline::{Pipeline, WorkerRegistry};
use crate::role::WorkerRole;
use crate::stage::{Outputs, Stage, StageConsumer, Worker};
use crate::sweep::{PersistenceSweep, Rollup, SweepConfig, SweepTarget};
use crate::table::AggregationTable;
use crate::workers::{AggregateWorker, PersistWorker};

/// Queue and consumer settings of one stage.
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// The queue name is replaced by the role name.
    pub queue: QueueConfig,
    pub consumers: usize,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            consumers: 1,
        }
    }
}

/// Declaration of a metrics stream: one schema aggregated per entity and
/// time bucket, persisted by its owner.
#[derive(Debug, Clone)]
pub struct MetricsStreamDef {
    pub id: u32,
    pub name: String,
    pub schema: Arc<Schema>,
    pub selector: SelectorKind,
    /// Coarser levels to maintain besides the minute table.
    pub downsampling: Vec<DownSampling>,
    /// When false the stream is insert-only: the first persisted row of a
    /// key is final.
    pub support_update: bool,
}

/// Roles of the stages generated for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRoles {
    pub aggregate: RoleId,
    pub persist: RoleId,
}

pub struct GraphBuilder {
    ctx: AppContext,
    defaults: StageOptions,
    sweep: SweepConfig,
    stages: Vec<Arc<Stage>>,
    roles: HashMap<RoleId, Arc<Stage>>,
    entries: HashMap<u32, RoleId>,
    targets: Vec<SweepTarget>,
}

impl GraphBuilder {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            defaults: StageOptions::default(),
            sweep: SweepConfig::default(),
            stages: Vec::new(),
            roles: HashMap::new(),
            entries: HashMap::new(),
            targets: Vec::new(),
        }
    }

    /// Options used by stages registered without explicit ones.
    pub fn with_defaults(mut self, defaults: StageOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_sweep(mut self, sweep: SweepConfig) -> Self {
        self.sweep = sweep;
        self
    }

    /// Register a stage with the default options.
    pub fn stage<W, F>(&mut self, role: WorkerRole, downstream: &[RoleId], factory: F) -> GraphResult<Arc<Stage>>
    where
        W: Worker,
        F: FnMut(usize) -> W,
    {
        let options = self.defaults.clone();
        self.stage_with(role, options, downstream, factory)
    }

    /// Register a stage. `factory` builds one worker per consumer thread.
    pub fn stage_with<W, F>(
        &mut self,
        role: WorkerRole,
        options: StageOptions,
        downstream: &[RoleId],
        mut factory: F,
    ) -> GraphResult<Arc<Stage>>
    where
        W: Worker,
        F: FnMut(usize) -> W,
    {
        let id = role.id();
        if self.roles.contains_key(&id) {
            return Err(GraphError::DuplicateRole(id));
        }
        let targets = downstream
            .iter()
            .map(|d| {
                self.roles.get(d).cloned().ok_or(GraphError::UnknownDownstream {
                    stage: id,
                    downstream: *d,
                })
            })
            .collect::<GraphResult<Vec<_>>>()?;

        let queue_config = QueueConfig {
            name: role.name().to_string(),
            ..options.queue
        };
        let queue = IntakeQueue::new(queue_config)?;
        let stage = Arc::new(Stage::new(Arc::new(role), queue, Arc::clone(&self.ctx.remote)));

        let outputs = Outputs::new(targets);
        stage
            .queue()
            .attach_consumer(|index| StageConsumer::new(factory(index), outputs.clone()), options.consumers)?;

        info!(role = %id, name = stage.role().name(), downstream = ?downstream, "stage registered");
        self.roles.insert(id, Arc::clone(&stage));
        self.stages.push(Arc::clone(&stage));
        Ok(stage)
    }

    /// Make `role` the ingest entry for records of `schema_id`.
    pub fn entry(&mut self, schema_id: u32, role: RoleId) -> GraphResult<()> {
        if !self.roles.contains_key(&role) {
            return Err(GraphError::UnknownRole(role));
        }
        if self.entries.insert(schema_id, role).is_some() {
            return Err(ConfigError::Invalid(format!("schema {schema_id} has two entry stages")).into());
        }
        Ok(())
    }

    /// Register an aggregation table with the sweep.
    pub fn sweep_target(&mut self, target: SweepTarget) {
        self.targets.push(target);
    }

    /// Build the stages of a metrics stream:
    /// `aggregate → persist`, plus one routed stage per down-sampling level.
    pub fn metrics_stream(&mut self, def: &MetricsStreamDef) -> GraphResult<StreamRoles> {
        let mut levels: Vec<DownSampling> = def
            .downsampling
            .iter()
            .copied()
            .filter(|l| *l != DownSampling::Minute)
            .collect();
        levels.sort();
        levels.dedup();

        let persist = RoleId::for_stream(def.id, StageKind::Persist)?;
        let aggregate = RoleId::for_stream(def.id, StageKind::Aggregate)?;

        let table = Arc::new(AggregationTable::new());
        let role = WorkerRole::new(persist, stage_name(&def.name, StageKind::Persist), Arc::clone(&def.schema))
            .routed(def.selector);
        let persist_table = Arc::clone(&table);
        self.stage(role, &[], move |_| PersistWorker::new(Arc::clone(&persist_table)))?;

        let mut minute = self.stream_target(
            def,
            def.name.clone(),
            Model::for_level(&def.name, Arc::clone(&def.schema), DownSampling::Minute),
            table,
        );
        let mut coarse = Vec::with_capacity(levels.len());
        for level in levels {
            let kind = match level {
                DownSampling::Hour => StageKind::Hour,
                _ => StageKind::Day,
            };
            let table = Arc::new(AggregationTable::new());
            let role = WorkerRole::new(
                RoleId::for_stream(def.id, kind)?,
                stage_name(&def.name, kind),
                Arc::clone(&def.schema),
            )
            .routed(def.selector);
            let level_table = Arc::clone(&table);
            let stage = self.stage(role, &[], move |_| PersistWorker::new(Arc::clone(&level_table)))?;

            let model = Model::for_level(&def.name, Arc::clone(&def.schema), level);
            coarse.push(self.stream_target(def, model.name.clone(), model, Arc::clone(&table)));
            minute.rollups.push(Rollup { level, stage, table });
        }

        let role = WorkerRole::new(aggregate, stage_name(&def.name, StageKind::Aggregate), Arc::clone(&def.schema));
        self.stage(role, &[persist], move |_| AggregateWorker::new(persist))?;
        self.entry(def.schema.id(), aggregate)?;

        // The minute table feeds the coarser tables, so it is swept first.
        self.targets.push(minute);
        self.targets.extend(coarse);
        Ok(StreamRoles { aggregate, persist })
    }

    fn stream_target(&self, def: &MetricsStreamDef, name: String, model: Model, table: Arc<AggregationTable>) -> SweepTarget {
        let mut target = SweepTarget::new(name, model, table);
        if let Some(timeout) = self.sweep.session_timeout {
            target = target.with_session(timeout);
        }
        if !def.support_update {
            target = target.insert_only();
        }
        target
    }

    pub fn build(self) -> Pipeline {
        let sweep = Arc::new(PersistenceSweep::new(
            self.targets,
            Arc::clone(&self.ctx.storage),
            self.sweep,
            &self.ctx.telemetry,
        ));
        let registry = Arc::new(WorkerRegistry::new(self.roles));
        Pipeline::new(self.ctx, self.stages, registry, self.entries, sweep)
    }
}

fn stage_name(stream: &str, kind: StageKind) -> String {
    format!("{stream}-{}", kind.suffix())
}
