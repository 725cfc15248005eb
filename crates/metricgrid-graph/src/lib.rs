//! metricgrid-graph: the worker graph of a metricgrid node.
//!
//! # Architecture
//!
//! ```text
//! ingest(record)
//!   └── entry stage (per schema)
//!         <name>-aggregate   local, partitioned by key, pre-aggregates a batch
//!           └── tell ──► <name>-persist   routed by selector
//!                          ├── owner is self → IntakeQueue → AggregationTable
//!                          └── owner is peer → RemoteClientManager::push
//!
//! PersistenceSweep (timer)
//!   for each target: retire table → roll up (hour/day stages) → merge with
//!   session cache or stored rows → batch_write
//! ```
//!
//! Every stage is an [`stage::Stage`]: one [`role::WorkerRole`], one intake
//! queue, and one [`stage::Worker`] per consumer thread. Stages are wired
//! once by [`builder::GraphBuilder`]; the result is a [`pipeline::Pipeline`].

pub mod builder;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod role;
pub mod session;
pub mod stage;
pub mod sweep;
pub mod table;
pub mod workers;

pub use builder::{GraphBuilder, MetricsStreamDef, StageOptions, StreamRoles};
pub use context::AppContext;
pub use error::{GraphError, GraphResult};
pub use pipeline::{Pipeline, WorkerRegistry};
pub use role::WorkerRole;
pub use session::SessionCache;
pub use stage::{FORWARDED_WAIT, Outputs, Stage, Worker};
pub use sweep::{PersistenceSweep, Rollup, StageReport, SweepConfig, SweepReport, SweepTarget};
pub use table::AggregationTable;
pub use workers::{AggregateWorker, PersistWorker};
