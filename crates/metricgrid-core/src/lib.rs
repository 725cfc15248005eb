//! metricgrid-core: the typed data model shared by every metricgrid crate.
//!
//! # Architecture
//!
//! ```text
//! Schema (immutable, Arc-shared)
//!   ├── id + name
//!   └── Column[] ── ValueType + MergeOperator (Cover | Sum | Avg | Min | Max)
//!
//! Record
//!   ├── key = "{entity_id}_{time_bucket}"
//!   ├── Cell[] (Unset | Value | Mean)
//!   └── merge_from() ── per-column combine, all-or-nothing
//! ```
//!
//! Records are the unit of in-memory aggregation, of the remote wire
//! payload and of storage rows. The wire and storage encodings are 1:1
//! mappings of the cell slots; both check the schema id on decode.

pub mod bucket;
pub mod error;
pub mod hash;
pub mod record;
pub mod role;
pub mod schema;

pub use bucket::DownSampling;
pub use error::{ConfigError, MergeError, MergeResult};
pub use record::{Cell, Mean, Record, StoredRecord, Value, record_key};
pub use role::{MAX_STREAM_ID, RoleId, StageKind};
pub use schema::{Column, MergeOperator, Schema, SchemaBuilder, ValueType};
