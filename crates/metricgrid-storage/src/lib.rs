//! metricgrid-storage: the storage collaborator behind the persistence sweep.
//!
//! # Architecture
//!
//! ```text
//! PersistenceSweep
//!   └── StorageDao
//!         ├── exists(model, key, bucket) → Option<Record>
//!         ├── multi_get(model, keys)      → Vec<Record>
//!         └── batch_write(model, inserts, updates)
//!
//! Backends
//!   ├── MemoryStorage  (tests, ephemeral nodes; records every batch)
//!   └── RedbStorage    (embedded, one table per model, JSON rows)
//! ```

pub mod dao;
pub mod error;
pub mod memory;
pub mod model;
pub mod redb_store;

pub use dao::StorageDao;
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryStorage, WriteBatch};
pub use model::{Model, row_id};
pub use redb_store::RedbStorage;
