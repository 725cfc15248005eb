//! Error types for the worker graph.

use metricgrid_cluster::{RoutingError, TransportError};
use metricgrid_core::{ConfigError, MergeError, RoleId};
use metricgrid_queue::QueueError;
use metricgrid_storage::StorageError;
use thiserror::Error;

/// Result type alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unknown worker role {0}")]
    UnknownRole(RoleId),

    #[error("worker role {0} registered twice")]
    DuplicateRole(RoleId),

    #[error("stage {stage} declares unregistered downstream {downstream}")]
    UnknownDownstream { stage: RoleId, downstream: RoleId },

    #[error("no entry stage for schema {0}")]
    UnknownSchema(u32),

    #[error("stage {role} rejected record: queue full or stopped")]
    Rejected { role: RoleId },
}
