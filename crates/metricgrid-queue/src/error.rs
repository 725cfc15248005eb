//! Error types for the intake queue.

use thiserror::Error;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Construction, attachment and shutdown failures. Enqueue never fails
/// with an error; it reports rejection through its boolean result.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue {queue}: capacity {capacity} is not a power of two")]
    InvalidCapacity { queue: String, capacity: usize },

    #[error("queue {queue}: at least one partition is required")]
    InvalidPartitions { queue: String },

    #[error("queue {queue}: batch size must be positive")]
    InvalidBatchSize { queue: String },

    #[error("queue {queue}: consumers already attached")]
    ConsumerAlreadyAttached { queue: String },

    #[error("queue {queue}: failed to spawn consumer thread: {source}")]
    Spawn {
        queue: String,
        #[source]
        source: std::io::Error,
    },

    #[error("queue {queue}: consumer thread {thread} panicked")]
    ConsumerPanicked { queue: String, thread: String },
}
