//! Queue construction parameters.

use std::time::Duration;

use crate::error::{QueueError, QueueResult};

/// What `enqueue` does when the target channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Block the producer until a slot frees.
    Blocking,
    /// Return `false` immediately.
    DropIfFull,
    /// Block for at most the given duration, then return `false`.
    BoundedWait(Duration),
}

/// Configuration of one intake queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Used in thread names and log fields.
    pub name: String,
    /// Slots per partition channel. Must be a power of two.
    pub capacity: usize,
    /// Number of independent channels.
    pub partitions: usize,
    pub backpressure: Backpressure,
    /// Maximum records a consumer takes from one channel before it closes
    /// the batch.
    pub batch_size: usize,
    /// How long an idle consumer sleeps before re-checking its channels.
    pub idle_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "queue".to_string(),
            capacity: 1024,
            partitions: 1,
            backpressure: Backpressure::Blocking,
            batch_size: 256,
            idle_wait: Duration::from_millis(20),
        }
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            return Err(QueueError::InvalidCapacity {
                queue: self.name.clone(),
                capacity: self.capacity,
            });
        }
        if self.partitions == 0 {
            return Err(QueueError::InvalidPartitions {
                queue: self.name.clone(),
            });
        }
        if self.batch_size == 0 {
            return Err(QueueError::InvalidBatchSize {
                queue: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        QueueConfig::default().validate().unwrap();
    }

    #[test]
    fn capacity_must_be_power_of_two() {
        for capacity in [0, 3, 1000] {
            let err = QueueConfig::default()
                .with_capacity(capacity)
                .validate()
                .unwrap_err();
            assert!(matches!(err, QueueError::InvalidCapacity { .. }));
        }
        QueueConfig::default().with_capacity(1).validate().unwrap();
    }

    #[test]
    fn zero_partitions_rejected() {
        let err = QueueConfig::default()
            .with_partitions(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidPartitions { .. }));
    }
}
