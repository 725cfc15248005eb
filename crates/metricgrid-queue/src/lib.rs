//! metricgrid-queue: the intake queue feeding every worker stage.
//!
//! # Architecture
//!
//! ```text
//! producers ── enqueue(key, item) ──► partition fn ──► channel[0..N] (ArrayQueue, fixed capacity)
//!                                                          │
//!                              consumer thread i owns channels i, i+C, i+2C, ...
//!                                                          │
//!                                 consume(item) × batch ── end_of_batch()
//! ```
//!
//! Backpressure is chosen per queue: block, drop, or block with a timeout.
//! A consumer error or panic is logged per record and never ends the loop.

pub mod config;
pub mod consumer;
pub mod error;
pub mod queue;
mod signal;

pub use config::{Backpressure, QueueConfig};
pub use consumer::Consumer;
pub use error::{QueueError, QueueResult};
pub use queue::{IntakeQueue, Partitioner, QueueStats};
