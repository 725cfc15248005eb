//! metricgrid-metrics: process telemetry for metricgrid nodes.
//!
//! # Architecture
//!
//! ```text
//! MetricsRegistry (one per node, shared through the app context)
//!   ├── counter()   → Arc<Counter>    remote_out_count, persistence_written_count, ...
//!   ├── gauge()     → Arc<Gauge>      cluster_size
//!   └── histogram() → Arc<Histogram>  persistence_sweep_latency_ms
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```
//!
//! Handles are cheap atomics; callers look a series up once and keep the
//! `Arc`.

pub mod prometheus;
pub mod registry;

pub use prometheus::render_prometheus;
pub use registry::{Counter, Gauge, Histogram, LATENCY_BUCKETS_MS, MetricKind, MetricsRegistry, Series};
