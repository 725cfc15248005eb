//! metricd: a metricgrid aggregation node.
//!
//! Assembles the subsystems of one node:
//! - Storage (redb, on disk or in memory)
//! - Cluster view and remote clients
//! - Worker graph with one pipeline per configured metrics stream
//! - Persistence sweep
//! - Remote dispatch gRPC server
//! - HTTP `/metrics` and `/healthz`

pub mod config;
pub mod http;
pub mod node;

pub use config::NodeConfig;
pub use node::Node;
