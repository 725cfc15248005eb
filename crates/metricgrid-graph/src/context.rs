//! Process-wide services handed to every component at construction.

use std::sync::Arc;

use tokio::runtime::Handle;

use metricgrid_cluster::{RemoteClientConfig, RemoteClientManager, StaticPeers};
use metricgrid_metrics::MetricsRegistry;
use metricgrid_storage::StorageDao;

/// Shared services of one node. Built once at startup; clones share state.
#[derive(Clone)]
pub struct AppContext {
    pub remote: Arc<RemoteClientManager>,
    pub storage: Arc<dyn StorageDao>,
    pub telemetry: Arc<MetricsRegistry>,
}

impl AppContext {
    pub fn new(
        remote: Arc<RemoteClientManager>,
        storage: Arc<dyn StorageDao>,
        telemetry: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            remote,
            storage,
            telemetry,
        }
    }

    /// Single-node context: the cluster view is the local node only.
    pub fn standalone(self_address: &str, storage: Arc<dyn StorageDao>, runtime: Handle) -> Self {
        let telemetry = Arc::new(MetricsRegistry::new());
        let remote = Arc::new(RemoteClientManager::new(
            self_address,
            Arc::new(StaticPeers::default()),
            RemoteClientConfig::default(),
            runtime,
            Arc::clone(&telemetry),
        ));
        Self::new(remote, storage, telemetry)
    }
}
