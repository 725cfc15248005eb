//! RemoteClientManager: peer snapshot plus one client per remote peer.
//!
//! The peer list is polled from a [`PeerSource`]. Readers get an
//! `Arc<[Peer]>` snapshot, so a refresh in progress never tears the list
//! a selector is looking at.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use metricgrid_core::{Record, RoleId};
use metricgrid_metrics::{Gauge, MetricsRegistry};

use crate::client::{LinkState, RemoteClient, RemoteClientConfig};
use crate::error::{MembershipError, TransportError};
use crate::membership::PeerSource;
use crate::peer::Peer;

/// Owns the cluster view of a node.
pub struct RemoteClientManager {
    self_address: String,
    source: Arc<dyn PeerSource>,
    config: RemoteClientConfig,
    runtime: Handle,
    telemetry: Arc<MetricsRegistry>,
    peers: RwLock<Arc<[Peer]>>,
    clients: RwLock<HashMap<String, RemoteClient>>,
    cluster_size: Arc<Gauge>,
}

impl RemoteClientManager {
    /// Create a manager whose initial view is the local node alone.
    pub fn new(
        self_address: impl Into<String>,
        source: Arc<dyn PeerSource>,
        config: RemoteClientConfig,
        runtime: Handle,
        telemetry: Arc<MetricsRegistry>,
    ) -> Self {
        let self_address = self_address.into();
        let cluster_size = telemetry.gauge("cluster_size", "Peers in the current cluster view.", &[]);
        cluster_size.set(1);
        let peers: Arc<[Peer]> = Arc::from(vec![Peer::local(self_address.clone())]);
        Self {
            self_address,
            source,
            config,
            runtime,
            telemetry,
            peers: RwLock::new(peers),
            clients: RwLock::new(HashMap::new()),
            cluster_size,
        }
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Current peer snapshot, sorted by address.
    pub fn peers(&self) -> Arc<[Peer]> {
        Arc::clone(&self.peers.read())
    }

    /// Normalize a queried list: flag self, drop duplicates, sort.
    fn normalize(&self, queried: Vec<Peer>) -> Vec<Peer> {
        let mut peers: Vec<Peer> = queried
            .into_iter()
            .map(|p| {
                if p.address == self.self_address {
                    Peer::local(p.address)
                } else {
                    Peer::remote(p.address)
                }
            })
            .collect();
        if peers.is_empty() {
            peers.push(Peer::local(self.self_address.clone()));
        }
        peers.sort();
        peers.dedup_by(|a, b| a.address == b.address);
        peers
    }

    /// Re-query the peer source and rebuild clients if the list changed.
    /// Returns whether the view changed.
    pub fn refresh(&self) -> Result<bool, MembershipError> {
        let queried = self.source.query_peers()?;
        let peers = self.normalize(queried);
        if self.peers.read()[..] == peers[..] {
            return Ok(false);
        }
        if !peers.iter().any(|p| p.is_self) {
            warn!(self_address = %self.self_address, "peer list does not include this node, it owns no keys");
        }

        let mut clients = self.clients.write();
        let mut next = HashMap::with_capacity(peers.len());
        for peer in peers.iter().filter(|p| !p.is_self) {
            let client = match clients.remove(&peer.address) {
                Some(existing) => existing,
                None => RemoteClient::spawn(
                    peer.clone(),
                    self.config.clone(),
                    &self.runtime,
                    &self.telemetry,
                ),
            };
            next.insert(peer.address.clone(), client);
        }
        for (address, departed) in clients.drain() {
            debug!(peer = %address, "closing client of departed peer");
            departed.close();
        }
        *clients = next;

        let snapshot: Arc<[Peer]> = Arc::from(peers);
        *self.peers.write() = Arc::clone(&snapshot);
        drop(clients);

        self.cluster_size.set(snapshot.len() as i64);
        let addresses: Vec<String> = snapshot.iter().map(ToString::to_string).collect();
        info!(peers = ?addresses, "cluster view changed");
        Ok(true)
    }

    /// Forward a record to a remote peer at most once.
    pub fn push(&self, peer: &Peer, role: RoleId, record: &Record) -> Result<(), TransportError> {
        let clients = self.clients.read();
        match clients.get(&peer.address) {
            Some(client) => client.push(role, record),
            None => Err(TransportError::UnknownPeer {
                peer: peer.address.clone(),
            }),
        }
    }

    pub fn link_state(&self, address: &str) -> Option<LinkState> {
        self.clients.read().get(address).map(RemoteClient::state)
    }

    /// Refresh now, then every `interval` until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?interval, "cluster refresh loop started");
        loop {
            if let Err(e) = self.refresh() {
                warn!(error = %e, "cluster refresh failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("cluster refresh loop shutting down");
                    break;
                }
            }
        }
    }

    /// Close every remote client.
    pub fn shutdown(&self) {
        for (_, client) in self.clients.write().drain() {
            client.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StaticPeers;

    fn manager(source: Arc<StaticPeers>) -> RemoteClientManager {
        RemoteClientManager::new(
            "10.0.0.1:11800",
            source,
            RemoteClientConfig::default(),
            Handle::current(),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[tokio::test]
    async fn initial_view_is_self() {
        let m = manager(Arc::new(StaticPeers::default()));
        let peers = m.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].is_self);
    }

    #[tokio::test]
    async fn refresh_sorts_dedups_and_flags_self() {
        let source = Arc::new(StaticPeers::new([
            "10.0.0.3:11800",
            "10.0.0.1:11800",
            "10.0.0.2:11800",
            "10.0.0.3:11800",
        ]));
        let m = manager(Arc::clone(&source));
        assert!(m.refresh().unwrap());

        let peers = m.peers();
        let addresses: Vec<&str> = peers.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.1:11800", "10.0.0.2:11800", "10.0.0.3:11800"]);
        assert!(peers[0].is_self);
        assert!(!peers[1].is_self);
        assert!(m.link_state("10.0.0.2:11800").is_some());
        assert!(m.link_state("10.0.0.1:11800").is_none());
        assert_eq!(m.telemetry.gauge_value("cluster_size", &[]), Some(3));

        assert!(!m.refresh().unwrap());
        m.shutdown();
    }

    #[tokio::test]
    async fn departed_peers_are_closed_and_snapshots_stay_valid() {
        let source = Arc::new(StaticPeers::new(["10.0.0.1:11800", "10.0.0.2:11800"]));
        let m = manager(Arc::clone(&source));
        m.refresh().unwrap();
        let old = m.peers();

        source.set(["10.0.0.1:11800"]);
        assert!(m.refresh().unwrap());
        assert!(m.link_state("10.0.0.2:11800").is_none());
        assert_eq!(old.len(), 2);
        assert_eq!(m.peers().len(), 1);

        let schema = metricgrid_core::Schema::builder(1, "s")
            .column("v", metricgrid_core::ValueType::Long, metricgrid_core::MergeOperator::Sum)
            .build()
            .unwrap();
        let record = Record::new(schema, "e", 202401010000);
        let err = m.push(&old[1], RoleId(1), &record).unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer { .. }));
    }

    #[tokio::test]
    async fn empty_source_keeps_self() {
        let source = Arc::new(StaticPeers::new(["10.0.0.2:11800"]));
        let m = manager(Arc::clone(&source));
        m.refresh().unwrap();
        source.set(Vec::<String>::new());
        m.refresh().unwrap();
        let peers = m.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].is_self);
    }

    #[tokio::test]
    async fn view_without_self_keeps_routing_to_listed_peers() {
        let source = Arc::new(StaticPeers::new(["10.0.0.2:11800", "10.0.0.3:11800"]));
        let m = manager(Arc::clone(&source));
        assert!(m.refresh().unwrap());
        let peers = m.peers();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|p| !p.is_self));
        m.shutdown();
    }
}
