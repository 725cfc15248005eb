//! Ownership routing.
//!
//! A selector maps a record to exactly one peer of the current snapshot.
//! Selection is pure apart from the rolling cursor and never blocks.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use metricgrid_core::Record;
use metricgrid_core::hash::key_hash;

use crate::error::RoutingError;
use crate::peer::Peer;

/// Selector strategy as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    HashCode,
    Rolling,
    ForeverFirst,
}

/// Routing strategy of a worker role.
#[derive(Debug)]
pub enum Selector {
    /// `peers[hash(key) % len]`: one owner per key for a fixed snapshot.
    HashCode,
    /// Round-robin across peers, for stateless fan-out.
    Rolling(AtomicUsize),
    /// Always `peers[0]`, for a pinned coordinator.
    ForeverFirst,
}

impl Selector {
    pub fn new(kind: SelectorKind) -> Self {
        match kind {
            SelectorKind::HashCode => Selector::HashCode,
            SelectorKind::Rolling => Selector::Rolling(AtomicUsize::new(0)),
            SelectorKind::ForeverFirst => Selector::ForeverFirst,
        }
    }

    pub fn kind(&self) -> SelectorKind {
        match self {
            Selector::HashCode => SelectorKind::HashCode,
            Selector::Rolling(_) => SelectorKind::Rolling,
            Selector::ForeverFirst => SelectorKind::ForeverFirst,
        }
    }

    /// Pick the peer responsible for `record`.
    pub fn select<'a>(&self, peers: &'a [Peer], record: &Record) -> Result<&'a Peer, RoutingError> {
        self.select_key(peers, record.key())
    }

    /// Pick the peer responsible for a routing key.
    pub fn select_key<'a>(&self, peers: &'a [Peer], key: &str) -> Result<&'a Peer, RoutingError> {
        if peers.is_empty() {
            return Err(RoutingError::NoAvailablePeer);
        }
        let index = match self {
            Selector::HashCode => (key_hash(key) % peers.len() as u64) as usize,
            Selector::Rolling(cursor) => cursor.fetch_add(1, Ordering::Relaxed) % peers.len(),
            Selector::ForeverFirst => 0,
        };
        Ok(&peers[index])
    }
}
