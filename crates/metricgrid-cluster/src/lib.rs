//! metricgrid-cluster: ownership routing and remote dispatch.
//!
//! Resolves which node owns a record and carries records between nodes
//! over one long-lived gRPC stream per peer.
//!
//! # Architecture
//!
//! ```text
//! Sender node
//!   ├── Selector (HashCode | Rolling | ForeverFirst)
//!   │     └── select(peers snapshot, record) → Peer
//!   └── RemoteClientManager
//!         ├── refresh() ← PeerSource (membership collaborator)
//!         └── RemoteClient per non-self peer
//!               ├── bounded outbound channel, push() never blocks
//!               ├── Call stream + heartbeats
//!               └── reconnect with exponential backoff
//!
//! Receiving node
//!   └── RemoteServer (gRPC)
//!         └── Call(stream RemoteMessage) → stream Ack
//!               └── decode against role schema → LocalDispatch
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod manager;
pub mod membership;
pub mod peer;
pub mod proto;
pub mod selector;
pub mod server;

pub use client::{LinkState, RemoteClient, RemoteClientConfig};
pub use error::{DispatchError, MembershipError, RoutingError, TransportError};
pub use manager::RemoteClientManager;
pub use membership::{PeerSource, StaticPeers};
pub use peer::Peer;
pub use selector::{Selector, SelectorKind};
pub use server::{LocalDispatch, RemoteServer};
