//! Error types for routing and remote dispatch.

use metricgrid_core::{MergeError, RoleId};
use thiserror::Error;

/// The selector found nobody to route to.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no available peer")]
    NoAvailablePeer,
}

/// Failures on the outbound side of remote dispatch. The record that hit
/// one of these is dropped.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {peer} unavailable")]
    Unavailable { peer: String },

    #[error("outbound channel to {peer} is full")]
    Backpressure { peer: String },

    #[error("no client for peer {peer}")]
    UnknownPeer { peer: String },

    #[error("client for {peer} is closed")]
    Closed { peer: String },

    #[error("failed to encode record: {0}")]
    Codec(#[from] MergeError),
}

/// Failures on the inbound side. Reported back in the `Ack`, never fatal to
/// the stream.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown worker role {0}")]
    UnknownRole(RoleId),

    #[error("invalid payload: {0}")]
    Codec(#[from] MergeError),

    #[error("rejected by role {role}: {reason}")]
    Rejected { role: RoleId, reason: String },
}

/// Failures of the membership collaborator.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("peer source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
}
