//! Cluster member descriptors.

use std::fmt;

/// One node of the cluster, addressed as `host:port` of its gRPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer {
    pub address: String,
    pub is_self: bool,
}

impl Peer {
    pub fn remote(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            is_self: false,
        }
    }

    pub fn local(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            is_self: true,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_self {
            write!(f, "{}(self)", self.address)
        } else {
            f.write_str(&self.address)
        }
    }
}
