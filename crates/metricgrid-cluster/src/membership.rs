//! Membership collaborator.
//!
//! Discovery lives outside metricgrid; the manager only needs the current
//! peer list on demand.

use parking_lot::RwLock;

use crate::error::MembershipError;
use crate::peer::Peer;

/// Supplies the current cluster member list.
pub trait PeerSource: Send + Sync {
    fn query_peers(&self) -> Result<Vec<Peer>, MembershipError>;
}

/// Fixed peer list from configuration. Can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticPeers {
    addresses: RwLock<Vec<String>>,
}

impl StaticPeers {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: RwLock::new(addresses.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.addresses.write() = addresses.into_iter().map(Into::into).collect();
    }
}

/// Check that an address looks like `host:port`.
pub fn validate_address(address: &str) -> Result<(), MembershipError> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(MembershipError::InvalidAddress(address.to_string())),
    }
}

impl PeerSource for StaticPeers {
    fn query_peers(&self) -> Result<Vec<Peer>, MembershipError> {
        self.addresses
            .read()
            .iter()
            .map(|address| {
                validate_address(address)?;
                Ok(Peer::remote(address.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_peers_can_change() {
        let source = StaticPeers::new(["10.0.0.1:11800"]);
        assert_eq!(source.query_peers().unwrap().len(), 1);
        source.set(["10.0.0.1:11800", "10.0.0.2:11800"]);
        assert_eq!(source.query_peers().unwrap().len(), 2);
    }

    #[test]
    fn malformed_address_rejected() {
        let source = StaticPeers::new(["no-port"]);
        assert!(matches!(
            source.query_peers(),
            Err(MembershipError::InvalidAddress(_))
        ));
        assert!(validate_address("[::1]:11800").is_ok());
        assert!(validate_address(":11800").is_err());
    }
}
