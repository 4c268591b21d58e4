//! Named collection of peer connections, iterated in insertion order.

use crate::peer::{PeerConnection, PeerTimings};
use crate::transport::{Connector, Endpoint};

pub struct PeerRegistry {
    connector: Box<dyn Connector>,
    timings: PeerTimings,
    peers: Vec<PeerConnection>,
}

impl PeerRegistry {
    pub fn new(connector: impl Connector + 'static, timings: PeerTimings) -> Self {
        Self {
            connector: Box::new(connector),
            timings,
            peers: Vec::new(),
        }
    }

    /// Register a peer and open (lazily) its transport.
    pub fn add(
        &mut self,
        name: &str,
        endpoint: Endpoint,
        prefix: &str,
    ) -> Result<&mut PeerConnection, RegistryError> {
        if self.get(name).is_some() {
            return Err(RegistryError::DuplicatePeer(name.to_string()));
        }
        let transport = self.connector.connect(&endpoint);
        self.peers.push(PeerConnection::new(
            name,
            endpoint,
            prefix,
            transport,
            self.timings,
        ));
        let idx = self.peers.len() - 1;
        Ok(&mut self.peers[idx])
    }

    /// Drop a peer and its socket. Order of the remaining peers is preserved.
    pub fn remove(&mut self, name: &str) -> Result<PeerConnection, RegistryError> {
        let idx = self
            .peers
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| RegistryError::UnknownPeer(name.to_string()))?;
        Ok(self.peers.remove(idx))
    }

    pub fn get(&self, name: &str) -> Option<&PeerConnection> {
        self.peers.iter().find(|p| p.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PeerConnection> {
        self.peers.iter_mut().find(|p| p.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerConnection> {
        self.peers.iter_mut()
    }

    pub fn names(&self) -> Vec<&str> {
        self.peers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(String),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
}
