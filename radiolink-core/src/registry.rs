//! Peer registry: hardware address -> known peer.

use std::collections::BTreeMap;

use crate::identity::MacAddr;

/// A remote device reachable by directed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub address: MacAddr,
    /// Channel the peer was last seen or joined on.
    pub channel: u8,
}

/// Result of [`PeerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAdded {
    /// First time this address was seen; the transport must register it.
    New,
    /// Already known; nothing changed.
    Existing,
}

/// Known peers, ordered by address. Entries are never removed: stale peers are
/// harmless since sends are addressed by hardware address.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<MacAddr, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Idempotent. The broadcast address is refused (`None`).
    pub fn add(&mut self, address: MacAddr, channel: u8) -> Option<PeerAdded> {
        if address.is_broadcast() {
            return None;
        }
        if self.peers.contains_key(&address) {
            return Some(PeerAdded::Existing);
        }
        self.peers.insert(address, Peer { address, channel });
        Some(PeerAdded::New)
    }

    pub fn lookup(&self, address: &MacAddr) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn is_known(&self, address: &MacAddr) -> bool {
        self.peers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn addresses(&self) -> Vec<MacAddr> {
        self.peers.keys().copied().collect()
    }
}
