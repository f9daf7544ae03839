use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use hoard_p2p::Peer;

/// Membership table of connected peers, keyed by remote address.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<SocketAddr, Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `peer`, returning a previous entry for the same address.
    pub fn add(&self, peer: Peer) -> Option<Peer> {
        self.lock().insert(peer.remote_addr(), peer)
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Peer> {
        self.lock().remove(addr)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Peer> {
        self.lock().get(addr).cloned()
    }

    /// Copy of all current peers, for fan-out without holding the lock.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.lock().values().cloned().collect()
    }

    /// Sorted remote addresses of all current peers.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self.lock().keys().copied().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
