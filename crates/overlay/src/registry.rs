//! In-memory session registry.
//!
//! Tracks live sessions, enforces a peer cap, and fans broadcasts out to
//! everyone except the message's source. Persistent peer tables (the
//! `{id, ip, port, lastTry, lastConnect, rank}` store) belong to the
//! host, not here.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use concord_wire::{Message, PeerAddress};

use crate::gateway::PeerRegistry;
use crate::peer::Peer;

/// Simple registry: a capped list of live sessions plus address hints
/// for refused peers.
pub struct PeerSet {
    max_peers: usize,
    peers: Mutex<Vec<Arc<Peer>>>,
    known_addresses: Mutex<Vec<PeerAddress>>,
}

impl PeerSet {
    /// Create a registry admitting up to `max_peers` sessions.
    pub fn new(max_peers: usize) -> Arc<Self> {
        Arc::new(Self {
            max_peers,
            peers: Mutex::new(Vec::new()),
            known_addresses: Mutex::new(Vec::new()),
        })
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Snapshot of the live sessions.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().clone()
    }

    /// Record an address to hand out in PEERS hints.
    pub fn add_known_address(&self, addr: PeerAddress) {
        self.known_addresses.lock().push(addr);
    }

    /// Fan `msg` out to every live session except `skip`.
    pub fn broadcast(&self, msg: &Message, skip: Option<&Arc<Peer>>) {
        let peers = self.peers();
        trace!(ty = %msg.message_type(), fanout = peers.len(), "broadcast");
        for peer in &peers {
            if let Some(source) = skip {
                if Arc::ptr_eq(peer, source) {
                    continue;
                }
            }
            peer.send(msg.clone());
        }
    }
}

impl PeerRegistry for PeerSet {
    fn add_peer(&self, peer: Arc<Peer>) {
        debug!(ip = %peer.ip(), "registering session");
        self.peers.lock().push(peer);
    }

    fn drop_peer(&self, peer: &Arc<Peer>) {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|existing| !Arc::ptr_eq(existing, peer));
        if peers.len() != before {
            debug!(ip = %peer.ip(), live = peers.len(), "deregistered session");
        }
    }

    fn is_peer_accepted(&self, _peer: &Arc<Peer>) -> bool {
        self.peers.lock().len() <= self.max_peers
    }

    fn peer_address_hints(&self) -> Vec<PeerAddress> {
        self.known_addresses.lock().clone()
    }
}
