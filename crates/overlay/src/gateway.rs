//! Collaborator interfaces consumed by peer sessions.
//!
//! The overlay routes messages; it does not interpret transactions,
//! quorum sets, or consensus statements. Those belong to collaborators
//! behind these traits, which the host wires into a [`PeerContext`].
//!
//! [`PeerContext`]: crate::PeerContext

use std::sync::Arc;

use concord_common::Hash256;
use concord_wire::{Envelope, Message, PeerAddress, QuorumSet, Transaction, TxSet};

use crate::peer::Peer;

/// Transaction-side collaborator: owns transaction sets and the pending
/// transaction pool.
pub trait HerderGateway: Send + Sync {
    /// Look up a transaction set; with `create_fetch` the herder may
    /// start tracking the id for a later network fetch.
    fn fetch_tx_set(&self, id: &Hash256, create_fetch: bool) -> Option<TxSet>;

    /// A transaction set arrived from a peer.
    fn recv_tx_set(&self, set: TxSet);

    /// A transaction arrived; returns true when it was accepted into the
    /// pending set (and should therefore be flooded onward).
    fn recv_transaction(&self, tx: Transaction) -> bool;

    /// A peer answered DONT_HAVE for a transaction set we asked it for.
    fn doesnt_have_tx_set(&self, id: &Hash256, peer: &Arc<Peer>);
}

/// Overlay-side collaborator: quorum-set cache, flood tracking, and
/// broadcast fan-out.
pub trait OverlayGateway: Send + Sync {
    /// Look up a quorum set by hash; with `create_fetch` the gateway may
    /// start tracking the hash for a later network fetch.
    fn fetch_quorum_set(&self, id: &Hash256, create_fetch: bool) -> Option<QuorumSet>;

    /// A quorum set arrived from a peer.
    fn recv_quorum_set(&self, qset: QuorumSet);

    /// A peer answered DONT_HAVE for a quorum set we asked it for.
    fn doesnt_have_quorum_set(&self, id: &Hash256, peer: &Arc<Peer>);

    /// Fan a message out to every session except `source`.
    fn broadcast_message(&self, msg: Message, source: &Arc<Peer>);

    /// Record a flooded message for dedup: `id` identifies the message
    /// (derived from its signature), `ledger_index` scopes its lifetime.
    fn recv_flooded_msg(&self, id: Hash256, msg: Message, ledger_index: u64, peer: &Arc<Peer>);
}

/// Consensus-side collaborator: receives statements off the wire.
pub trait ConsensusGateway: Send + Sync {
    /// A consensus envelope arrived from a peer.
    fn recv_statement(&self, envelope: Envelope);
}

/// Session bookkeeping: who is connected and who may stay.
pub trait PeerRegistry: Send + Sync {
    /// A new session exists (accept or connect).
    fn add_peer(&self, peer: Arc<Peer>);

    /// A session ended; posted exactly once per session.
    fn drop_peer(&self, peer: &Arc<Peer>);

    /// Decide whether a freshly handshaken session may stay.
    fn is_peer_accepted(&self, peer: &Arc<Peer>) -> bool;

    /// Addresses to offer a refused peer as a PEERS hint.
    fn peer_address_hints(&self) -> Vec<PeerAddress> {
        Vec::new()
    }
}
