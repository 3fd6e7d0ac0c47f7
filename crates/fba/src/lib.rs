//! Federated Byzantine agreement engine for concord.
//!
//! Nodes reach agreement without closed membership: each node declares its
//! own quorum slices, and safety holds between any two nodes whose quorums
//! intersect.
//!
//! ## Pieces
//!
//! - [`quorum`] — pure predicates over quorum sets (slice satisfaction,
//!   quorum discovery, blocking sets, sanity checks)
//! - [`voting`] — the federated *accept* (v-blocking or quorum) and
//!   *ratify* (quorum only) predicates over the latest statements
//! - [`BallotProtocol`] — the per-slot state machine driving
//!   PREPARE → CONFIRM → EXTERNALIZE over potentially many ballots
//! - [`Slot`] — coordinator owning the ballot state for one slot
//! - [`Fba`] — the engine: a map of slots plus the local node identity
//! - [`Driver`] — the host callback seam (signing, quorum-set lookup,
//!   emission, timers)
//!
//! ## Driving it
//!
//! ```ignore
//! let fba = Fba::new(node_id, quorum_set, driver);
//! fba.bump_state(slot, value, true);            // propose
//! let state = fba.receive_envelope(envelope);   // feed the network
//! fba.ballot_timer_expired(slot);               // wire the ballot timer
//! ```

use std::sync::Arc;

mod ballot;
mod driver;
mod engine;
mod error;
mod info;
pub mod quorum;
mod slot;
pub mod voting;

pub use ballot::{get_working_ballot, BallotPhase, BallotProtocol};
pub use driver::Driver;
pub use engine::Fba;
pub use error::FbaError;
pub use info::{BallotInfo, BallotSummary, CommitBounds, SlotInfo};
pub use slot::Slot;

// The wire types the engine speaks.
pub use concord_common::Hash256;
pub use concord_wire::{
    Ballot, Envelope, NodeId, QuorumSet, Signature, Statement, StatementConfirm,
    StatementExternalize, StatementNominate, StatementPledges, StatementPrepare, Value,
};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, FbaError>;

/// A slot index: one numbered decision instance.
pub type SlotIndex = u64;

/// Shared context threaded through ballot protocol methods.
///
/// Groups the parameters nearly every internal function needs: the local
/// node identity, its quorum set, the driver, and the slot index.
pub(crate) struct SlotContext<'a, D: Driver> {
    pub local_node_id: &'a NodeId,
    pub local_quorum_set: &'a QuorumSet,
    pub driver: &'a Arc<D>,
    pub slot_index: u64,
}

/// The result of processing an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Envelope is invalid (bad signature, malformed counters, wrong slot).
    Invalid,
    /// Envelope is valid but changed nothing (duplicate or stale).
    Valid,
    /// Envelope is valid and advanced the slot.
    ValidNew,
}

impl EnvelopeState {
    /// True unless the envelope was rejected.
    pub fn is_valid(&self) -> bool {
        matches!(self, EnvelopeState::Valid | EnvelopeState::ValidNew)
    }

    /// True when processing caused a state change.
    pub fn is_new(&self) -> bool {
        matches!(self, EnvelopeState::ValidNew)
    }
}
