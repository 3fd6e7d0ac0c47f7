//! Driver trait: the engine's only window onto the host application.
//!
//! The agreement engine is a pure state machine. It does not know how to
//! sign bytes, where quorum sets come from, how envelopes reach the
//! network, or what a timer is. All of that is delegated through
//! [`Driver`], implemented by the host (typically the component that also
//! owns the overlay).

use std::time::Duration;

use concord_common::Hash256;
use concord_wire::{Ballot, Envelope, NodeId, QuorumSet, Value};

/// Callback interface between the agreement engine and its host.
///
/// Implementations must be `Send + Sync`; the engine may be driven from
/// any task. Progress notifications have no-op defaults so a minimal host
/// only wires the essentials.
pub trait Driver: Send + Sync {
    /// Sign a locally constructed envelope before it is recorded or
    /// emitted. The implementation fills in `envelope.signature`.
    fn sign_envelope(&self, envelope: &mut Envelope);

    /// Verify the signature on a received envelope.
    fn verify_envelope(&self, envelope: &Envelope) -> bool;

    /// Look up the quorum set a node has advertised.
    fn get_quorum_set(&self, node_id: &NodeId) -> Option<QuorumSet>;

    /// Look up a quorum set by its hash, if cached.
    fn get_quorum_set_by_hash(&self, _hash: &Hash256) -> Option<QuorumSet> {
        None
    }

    /// Hand an envelope to the overlay for broadcast.
    fn emit_envelope(&self, envelope: &Envelope);

    /// Consensus was reached on `value` for `slot_index`. Irreversible.
    fn value_externalized(&self, slot_index: u64, value: &Value);

    /// A ballot was accepted as prepared.
    fn accepted_ballot_prepared(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// A ballot was confirmed prepared.
    fn confirmed_ballot_prepared(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// A commit interval was accepted.
    fn accepted_commit(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// We heard from a quorum for the current ballot.
    fn ballot_heard_from_quorum(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// Arm (or re-arm) the ballot timer for a slot. On expiry the host
    /// must call back into [`crate::Fba::ballot_timer_expired`].
    fn setup_timer(&self, slot_index: u64, timeout: Duration);

    /// Cancel the ballot timer for a slot.
    fn stop_timer(&self, slot_index: u64);

    /// Timeout for a ballot round. Grows with the counter so a struggling
    /// network gets progressively more time to converge.
    fn compute_timeout(&self, round: u32) -> Duration {
        Duration::from_secs(u64::from(round.clamp(1, 30)))
    }
}
