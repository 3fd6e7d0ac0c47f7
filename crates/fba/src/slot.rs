//! Slot coordinator: ballot state plus the checks that guard it.
//!
//! A `Slot` owns the [`BallotProtocol`] for one decision instance. It is
//! created on the first envelope (or local proposal) for its index and
//! lives until the enclosing runtime purges it.

use tracing::trace;

use concord_wire::{Envelope, Value};

use crate::ballot::{BallotPhase, BallotProtocol};
use crate::driver::Driver;
use crate::info::{value_to_str, BallotInfo, BallotSummary, CommitBounds, SlotInfo};
use crate::{EnvelopeState, SlotContext};

/// Per-slot consensus coordinator.
#[derive(Debug)]
pub struct Slot {
    slot_index: u64,
    ballot: BallotProtocol,
}

impl Slot {
    /// Create a fresh slot.
    pub fn new(slot_index: u64) -> Self {
        Self {
            slot_index,
            ballot: BallotProtocol::new(),
        }
    }

    /// The slot index.
    pub fn slot_index(&self) -> u64 {
        self.slot_index
    }

    /// Read access to the ballot state.
    pub fn ballot(&self) -> &BallotProtocol {
        &self.ballot
    }

    /// Current ballot phase.
    pub fn phase(&self) -> BallotPhase {
        self.ballot.phase()
    }

    /// Whether this slot has reached consensus.
    pub fn is_externalized(&self) -> bool {
        self.ballot.is_externalized()
    }

    /// The decided value, once externalized.
    pub fn get_externalized_value(&self) -> Option<&Value> {
        self.ballot.get_externalized_value()
    }

    /// Whether a quorum has been heard for the current ballot.
    pub fn heard_from_quorum(&self) -> bool {
        self.ballot.heard_from_quorum()
    }

    /// The latest envelope this node constructed for the slot.
    pub fn get_last_envelope(&self) -> Option<&Envelope> {
        self.ballot.get_last_envelope()
    }

    /// Envelopes supporting the externalized value.
    pub(crate) fn get_externalizing_state<D: Driver>(
        &self,
        ctx: &SlotContext<'_, D>,
    ) -> Vec<Envelope> {
        self.ballot.get_externalizing_state(ctx.local_node_id)
    }

    /// Validate and process one envelope for this slot.
    ///
    /// The pipeline: slot index match, signature, structural sanity —
    /// failures discard the statement without touching state — then the
    /// ballot machine takes over.
    pub(crate) fn process_envelope<D: Driver>(
        &mut self,
        envelope: &Envelope,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        if envelope.statement.slot_index != self.slot_index {
            return EnvelopeState::Invalid;
        }

        if !ctx.driver.verify_envelope(envelope) {
            trace!(
                slot = self.slot_index,
                node = %envelope.statement.node_id,
                "envelope signature rejected"
            );
            return EnvelopeState::Invalid;
        }

        if !self.ballot.is_statement_sane(&envelope.statement, ctx) {
            trace!(
                slot = self.slot_index,
                node = %envelope.statement.node_id,
                "statement failed sanity check"
            );
            return EnvelopeState::Invalid;
        }

        self.ballot.process_envelope(envelope, ctx)
    }

    /// Propose `value` for this slot. See [`BallotProtocol::bump`].
    pub(crate) fn bump_state<D: Driver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        force: bool,
    ) -> bool {
        self.ballot.bump(ctx, value, force)
    }

    /// Bump to an explicit counter. See [`BallotProtocol::bump_state`].
    pub(crate) fn bump_state_to<D: Driver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        counter: u32,
    ) -> bool {
        self.ballot.bump_state(ctx, value, counter)
    }

    /// Abandon the current ballot; `counter == 0` increments.
    pub(crate) fn abandon_ballot<D: Driver>(
        &mut self,
        counter: u32,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        self.ballot.abandon_ballot(counter, ctx)
    }

    /// Restore state from a saved self-envelope.
    pub fn set_state_from_envelope(&mut self, envelope: &Envelope) -> bool {
        if envelope.statement.slot_index != self.slot_index {
            return false;
        }
        self.ballot.set_state_from_envelope(envelope)
    }

    /// Serializable snapshot of this slot.
    pub fn get_info(&self) -> SlotInfo {
        let ballot = &self.ballot;
        SlotInfo {
            slot_index: self.slot_index,
            ballot: BallotInfo {
                phase: format!("{:?}", ballot.phase()),
                ballot_counter: ballot.current_ballot().map(|b| b.counter).unwrap_or(0),
                ballot_value: ballot.current_ballot().map(|b| value_to_str(&b.value)),
                prepared: ballot.prepared().map(BallotSummary::from_ballot),
                prepared_prime: ballot.prepared_prime().map(BallotSummary::from_ballot),
                commit: ballot.commit().map(|c| CommitBounds {
                    low: c.counter,
                    high: ballot
                        .high_ballot()
                        .map(|h| h.counter)
                        .unwrap_or(c.counter),
                }),
                high: ballot.high_ballot().map(|h| h.counter).unwrap_or(0),
                node_count: ballot.latest_envelopes().len(),
                heard_from_quorum: ballot.heard_from_quorum(),
            },
            externalized_value: self.get_externalized_value().map(value_to_str),
        }
    }
}
