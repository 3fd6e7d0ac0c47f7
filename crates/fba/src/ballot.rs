//! The ballot protocol: per-slot Byzantine agreement.
//!
//! A ballot `(n, x)` pairs an attempt counter with a candidate value.
//! Within one slot the protocol drives three phases:
//!
//! 1. **PREPARE** — vote that no conflicting ballot can be committed at a
//!    lower counter.
//! 2. **CONFIRM** — a quorum agrees the ballot is prepared; vote to
//!    commit an interval of counters.
//! 3. **EXTERNALIZE** — the commit interval is ratified; the value is
//!    final and the phase never changes again.
//!
//! Following the whitepaper notation: `b` is the current ballot, `p` the
//! highest accepted-prepared ballot, `p'` the highest accepted-prepared
//! ballot incompatible with `p`, `h` the highest confirmed-prepared
//! ballot, `c` the low end of the commit interval, and `M` the latest
//! envelope per node.
//!
//! All state moves monotonically: counters never decrease, the phase is
//! one-way, and re-processing any envelope is a no-op.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use concord_wire::{
    Ballot, Envelope, NodeId, QuorumSet, Signature, Statement, StatementConfirm,
    StatementExternalize, StatementPledges, StatementPrepare, Value,
};

use crate::driver::Driver;
use crate::quorum::{hash_quorum_set, is_quorum, is_quorum_set_sane, singleton_quorum_set};
use crate::voting;
use crate::EnvelopeState;
use crate::SlotContext;

/// Bound on re-entrant `advance_slot` calls. A pass that would nest
/// deeper returns without re-emitting; progress resumes on the next
/// external envelope.
const MAX_MESSAGE_LEVEL: u32 = 8;

/// Extract the "working ballot" from a statement: `b` for PREPARE, the
/// commit-counter ballot for CONFIRM, and the infinite ballot for
/// EXTERNALIZE. Nominations have no working ballot.
pub fn get_working_ballot(statement: &Statement) -> Option<Ballot> {
    match &statement.pledges {
        StatementPledges::Prepare(prep) => Some(prep.ballot.clone()),
        StatementPledges::Confirm(conf) => Some(Ballot {
            counter: conf.n_commit,
            value: conf.ballot.value.clone(),
        }),
        StatementPledges::Externalize(ext) => Some(Ballot {
            counter: u32::MAX,
            value: ext.commit.value.clone(),
        }),
        StatementPledges::Nominate(_) => None,
    }
}

/// Phase of the ballot protocol. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotPhase {
    /// Voting to prepare ballots.
    Prepare,
    /// A prepared ballot is confirmed; voting to commit an interval.
    Confirm,
    /// Consensus reached; the value is final.
    Externalize,
}

/// Per-slot ballot state machine.
#[derive(Debug)]
pub struct BallotProtocol {
    /// Current ballot (`b`).
    current_ballot: Option<Ballot>,
    /// Highest accepted-prepared ballot (`p`).
    prepared: Option<Ballot>,
    /// Highest accepted-prepared ballot incompatible with `p` (`p'`).
    prepared_prime: Option<Ballot>,
    /// Highest confirmed-prepared ballot (`h`).
    high_ballot: Option<Ballot>,
    /// Low end of the commit interval (`c`).
    commit: Option<Ballot>,
    /// Current phase.
    phase: BallotPhase,
    /// Latest ballot envelope per node (`M`).
    latest_envelopes: HashMap<NodeId, Envelope>,
    /// The value of the current ballot.
    value: Option<Value>,
    /// Set when a value is confirmed prepared or accepted committed, so
    /// later bumps stay on it.
    value_override: Option<Value>,
    /// Whether a quorum is at (or past) the current ballot counter.
    heard_from_quorum: bool,
    /// Re-entrancy depth of `advance_slot`.
    message_level: u32,
    /// Last envelope this node constructed.
    last_envelope: Option<Envelope>,
    /// Last envelope actually handed to the driver for broadcast.
    last_envelope_emit: Option<Envelope>,
}

impl BallotProtocol {
    /// Fresh state for a new slot.
    pub fn new() -> Self {
        Self {
            current_ballot: None,
            prepared: None,
            prepared_prime: None,
            high_ballot: None,
            commit: None,
            phase: BallotPhase::Prepare,
            latest_envelopes: HashMap::new(),
            value: None,
            value_override: None,
            heard_from_quorum: false,
            message_level: 0,
            last_envelope: None,
            last_envelope_emit: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> BallotPhase {
        self.phase
    }

    /// Current ballot (`b`).
    pub fn current_ballot(&self) -> Option<&Ballot> {
        self.current_ballot.as_ref()
    }

    /// Accepted-prepared ballot (`p`).
    pub fn prepared(&self) -> Option<&Ballot> {
        self.prepared.as_ref()
    }

    /// Accepted-prepared ballot incompatible with `p` (`p'`).
    pub fn prepared_prime(&self) -> Option<&Ballot> {
        self.prepared_prime.as_ref()
    }

    /// Highest confirmed-prepared ballot (`h`).
    pub fn high_ballot(&self) -> Option<&Ballot> {
        self.high_ballot.as_ref()
    }

    /// Commit ballot (`c`).
    pub fn commit(&self) -> Option<&Ballot> {
        self.commit.as_ref()
    }

    /// Whether this slot has externalized.
    pub fn is_externalized(&self) -> bool {
        self.phase == BallotPhase::Externalize
    }

    /// The externalized value, if consensus was reached.
    pub fn get_externalized_value(&self) -> Option<&Value> {
        if self.phase == BallotPhase::Externalize {
            self.value.as_ref()
        } else {
            None
        }
    }

    /// Whether a quorum has been heard for the current ballot.
    pub fn heard_from_quorum(&self) -> bool {
        self.heard_from_quorum
    }

    /// Latest envelope constructed by this node.
    pub fn get_last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    /// Latest envelope received from `node_id`.
    pub fn get_latest_envelope(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.latest_envelopes.get(node_id)
    }

    /// Latest envelope per node.
    pub fn latest_envelopes(&self) -> &HashMap<NodeId, Envelope> {
        &self.latest_envelopes
    }

    /// Envelopes that vouch for the externalized value: statements from
    /// other nodes compatible with the commit, plus our own.
    pub fn get_externalizing_state(&self, local_node_id: &NodeId) -> Vec<Envelope> {
        let mut res = Vec::new();
        if self.phase != BallotPhase::Externalize {
            return res;
        }
        let commit = match &self.commit {
            Some(c) => c,
            None => return res,
        };
        for (node_id, envelope) in &self.latest_envelopes {
            if node_id != local_node_id {
                if let Some(working) = get_working_ballot(&envelope.statement) {
                    if working.compatible(commit) {
                        res.push(envelope.clone());
                    }
                }
            } else {
                res.push(envelope.clone());
            }
        }
        res
    }

    /// Verify internal consistency. Violations mean the slot is poisoned.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.phase == BallotPhase::Prepare && self.commit.is_some() && self.high_ballot.is_none()
        {
            return Err("commit set without high ballot in Prepare".to_string());
        }

        if let (Some(prepared), Some(prepared_prime)) = (&self.prepared, &self.prepared_prime) {
            if prepared_prime >= prepared {
                return Err("prepared_prime must be below prepared".to_string());
            }
            if prepared_prime.compatible(prepared) {
                return Err("prepared_prime must be incompatible with prepared".to_string());
            }
        }

        if let (Some(commit), Some(high)) = (&self.commit, &self.high_ballot) {
            if commit.counter > high.counter {
                return Err("commit counter exceeds high counter".to_string());
            }
            if !commit.compatible(high) {
                return Err("commit and high carry different values".to_string());
            }
        }

        if self.phase == BallotPhase::Externalize
            && (self.commit.is_none() || self.high_ballot.is_none())
        {
            return Err("externalize requires commit and high".to_string());
        }

        Ok(())
    }

    /// One-line state summary for log lines.
    pub fn state_string(&self) -> String {
        let counter = |b: &Option<Ballot>| b.as_ref().map(|b| b.counter).unwrap_or(0);
        format!(
            "phase={:?} b={} p={} p'={} h={} c={} heard={} nodes={}",
            self.phase,
            counter(&self.current_ballot),
            counter(&self.prepared),
            counter(&self.prepared_prime),
            counter(&self.high_ballot),
            counter(&self.commit),
            self.heard_from_quorum,
            self.latest_envelopes.len()
        )
    }

    // ---- entry points -------------------------------------------------

    /// Process a ballot envelope that already passed sanity checking.
    pub(crate) fn process_envelope<D: Driver>(
        &mut self,
        envelope: &Envelope,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        let node_id = envelope.statement.node_id;

        if matches!(envelope.statement.pledges, StatementPledges::Nominate(_)) {
            return EnvelopeState::Invalid;
        }

        // Stale or duplicate statements are absorbed without progress.
        if !self.is_newer_statement(&node_id, &envelope.statement) {
            trace!(node = %node_id, "ignoring non-newer statement");
            return EnvelopeState::Valid;
        }

        if self.phase == BallotPhase::Externalize {
            // After externalizing only compatible statements are recorded;
            // anything else is evidence of a fork and is rejected.
            return if self.statement_value_matches_commit(&envelope.statement) {
                self.latest_envelopes.insert(node_id, envelope.clone());
                EnvelopeState::Valid
            } else {
                EnvelopeState::Invalid
            };
        }

        self.latest_envelopes.insert(node_id, envelope.clone());
        let state = self.advance_slot(&envelope.statement, ctx);

        if let Err(violation) = self.check_invariants() {
            debug_assert!(false, "ballot invariant violated: {violation}");
            warn!(slot = ctx.slot_index, %violation, "ballot invariant violated");
        }

        state
    }

    /// Adopt `value`: always when `force`, otherwise only if no ballot is
    /// active yet. No-op outside Prepare/Confirm.
    pub(crate) fn bump<D: Driver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        force: bool,
    ) -> bool {
        if !force && self.current_ballot.is_some() {
            return false;
        }
        let counter = self
            .current_ballot
            .as_ref()
            .map(|current| current.counter + 1)
            .unwrap_or(1);
        self.bump_state(ctx, value, counter)
    }

    /// Give up on the current ballot. `counter == 0` increments; a
    /// positive counter bumps to exactly that counter when it is ahead.
    pub(crate) fn abandon_ballot<D: Driver>(
        &mut self,
        counter: u32,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let Some(value) = self.pick_bump_value() else {
            return false;
        };
        let n = if counter == 0 {
            self.current_ballot
                .as_ref()
                .map(|b| b.counter + 1)
                .unwrap_or(1)
        } else {
            counter
        };
        self.bump_state(ctx, value, n)
    }

    /// Move to ballot `(counter, value)`, honoring the value override set
    /// by earlier confirmations. No-op outside Prepare/Confirm or when
    /// the target is not ahead of the current ballot.
    pub(crate) fn bump_state<D: Driver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        counter: u32,
    ) -> bool {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return false;
        }

        let effective_value = match &self.value_override {
            // Stay on the value we saw confirmed prepared or voted to commit.
            Some(override_val) => override_val.clone(),
            None => value,
        };

        let ballot = Ballot {
            counter,
            value: effective_value,
        };

        let updated = self.update_current_value(&ballot);

        if updated {
            debug!(
                slot = ctx.slot_index,
                counter, "adopted new ballot, arming timer"
            );
            ctx.driver
                .setup_timer(ctx.slot_index, ctx.driver.compute_timeout(counter));
            self.emit_current_state(ctx);
            self.check_heard_from_quorum(ctx);
        }

        updated
    }

    /// Restore state from a previously emitted envelope (restart path).
    pub fn set_state_from_envelope(&mut self, envelope: &Envelope) -> bool {
        match &envelope.statement.pledges {
            StatementPledges::Prepare(prep) => {
                self.current_ballot = Some(prep.ballot.clone());
                self.prepared = prep.prepared.clone();
                self.prepared_prime = prep.prepared_prime.clone();
                if prep.n_c != 0 {
                    self.commit = Some(Ballot {
                        counter: prep.n_c,
                        value: prep.ballot.value.clone(),
                    });
                }
                if prep.n_h != 0 {
                    self.high_ballot = Some(Ballot {
                        counter: prep.n_h,
                        value: prep.ballot.value.clone(),
                    });
                }
                self.value = Some(prep.ballot.value.clone());
                self.phase = BallotPhase::Prepare;
            }
            StatementPledges::Confirm(conf) => {
                self.current_ballot = Some(conf.ballot.clone());
                self.prepared = Some(Ballot {
                    counter: conf.n_prepared,
                    value: conf.ballot.value.clone(),
                });
                self.prepared_prime = None;
                self.commit = Some(Ballot {
                    counter: conf.n_commit,
                    value: conf.ballot.value.clone(),
                });
                self.high_ballot = Some(Ballot {
                    counter: conf.n_h,
                    value: conf.ballot.value.clone(),
                });
                self.value = Some(conf.ballot.value.clone());
                self.phase = BallotPhase::Confirm;
            }
            StatementPledges::Externalize(ext) => {
                self.commit = Some(ext.commit.clone());
                self.high_ballot = Some(Ballot {
                    counter: ext.n_h,
                    value: ext.commit.value.clone(),
                });
                self.current_ballot = Some(Ballot {
                    counter: u32::MAX,
                    value: ext.commit.value.clone(),
                });
                self.prepared = Some(Ballot {
                    counter: u32::MAX,
                    value: ext.commit.value.clone(),
                });
                self.value = Some(ext.commit.value.clone());
                self.phase = BallotPhase::Externalize;
            }
            StatementPledges::Nominate(_) => return false,
        }
        self.latest_envelopes
            .insert(envelope.statement.node_id, envelope.clone());
        self.last_envelope = Some(envelope.clone());
        true
    }

    // ---- statement ordering and sanity --------------------------------

    /// True when `statement` supersedes what we hold for `node_id`.
    pub fn is_newer_statement(&self, node_id: &NodeId, statement: &Statement) -> bool {
        match self.latest_envelopes.get(node_id) {
            None => true,
            Some(existing) => is_newer_statement_pair(&existing.statement, statement),
        }
    }

    /// Structural sanity for an incoming statement: resolvable and sane
    /// quorum set, positive counters, coherent prepare/commit bounds.
    pub(crate) fn is_statement_sane<D: Driver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let quorum_set = match self.statement_quorum_set(statement, ctx) {
            Some(qset) => qset,
            None => {
                trace!(node = %statement.node_id, "statement quorum set unresolved");
                return false;
            }
        };

        if is_quorum_set_sane(&quorum_set, false).is_err() {
            return false;
        }

        match &statement.pledges {
            StatementPledges::Prepare(prep) => {
                let is_self = statement.node_id == *ctx.local_node_id;
                if !is_self && prep.ballot.counter == 0 {
                    return false;
                }

                if let (Some(prepared_prime), Some(prepared)) =
                    (&prep.prepared_prime, &prep.prepared)
                {
                    if prepared_prime >= prepared || prepared_prime.compatible(prepared) {
                        return false;
                    }
                }

                if prep.n_h != 0 {
                    match &prep.prepared {
                        Some(prepared) if prep.n_h <= prepared.counter => {}
                        _ => return false,
                    }
                }

                if prep.n_c != 0
                    && (prep.n_h == 0 || prep.ballot.counter < prep.n_h || prep.n_h < prep.n_c)
                {
                    return false;
                }
            }
            StatementPledges::Confirm(conf) => {
                if conf.ballot.counter == 0
                    || conf.n_h > conf.ballot.counter
                    || conf.n_commit > conf.n_h
                {
                    return false;
                }
            }
            StatementPledges::Externalize(ext) => {
                if ext.commit.counter == 0 || ext.n_h < ext.commit.counter {
                    return false;
                }
            }
            StatementPledges::Nominate(_) => return false,
        }

        true
    }

    // ---- the advance loop ---------------------------------------------

    /// Run the attempt steps to a fixed point using `hint` to narrow the
    /// candidate space, then emit whatever changed.
    fn advance_slot<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        self.message_level += 1;
        if self.message_level > MAX_MESSAGE_LEVEL {
            warn!(
                slot = ctx.slot_index,
                level = self.message_level,
                "message level cap reached, deferring further progress"
            );
            self.message_level -= 1;
            return EnvelopeState::Valid;
        }

        let mut did_work = false;

        did_work = self.attempt_accept_prepared(hint, ctx) || did_work;
        did_work = self.attempt_confirm_prepared(hint, ctx) || did_work;
        did_work = self.attempt_accept_commit(hint, ctx) || did_work;
        did_work = self.attempt_confirm_commit(hint, ctx) || did_work;

        if self.message_level == 1 {
            // Only the outermost pass bumps; nested passes would race the
            // state they are in the middle of mutating.
            loop {
                if !self.attempt_bump(ctx) {
                    break;
                }
                did_work = true;
            }
            self.check_heard_from_quorum(ctx);
        }

        self.message_level -= 1;
        if did_work {
            self.send_latest_envelope(ctx.driver);
            EnvelopeState::ValidNew
        } else {
            EnvelopeState::Valid
        }
    }

    /// Step 1: accept ballots as prepared.
    fn attempt_accept_prepared<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let candidates = self.get_prepare_candidates(hint);

        for ballot in candidates.iter().rev() {
            if self.phase == BallotPhase::Confirm {
                // Once confirming, only advance p along the commit value.
                if let Some(prepared) = &self.prepared {
                    if !are_ballots_less_and_compatible(prepared, ballot) {
                        continue;
                    }
                }
                if let Some(commit) = &self.commit {
                    if !commit.compatible(ballot) {
                        continue;
                    }
                }
            }

            if let Some(prepared_prime) = &self.prepared_prime {
                if ballot <= prepared_prime {
                    // Candidates only get smaller from here.
                    break;
                }
            }

            if let Some(prepared) = &self.prepared {
                if are_ballots_less_and_compatible(ballot, prepared) {
                    continue;
                }
            }

            let accepted = voting::federated_accept(
                |st| self.statement_votes_prepared(ballot, st),
                |st| self.has_prepared_ballot(ballot, st),
                &self.latest_envelopes,
                ctx.local_quorum_set,
                self.quorum_set_lookup(ctx),
            );

            if accepted && self.set_accept_prepared(ballot.clone(), ctx) {
                return true;
            }
        }

        false
    }

    /// Record `ballot` as accepted-prepared, maintaining `p`/`p'` and
    /// clearing a commit made obsolete by a higher incompatible prepare.
    fn set_accept_prepared<D: Driver>(&mut self, ballot: Ballot, ctx: &SlotContext<'_, D>) -> bool {
        let mut did_work = self.set_prepared(ballot, ctx);

        if self.commit.is_some() && self.high_ballot.is_some() {
            let high = self.high_ballot.as_ref().unwrap();
            let obsolete = self
                .prepared
                .as_ref()
                .map(|p| are_ballots_less_and_incompatible(high, p))
                .unwrap_or(false)
                || self
                    .prepared_prime
                    .as_ref()
                    .map(|p| are_ballots_less_and_incompatible(high, p))
                    .unwrap_or(false);
            if obsolete {
                self.commit = None;
                did_work = true;
            }
        }

        if did_work {
            self.emit_current_state(ctx);
        }

        did_work
    }

    /// Step 2: confirm the highest ratified-prepared ballot.
    fn attempt_confirm_prepared<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        if self.phase != BallotPhase::Prepare || self.prepared.is_none() {
            return false;
        }

        let candidates = self.get_prepare_candidates(hint);
        let (new_h, new_h_index) = match self.find_highest_confirmed_prepared(&candidates, ctx) {
            Some(found) => found,
            None => return false,
        };

        let new_c = self.find_lowest_commit_ballot(&candidates, &new_h, new_h_index, ctx);
        self.set_confirm_prepared(new_c, new_h, ctx)
    }

    fn find_highest_confirmed_prepared<D: Driver>(
        &self,
        candidates: &[Ballot],
        ctx: &SlotContext<'_, D>,
    ) -> Option<(Ballot, usize)> {
        for (idx, ballot) in candidates.iter().enumerate().rev() {
            if let Some(high) = &self.high_ballot {
                if high >= ballot {
                    break;
                }
            }

            if voting::federated_ratify(
                |st| self.has_prepared_ballot(ballot, st),
                &self.latest_envelopes,
                ctx.local_quorum_set,
                self.quorum_set_lookup(ctx),
            ) {
                return Some((ballot.clone(), idx));
            }
        }
        None
    }

    /// Walk down from the new high ballot collecting the lowest ballot
    /// whose whole range up to `h` is ratified prepared; that is the
    /// commit vote we can place alongside the confirmation.
    fn find_lowest_commit_ballot<D: Driver>(
        &self,
        candidates: &[Ballot],
        new_h: &Ballot,
        new_h_index: usize,
        ctx: &SlotContext<'_, D>,
    ) -> Ballot {
        let mut new_c = Ballot {
            counter: 0,
            value: new_h.value.clone(),
        };

        let current = self.current_ballot.clone().unwrap_or(Ballot {
            counter: 0,
            value: new_h.value.clone(),
        });

        let can_vote_commit = self.commit.is_none()
            && self
                .prepared
                .as_ref()
                .map(|p| !are_ballots_less_and_incompatible(new_h, p))
                .unwrap_or(true)
            && self
                .prepared_prime
                .as_ref()
                .map(|p| !are_ballots_less_and_incompatible(new_h, p))
                .unwrap_or(true);

        if can_vote_commit {
            for ballot in candidates[..=new_h_index].iter().rev() {
                if ballot < &current {
                    break;
                }
                if !are_ballots_less_and_compatible(ballot, new_h) {
                    continue;
                }
                if voting::federated_ratify(
                    |st| self.has_prepared_ballot(ballot, st),
                    &self.latest_envelopes,
                    ctx.local_quorum_set,
                    self.quorum_set_lookup(ctx),
                ) {
                    new_c = ballot.clone();
                } else {
                    break;
                }
            }
        }

        new_c
    }

    fn set_confirm_prepared<D: Driver>(
        &mut self,
        new_c: Ballot,
        new_h: Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let mut did_work = false;
        self.value_override = Some(new_h.value.clone());

        let compatible_with_current = self
            .current_ballot
            .as_ref()
            .map(|b| b.compatible(&new_h))
            .unwrap_or(true);

        if compatible_with_current {
            if self
                .high_ballot
                .as_ref()
                .map(|b| new_h > *b)
                .unwrap_or(true)
            {
                self.high_ballot = Some(new_h.clone());
                did_work = true;
            }

            if new_c.counter != 0 && self.commit.is_none() {
                self.commit = Some(new_c);
                did_work = true;
            }

            if did_work {
                ctx.driver.confirmed_ballot_prepared(ctx.slot_index, &new_h);
            }
        }

        did_work = self.update_current_if_needed(&new_h) || did_work;
        if did_work {
            self.emit_current_state(ctx);
        }

        did_work
    }

    /// Step 3: accept a commit interval.
    fn attempt_accept_commit<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let Some(ballot) = self.hint_ballot_for_commit(hint) else {
            return false;
        };
        if self.phase == BallotPhase::Confirm {
            if let Some(high) = &self.high_ballot {
                if !ballot.compatible(high) {
                    return false;
                }
            }
        }

        let boundaries = self.get_commit_boundaries(&ballot);
        if boundaries.is_empty() {
            return false;
        }

        let mut candidate = (0u32, 0u32);
        self.find_extended_interval(&mut candidate, &boundaries, |interval| {
            voting::federated_accept(
                |st| self.statement_votes_commit(&ballot, interval, st),
                |st| self.commit_predicate(&ballot, interval, st),
                &self.latest_envelopes,
                ctx.local_quorum_set,
                self.quorum_set_lookup(ctx),
            )
        });

        if candidate.0 == 0 {
            return false;
        }

        if self.phase != BallotPhase::Confirm
            || candidate.1 > self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0)
        {
            let c = Ballot {
                counter: candidate.0,
                value: ballot.value.clone(),
            };
            let h = Ballot {
                counter: candidate.1,
                value: ballot.value.clone(),
            };
            return self.set_accept_commit(c, h, ctx);
        }

        false
    }

    fn set_accept_commit<D: Driver>(
        &mut self,
        c: Ballot,
        h: Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let mut did_work = false;
        self.value_override = Some(h.value.clone());

        if self.high_ballot.as_ref() != Some(&h) || self.commit.as_ref() != Some(&c) {
            self.commit = Some(c);
            self.high_ballot = Some(h.clone());
            did_work = true;
        }

        if self.phase == BallotPhase::Prepare {
            self.phase = BallotPhase::Confirm;
            if let Some(current) = &self.current_ballot {
                if !are_ballots_less_and_compatible(&h, current) {
                    self.bump_to_ballot(&h, false);
                }
            }
            self.prepared_prime = None;
            did_work = true;
        }

        if did_work {
            self.update_current_if_needed(&h);
            ctx.driver.accepted_commit(ctx.slot_index, &h);
            self.emit_current_state(ctx);
        }

        did_work
    }

    /// Step 4: ratify a commit interval and externalize.
    fn attempt_confirm_commit<D: Driver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        if self.phase != BallotPhase::Confirm {
            return false;
        }
        if self.high_ballot.is_none() || self.commit.is_none() {
            return false;
        }

        let Some(ballot) = self.hint_ballot_for_commit(hint) else {
            return false;
        };
        if !ballot.compatible(self.commit.as_ref().unwrap()) {
            return false;
        }

        let boundaries = self.get_commit_boundaries(&ballot);
        let mut candidate = (0u32, 0u32);
        self.find_extended_interval(&mut candidate, &boundaries, |interval| {
            voting::federated_ratify(
                |st| self.commit_predicate(&ballot, interval, st),
                &self.latest_envelopes,
                ctx.local_quorum_set,
                self.quorum_set_lookup(ctx),
            )
        });

        if candidate.0 == 0 {
            return false;
        }

        let c = Ballot {
            counter: candidate.0,
            value: ballot.value.clone(),
        };
        let h = Ballot {
            counter: candidate.1,
            value: ballot.value.clone(),
        };
        self.set_confirm_commit(c, h, ctx)
    }

    fn set_confirm_commit<D: Driver>(
        &mut self,
        c: Ballot,
        h: Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let externalized_value = c.value.clone();
        self.commit = Some(c);
        self.high_ballot = Some(h.clone());
        self.update_current_if_needed(&h);
        self.phase = BallotPhase::Externalize;
        // The slot is decided; the ballot timer has nothing left to do.
        ctx.driver.stop_timer(ctx.slot_index);

        self.emit_current_state(ctx);

        debug!(slot = ctx.slot_index, "externalized");
        ctx.driver
            .value_externalized(ctx.slot_index, &externalized_value);
        true
    }

    /// Step 5: when a whole quorum has moved past our counter, catch up
    /// to the smallest counter that quorum has reached.
    fn attempt_bump<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }
        if !self.heard_from_quorum {
            return false;
        }

        let local_counter = self
            .current_ballot
            .as_ref()
            .map(|b| b.counter)
            .unwrap_or(0);

        let mut counters = BTreeSet::new();
        for envelope in self.latest_envelopes.values() {
            let counter = statement_ballot_counter(&envelope.statement);
            if counter > local_counter {
                counters.insert(counter);
            }
        }

        let qsets = self.statement_quorum_set_map(ctx);
        for n in counters {
            let nodes: HashSet<NodeId> = self
                .latest_envelopes
                .iter()
                .filter(|(_, env)| statement_ballot_counter(&env.statement) >= n)
                .map(|(node_id, _)| *node_id)
                .collect();
            if is_quorum(ctx.local_quorum_set, &nodes, |node_id| {
                qsets.get(node_id).cloned()
            }) {
                debug!(slot = ctx.slot_index, to = n, "quorum ahead, bumping");
                return self.abandon_ballot(n, ctx);
            }
        }

        false
    }

    // ---- value and ballot bookkeeping ---------------------------------

    /// The value to carry into a bumped ballot: the override once one is
    /// locked in, otherwise the smallest working-ballot value seen this
    /// slot (the deterministic tie-break under split votes), otherwise
    /// whatever we were already on.
    fn pick_bump_value(&self) -> Option<Value> {
        if let Some(value) = &self.value_override {
            return Some(value.clone());
        }

        let mut best: Option<Value> = None;
        for envelope in self.latest_envelopes.values() {
            if let Some(working) = get_working_ballot(&envelope.statement) {
                if working.value.is_empty() {
                    continue;
                }
                best = match best {
                    None => Some(working.value),
                    Some(current) if working.value < current => Some(working.value),
                    keep => keep,
                };
            }
        }

        best.or_else(|| self.current_ballot.as_ref().map(|b| b.value.clone()))
    }

    fn update_current_if_needed(&mut self, ballot: &Ballot) -> bool {
        let behind = self
            .current_ballot
            .as_ref()
            .map(|b| b < ballot)
            .unwrap_or(true);
        if behind {
            self.bump_to_ballot(ballot, true)
        } else {
            false
        }
    }

    /// Adopt `ballot` as the current ballot after phase and commit
    /// compatibility checks.
    fn update_current_value(&mut self, ballot: &Ballot) -> bool {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return false;
        }

        if self.current_ballot.is_none() {
            return self.bump_to_ballot(ballot, true);
        }

        if let Some(commit) = &self.commit {
            if !commit.compatible(ballot) {
                return false;
            }
        }

        if self.current_ballot.as_ref().unwrap() < ballot {
            self.bump_to_ballot(ballot, true)
        } else {
            false
        }
    }

    /// Lowest-level ballot switch; maintains `h`/`c` compatibility and
    /// resets heard-from-quorum when the counter moves.
    fn bump_to_ballot(&mut self, ballot: &Ballot, check: bool) -> bool {
        if check {
            if let Some(current) = &self.current_ballot {
                if ballot <= current {
                    return false;
                }
            }
        }

        let got_bumped = match &self.current_ballot {
            None => true,
            Some(current) => current.counter != ballot.counter,
        };

        self.current_ballot = Some(ballot.clone());
        self.value = Some(ballot.value.clone());

        // invariant: h stays compatible with b, and c only exists under h.
        if let Some(high) = &self.high_ballot {
            if !ballot.compatible(high) {
                self.high_ballot = None;
                self.commit = None;
            }
        }

        if got_bumped {
            self.heard_from_quorum = false;
        }

        true
    }

    /// Record a ballot as accepted-prepared, keeping `p` maximal and `p'`
    /// the best incompatible runner-up.
    fn set_prepared<D: Driver>(&mut self, ballot: Ballot, ctx: &SlotContext<'_, D>) -> bool {
        let mut did_work = false;

        match &self.prepared {
            None => {
                self.prepared = Some(ballot.clone());
                did_work = true;
            }
            Some(current) if *current < ballot => {
                if !current.compatible(&ballot) {
                    self.prepared_prime = Some(current.clone());
                }
                self.prepared = Some(ballot.clone());
                did_work = true;
            }
            Some(current) if *current > ballot => {
                let update_prime = match &self.prepared_prime {
                    None => !current.compatible(&ballot),
                    Some(prime) => *prime < ballot && !current.compatible(&ballot),
                };
                if update_prime {
                    self.prepared_prime = Some(ballot.clone());
                    did_work = true;
                }
            }
            Some(_) => {}
        }

        if did_work {
            ctx.driver.accepted_ballot_prepared(ctx.slot_index, &ballot);
        }

        did_work
    }

    // ---- candidate and interval discovery -----------------------------

    fn collect_hint_ballots(hint: &Statement) -> Vec<Ballot> {
        let mut out = Vec::new();
        match &hint.pledges {
            StatementPledges::Prepare(prep) => {
                out.push(prep.ballot.clone());
                if let Some(prepared) = &prep.prepared {
                    out.push(prepared.clone());
                }
                if let Some(prepared_prime) = &prep.prepared_prime {
                    out.push(prepared_prime.clone());
                }
            }
            StatementPledges::Confirm(conf) => {
                out.push(Ballot {
                    counter: conf.n_prepared,
                    value: conf.ballot.value.clone(),
                });
                out.push(Ballot {
                    counter: u32::MAX,
                    value: conf.ballot.value.clone(),
                });
            }
            StatementPledges::Externalize(ext) => {
                out.push(Ballot {
                    counter: u32::MAX,
                    value: ext.commit.value.clone(),
                });
            }
            StatementPledges::Nominate(_) => {}
        }
        out
    }

    /// Ballots worth testing for prepared-acceptance: everything vouched
    /// for in `M` at or below one of the hint's ballots, deduplicated and
    /// sorted ascending.
    fn get_prepare_candidates(&self, hint: &Statement) -> Vec<Ballot> {
        let mut hint_ballots = Self::collect_hint_ballots(hint);
        hint_ballots.sort();

        let mut seen: HashSet<Ballot> = HashSet::new();

        for top_vote in hint_ballots.iter().rev() {
            for envelope in self.latest_envelopes.values() {
                match &envelope.statement.pledges {
                    StatementPledges::Prepare(prep) => {
                        if are_ballots_less_and_compatible(&prep.ballot, top_vote) {
                            seen.insert(prep.ballot.clone());
                        }
                        if let Some(prepared) = &prep.prepared {
                            if are_ballots_less_and_compatible(prepared, top_vote) {
                                seen.insert(prepared.clone());
                            }
                        }
                        if let Some(prepared_prime) = &prep.prepared_prime {
                            if are_ballots_less_and_compatible(prepared_prime, top_vote) {
                                seen.insert(prepared_prime.clone());
                            }
                        }
                    }
                    StatementPledges::Confirm(conf) => {
                        if top_vote.compatible(&conf.ballot) {
                            seen.insert(top_vote.clone());
                            if conf.n_prepared < top_vote.counter {
                                seen.insert(Ballot {
                                    counter: conf.n_prepared,
                                    value: top_vote.value.clone(),
                                });
                            }
                        }
                    }
                    StatementPledges::Externalize(ext) => {
                        if top_vote.compatible(&ext.commit) {
                            seen.insert(top_vote.clone());
                        }
                    }
                    StatementPledges::Nominate(_) => {}
                }
            }
        }

        let mut candidates: Vec<Ballot> = seen.into_iter().collect();
        candidates.sort();
        candidates
    }

    /// Counters at which some statement's commit interval starts or ends,
    /// restricted to statements compatible with `ballot`.
    fn get_commit_boundaries(&self, ballot: &Ballot) -> BTreeSet<u32> {
        let mut res = BTreeSet::new();
        for envelope in self.latest_envelopes.values() {
            match &envelope.statement.pledges {
                StatementPledges::Prepare(prep) => {
                    if ballot.compatible(&prep.ballot) && prep.n_c != 0 {
                        res.insert(prep.n_c);
                        res.insert(prep.n_h);
                    }
                }
                StatementPledges::Confirm(conf) => {
                    if ballot.compatible(&conf.ballot) {
                        res.insert(conf.n_commit);
                        res.insert(conf.n_h);
                    }
                }
                StatementPledges::Externalize(ext) => {
                    if ballot.compatible(&ext.commit) {
                        res.insert(ext.commit.counter);
                        res.insert(ext.n_h);
                        res.insert(u32::MAX);
                    }
                }
                StatementPledges::Nominate(_) => {}
            }
        }
        res
    }

    /// Greedily widen `candidate` downward across `boundaries` while the
    /// predicate keeps holding for the widened interval.
    fn find_extended_interval<F>(
        &self,
        candidate: &mut (u32, u32),
        boundaries: &BTreeSet<u32>,
        pred: F,
    ) where
        F: Fn((u32, u32)) -> bool,
    {
        for boundary in boundaries.iter().rev() {
            let current = if candidate.0 == 0 {
                (*boundary, *boundary)
            } else if *boundary > candidate.1 {
                continue;
            } else {
                (*boundary, candidate.1)
            };

            if pred(current) {
                *candidate = current;
            } else if candidate.0 != 0 {
                break;
            }
        }
    }

    /// The ballot a hint suggests testing commit intervals against.
    fn hint_ballot_for_commit(&self, hint: &Statement) -> Option<Ballot> {
        match &hint.pledges {
            StatementPledges::Prepare(prep) => {
                if prep.n_c != 0 {
                    Some(Ballot {
                        counter: prep.n_h,
                        value: prep.ballot.value.clone(),
                    })
                } else {
                    None
                }
            }
            StatementPledges::Confirm(conf) => Some(Ballot {
                counter: conf.n_h,
                value: conf.ballot.value.clone(),
            }),
            StatementPledges::Externalize(ext) => Some(Ballot {
                counter: ext.n_h,
                value: ext.commit.value.clone(),
            }),
            StatementPledges::Nominate(_) => None,
        }
    }

    // ---- statement predicates -----------------------------------------

    /// Does `statement` vote "prepare `ballot`"?
    fn statement_votes_prepared(&self, ballot: &Ballot, statement: &Statement) -> bool {
        match &statement.pledges {
            StatementPledges::Prepare(prep) => {
                are_ballots_less_and_compatible(ballot, &prep.ballot)
            }
            StatementPledges::Confirm(conf) => ballot.compatible(&conf.ballot),
            StatementPledges::Externalize(ext) => ballot.compatible(&ext.commit),
            StatementPledges::Nominate(_) => false,
        }
    }

    /// Does `statement` vouch that `ballot` is accepted prepared?
    fn has_prepared_ballot(&self, ballot: &Ballot, statement: &Statement) -> bool {
        match &statement.pledges {
            StatementPledges::Prepare(prep) => {
                prep.prepared
                    .as_ref()
                    .map(|p| are_ballots_less_and_compatible(ballot, p))
                    .unwrap_or(false)
                    || prep
                        .prepared_prime
                        .as_ref()
                        .map(|p| are_ballots_less_and_compatible(ballot, p))
                        .unwrap_or(false)
            }
            StatementPledges::Confirm(conf) => {
                let prepared = Ballot {
                    counter: conf.n_prepared,
                    value: conf.ballot.value.clone(),
                };
                are_ballots_less_and_compatible(ballot, &prepared)
            }
            StatementPledges::Externalize(ext) => ballot.compatible(&ext.commit),
            StatementPledges::Nominate(_) => false,
        }
    }

    /// Does `statement` vote "commit `ballot`" over the whole interval?
    fn statement_votes_commit(
        &self,
        ballot: &Ballot,
        interval: (u32, u32),
        statement: &Statement,
    ) -> bool {
        match &statement.pledges {
            StatementPledges::Prepare(prep) => {
                ballot.compatible(&prep.ballot)
                    && prep.n_c != 0
                    && prep.n_c <= interval.0
                    && interval.1 <= prep.n_h
            }
            StatementPledges::Confirm(conf) => {
                ballot.compatible(&conf.ballot) && conf.n_commit <= interval.0
            }
            StatementPledges::Externalize(ext) => {
                ballot.compatible(&ext.commit) && ext.commit.counter <= interval.0
            }
            StatementPledges::Nominate(_) => false,
        }
    }

    /// Does `statement` accept "commit `ballot`" for every counter in the
    /// interval?
    fn commit_predicate(&self, ballot: &Ballot, interval: (u32, u32), statement: &Statement) -> bool {
        match &statement.pledges {
            StatementPledges::Confirm(conf) => {
                ballot.compatible(&conf.ballot)
                    && conf.n_commit <= interval.0
                    && interval.1 <= conf.n_h
            }
            StatementPledges::Externalize(ext) => {
                ballot.compatible(&ext.commit) && ext.commit.counter <= interval.0
            }
            StatementPledges::Prepare(_) | StatementPledges::Nominate(_) => false,
        }
    }

    fn statement_value_matches_commit(&self, statement: &Statement) -> bool {
        let commit = match self.commit.as_ref() {
            Some(commit) => commit,
            None => return false,
        };
        match &statement.pledges {
            StatementPledges::Prepare(prep) => commit.value == prep.ballot.value,
            StatementPledges::Confirm(conf) => commit.value == conf.ballot.value,
            StatementPledges::Externalize(ext) => commit.value == ext.commit.value,
            StatementPledges::Nominate(_) => false,
        }
    }

    // ---- quorum set resolution ----------------------------------------

    /// The quorum set to evaluate `statement` under. Externalize implies
    /// a singleton set: the sender no longer needs anyone's agreement.
    fn statement_quorum_set<D: Driver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> Option<QuorumSet> {
        match &statement.pledges {
            StatementPledges::Externalize(_) => Some(singleton_quorum_set(statement.node_id)),
            StatementPledges::Prepare(_) | StatementPledges::Confirm(_) => self.resolve_quorum_set(
                &statement.companion_quorum_set_hash(),
                &statement.node_id,
                ctx,
            ),
            StatementPledges::Nominate(_) => None,
        }
    }

    /// Resolve a quorum set from its companion hash: local set, driver
    /// hash cache, then per-node lookup verified against the hash.
    fn resolve_quorum_set<D: Driver>(
        &self,
        provided: &concord_common::Hash256,
        node_id: &NodeId,
        ctx: &SlotContext<'_, D>,
    ) -> Option<QuorumSet> {
        if node_id == ctx.local_node_id && hash_quorum_set(ctx.local_quorum_set) == *provided {
            return Some(ctx.local_quorum_set.clone());
        }
        if let Some(qset) = ctx.driver.get_quorum_set_by_hash(provided) {
            return Some(qset);
        }
        ctx.driver.get_quorum_set(node_id).and_then(|qset| {
            if hash_quorum_set(&qset) == *provided {
                Some(qset)
            } else {
                None
            }
        })
    }

    /// Quorum sets for every node in `M`, plus our own.
    fn statement_quorum_set_map<D: Driver>(
        &self,
        ctx: &SlotContext<'_, D>,
    ) -> HashMap<NodeId, QuorumSet> {
        let mut map = HashMap::new();
        for (node_id, envelope) in &self.latest_envelopes {
            if let Some(qset) = self.statement_quorum_set(&envelope.statement, ctx) {
                map.insert(*node_id, qset);
            }
        }
        map.entry(*ctx.local_node_id)
            .or_insert_with(|| ctx.local_quorum_set.clone());
        map
    }

    /// A lookup closure over [`Self::statement_quorum_set_map`] for the
    /// federated-voting predicates. The closure owns its snapshot of the
    /// quorum sets.
    fn quorum_set_lookup<D: Driver>(
        &self,
        ctx: &SlotContext<'_, D>,
    ) -> impl Fn(&NodeId) -> Option<QuorumSet> {
        let qsets = self.statement_quorum_set_map(ctx);
        move |node_id: &NodeId| qsets.get(node_id).cloned()
    }

    /// Re-evaluate heard-from-quorum for the current ballot, arming the
    /// ballot timer on the false→true transition and retiring it once
    /// externalized.
    fn check_heard_from_quorum<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) {
        let current = match self.current_ballot.as_ref() {
            Some(ballot) => ballot.clone(),
            None => return,
        };

        let mut nodes = HashSet::new();
        let mut quorum_sets = HashMap::new();

        for (node_id, envelope) in &self.latest_envelopes {
            let include = match &envelope.statement.pledges {
                StatementPledges::Prepare(prep) => current.counter <= prep.ballot.counter,
                StatementPledges::Confirm(_) | StatementPledges::Externalize(_) => true,
                StatementPledges::Nominate(_) => false,
            };
            if !include {
                continue;
            }
            nodes.insert(*node_id);
            if let Some(qs) = self.statement_quorum_set(&envelope.statement, ctx) {
                quorum_sets.insert(*node_id, qs);
            }
        }

        if is_quorum(ctx.local_quorum_set, &nodes, |node_id| {
            quorum_sets.get(node_id).cloned()
        }) {
            let newly_heard = !self.heard_from_quorum;
            self.heard_from_quorum = true;
            if newly_heard {
                ctx.driver.ballot_heard_from_quorum(ctx.slot_index, &current);
                if self.phase != BallotPhase::Externalize {
                    let timeout = ctx.driver.compute_timeout(current.counter);
                    ctx.driver.setup_timer(ctx.slot_index, timeout);
                }
            }
            if self.phase == BallotPhase::Externalize {
                ctx.driver.stop_timer(ctx.slot_index);
            }
        } else {
            self.heard_from_quorum = false;
        }
    }

    // ---- emission ------------------------------------------------------

    /// Hand the latest envelope to the driver, once, from the outermost
    /// level only. Identical envelopes are never emitted twice in a row.
    fn send_latest_envelope<D: Driver>(&mut self, driver: &Arc<D>) {
        if self.message_level != 0 {
            return;
        }
        let Some(envelope) = self.last_envelope.as_ref() else {
            return;
        };
        if self.last_envelope_emit.as_ref() == Some(envelope) {
            return;
        }
        self.last_envelope_emit = Some(envelope.clone());
        driver.emit_envelope(envelope);
    }

    /// Build the statement describing the current state, record it as a
    /// self-envelope, and feed it back through `advance_slot` so cascaded
    /// transitions complete within one receive.
    fn emit_current_state<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) {
        let maybe_statement = match self.phase {
            BallotPhase::Prepare => self.emit_prepare(ctx),
            BallotPhase::Confirm => self.emit_confirm(ctx),
            BallotPhase::Externalize => self.emit_externalize(ctx),
        };

        if let Some(statement) = maybe_statement {
            self.advance_slot(&statement, ctx);
        }
        // If the self-processing cascaded, the final envelope was already
        // sent from the nested advance_slot; the dedup in
        // send_latest_envelope keeps this from double-emitting.
        self.send_latest_envelope(ctx.driver);
    }

    /// Build and record a PREPARE statement.
    ///
    /// With no current ballot a PREPARE with ballot `(0, "")` is still
    /// recorded as a self-envelope — the local node's prepared fields must
    /// count in quorum calculations — but it is withheld from the network
    /// until a real ballot exists.
    fn emit_prepare<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let can_emit = self.current_ballot.is_some();
        let ballot = self.current_ballot.clone().unwrap_or(Ballot {
            counter: 0,
            value: Value::empty(),
        });

        let prep = StatementPrepare {
            quorum_set_hash: hash_quorum_set(ctx.local_quorum_set),
            ballot,
            prepared: self.prepared.clone(),
            prepared_prime: self.prepared_prime.clone(),
            n_c: self.commit.as_ref().map(|b| b.counter).unwrap_or(0),
            n_h: self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0),
        };

        self.record_envelope(StatementPledges::Prepare(prep), can_emit, ctx)
    }

    /// Build and record a CONFIRM statement.
    fn emit_confirm<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let ballot = self.current_ballot.clone()?;
        let conf = StatementConfirm {
            ballot,
            n_prepared: self.prepared.as_ref().map(|b| b.counter).unwrap_or(0),
            n_commit: self.commit.as_ref().map(|b| b.counter).unwrap_or(0),
            n_h: self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0),
            quorum_set_hash: hash_quorum_set(ctx.local_quorum_set),
        };
        self.record_envelope(StatementPledges::Confirm(conf), true, ctx)
    }

    /// Build and record an EXTERNALIZE statement.
    fn emit_externalize<D: Driver>(&mut self, ctx: &SlotContext<'_, D>) -> Option<Statement> {
        let commit = self.commit.clone()?;
        let ext = StatementExternalize {
            commit,
            n_h: self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0),
            commit_quorum_set_hash: hash_quorum_set(ctx.local_quorum_set),
        };
        self.record_envelope(StatementPledges::Externalize(ext), true, ctx)
    }

    /// Sign and record an envelope built from `pledges`. When `set_last`
    /// the envelope becomes the one offered for network emission.
    fn record_envelope<D: Driver>(
        &mut self,
        pledges: StatementPledges,
        set_last: bool,
        ctx: &SlotContext<'_, D>,
    ) -> Option<Statement> {
        let statement = Statement {
            node_id: *ctx.local_node_id,
            slot_index: ctx.slot_index,
            pledges,
        };

        let mut envelope = Envelope {
            statement: statement.clone(),
            signature: Signature::default(),
        };
        ctx.driver.sign_envelope(&mut envelope);

        if !self.is_newer_statement(ctx.local_node_id, &envelope.statement) {
            return None;
        }
        self.latest_envelopes.insert(*ctx.local_node_id, envelope.clone());
        if set_last {
            self.last_envelope = Some(envelope);
        }
        Some(statement)
    }
}

impl Default for BallotProtocol {
    fn default() -> Self {
        Self::new()
    }
}

// ---- ballot ordering helpers ------------------------------------------

/// `a <= b ∧ a ~ b`.
pub(crate) fn are_ballots_less_and_compatible(a: &Ballot, b: &Ballot) -> bool {
    a <= b && a.compatible(b)
}

/// `a <= b ∧ a !~ b`.
pub(crate) fn are_ballots_less_and_incompatible(a: &Ballot, b: &Ballot) -> bool {
    a <= b && !a.compatible(b)
}

/// The counter a statement is working at, for quorum-ahead detection.
fn statement_ballot_counter(statement: &Statement) -> u32 {
    match &statement.pledges {
        StatementPledges::Prepare(prep) => prep.ballot.counter,
        StatementPledges::Confirm(conf) => conf.ballot.counter,
        StatementPledges::Externalize(_) => u32::MAX,
        StatementPledges::Nominate(_) => 0,
    }
}

/// Composite newer-than order over statements from one node: phase rank
/// first (Prepare < Confirm < Externalize), then the type-specific fields.
pub(crate) fn is_newer_statement_pair(old: &Statement, new: &Statement) -> bool {
    fn pledge_rank(pledges: &StatementPledges) -> u8 {
        match pledges {
            StatementPledges::Prepare(_) => 0,
            StatementPledges::Confirm(_) => 1,
            StatementPledges::Externalize(_) => 2,
            StatementPledges::Nominate(_) => 3,
        }
    }

    fn cmp_opt_ballot(a: &Option<Ballot>, b: &Option<Ballot>) -> std::cmp::Ordering {
        match (a, b) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }

    let old_rank = pledge_rank(&old.pledges);
    let new_rank = pledge_rank(&new.pledges);
    if old_rank != new_rank {
        return old_rank < new_rank;
    }

    match (&old.pledges, &new.pledges) {
        (StatementPledges::Externalize(_), StatementPledges::Externalize(_)) => false,
        (StatementPledges::Confirm(old_c), StatementPledges::Confirm(new_c)) => {
            match old_c.ballot.cmp(&new_c.ballot) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => {
                    if old_c.n_prepared == new_c.n_prepared {
                        old_c.n_h < new_c.n_h
                    } else {
                        old_c.n_prepared < new_c.n_prepared
                    }
                }
            }
        }
        (StatementPledges::Prepare(old_p), StatementPledges::Prepare(new_p)) => {
            match old_p.ballot.cmp(&new_p.ballot) {
                std::cmp::Ordering::Less => return true,
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal => {}
            }
            match cmp_opt_ballot(&old_p.prepared, &new_p.prepared) {
                std::cmp::Ordering::Less => return true,
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal => {}
            }
            match cmp_opt_ballot(&old_p.prepared_prime, &new_p.prepared_prime) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => old_p.n_h < new_p.n_h,
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests;
