use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::*;
use crate::quorum::simple_quorum_set;
use crate::Driver;

struct TestDriver {
    quorum_sets: RwLock<HashMap<NodeId, QuorumSet>>,
    emitted: RwLock<Vec<Envelope>>,
    externalized: RwLock<Vec<(u64, Value)>>,
    timers_armed: AtomicU32,
    timers_stopped: AtomicU32,
}

impl TestDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            quorum_sets: RwLock::new(HashMap::new()),
            emitted: RwLock::new(Vec::new()),
            externalized: RwLock::new(Vec::new()),
            timers_armed: AtomicU32::new(0),
            timers_stopped: AtomicU32::new(0),
        })
    }

    fn register(&self, node_id: NodeId, qset: QuorumSet) {
        self.quorum_sets.write().insert(node_id, qset);
    }

    fn emitted_count(&self) -> usize {
        self.emitted.read().len()
    }
}

impl Driver for TestDriver {
    fn sign_envelope(&self, envelope: &mut Envelope) {
        envelope.signature = Signature(vec![0xEE]);
    }

    fn verify_envelope(&self, _envelope: &Envelope) -> bool {
        true
    }

    fn get_quorum_set(&self, node_id: &NodeId) -> Option<QuorumSet> {
        self.quorum_sets.read().get(node_id).cloned()
    }

    fn emit_envelope(&self, envelope: &Envelope) {
        self.emitted.write().push(envelope.clone());
    }

    fn value_externalized(&self, slot_index: u64, value: &Value) {
        self.externalized.write().push((slot_index, value.clone()));
    }

    fn setup_timer(&self, _slot_index: u64, _timeout: Duration) {
        self.timers_armed.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_timer(&self, _slot_index: u64) {
        self.timers_stopped.fetch_add(1, Ordering::SeqCst);
    }
}

fn node(seed: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    NodeId(bytes)
}

fn val(byte: u8) -> Value {
    Value(vec![byte])
}

fn four_node_qset() -> QuorumSet {
    simple_quorum_set(3, (1..=4).map(node).collect())
}

struct Fixture {
    driver: Arc<TestDriver>,
    local: NodeId,
    qset: QuorumSet,
}

impl Fixture {
    fn new() -> Self {
        let driver = TestDriver::new();
        let qset = four_node_qset();
        for seed in 1..=4 {
            driver.register(node(seed), qset.clone());
        }
        Self {
            driver,
            local: node(1),
            qset,
        }
    }

    fn ctx(&self) -> SlotContext<'_, TestDriver> {
        SlotContext {
            local_node_id: &self.local,
            local_quorum_set: &self.qset,
            driver: &self.driver,
            slot_index: 1,
        }
    }

    fn prepare_envelope(
        &self,
        from: NodeId,
        ballot: Ballot,
        prepared: Option<Ballot>,
        prepared_prime: Option<Ballot>,
        n_c: u32,
        n_h: u32,
    ) -> Envelope {
        let mut envelope = Envelope {
            statement: Statement {
                node_id: from,
                slot_index: 1,
                pledges: StatementPledges::Prepare(StatementPrepare {
                    quorum_set_hash: hash_quorum_set(&self.qset),
                    ballot,
                    prepared,
                    prepared_prime,
                    n_c,
                    n_h,
                }),
            },
            signature: Signature::default(),
        };
        self.driver.sign_envelope(&mut envelope);
        envelope
    }

    fn confirm_envelope(
        &self,
        from: NodeId,
        ballot: Ballot,
        n_prepared: u32,
        n_commit: u32,
        n_h: u32,
    ) -> Envelope {
        let mut envelope = Envelope {
            statement: Statement {
                node_id: from,
                slot_index: 1,
                pledges: StatementPledges::Confirm(StatementConfirm {
                    ballot,
                    n_prepared,
                    n_commit,
                    n_h,
                    quorum_set_hash: hash_quorum_set(&self.qset),
                }),
            },
            signature: Signature::default(),
        };
        self.driver.sign_envelope(&mut envelope);
        envelope
    }
}

#[test]
fn bump_adopts_a_first_ballot_and_emits_prepare() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();

    assert!(ballot.bump(&fx.ctx(), val(b'V'), false));

    let current = ballot.current_ballot().unwrap();
    assert_eq!(current.counter, 1);
    assert_eq!(current.value, val(b'V'));
    assert_eq!(ballot.phase(), BallotPhase::Prepare);

    // The prepare statement went out and a ballot timer was armed.
    assert_eq!(fx.driver.emitted_count(), 1);
    assert!(fx.driver.timers_armed.load(Ordering::SeqCst) >= 1);

    // A second non-forced bump is a no-op.
    assert!(!ballot.bump(&fx.ctx(), val(b'W'), false));
    assert_eq!(ballot.current_ballot().unwrap().value, val(b'V'));
}

#[test]
fn reprocessing_own_statement_is_a_fixed_point() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    assert!(ballot.bump(&fx.ctx(), val(b'V'), true));

    let own = ballot.get_last_envelope().unwrap().clone();
    let emitted_before = fx.driver.emitted_count();

    assert_eq!(ballot.process_envelope(&own, &fx.ctx()), EnvelopeState::Valid);
    assert_eq!(ballot.current_ballot().unwrap().counter, 1);
    assert_eq!(fx.driver.emitted_count(), emitted_before);
}

#[test]
fn duplicate_envelopes_are_absorbed() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'V'), true);

    let env = fx.prepare_envelope(node(2), Ballot::new(1, val(b'V')), None, None, 0, 0);
    let first = ballot.process_envelope(&env, &fx.ctx());
    assert!(first.is_valid());

    let state_before = ballot.state_string();
    let emitted_before = fx.driver.emitted_count();

    let second = ballot.process_envelope(&env, &fx.ctx());
    assert_eq!(second, EnvelopeState::Valid);
    assert_eq!(ballot.state_string(), state_before);
    assert_eq!(fx.driver.emitted_count(), emitted_before);
}

#[test]
fn quorum_vote_accepts_prepared() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'V'), true);

    let b1 = Ballot::new(1, val(b'V'));
    // Nodes 2 and 3 voting prepare, plus our own vote, is a 3-of-4 quorum.
    ballot.process_envelope(
        &fx.prepare_envelope(node(2), b1.clone(), None, None, 0, 0),
        &fx.ctx(),
    );
    assert!(ballot.prepared().is_none());

    ballot.process_envelope(
        &fx.prepare_envelope(node(3), b1.clone(), None, None, 0, 0),
        &fx.ctx(),
    );
    assert_eq!(ballot.prepared(), Some(&b1));
}

#[test]
fn v_blocking_accepts_prepared_without_quorum() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'V'), true);

    let b1 = Ballot::new(1, val(b'V'));
    // Two nodes already accepted (their prepared field vouches for it):
    // that is v-blocking for a 3-of-4 slice even without a quorum.
    ballot.process_envelope(
        &fx.prepare_envelope(node(2), b1.clone(), Some(b1.clone()), None, 0, 0),
        &fx.ctx(),
    );
    ballot.process_envelope(
        &fx.prepare_envelope(node(3), b1.clone(), Some(b1.clone()), None, 0, 0),
        &fx.ctx(),
    );

    assert_eq!(ballot.prepared(), Some(&b1));
}

#[test]
fn incompatible_accepts_maintain_prepared_prime() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();

    let by = Ballot::new(1, val(b'Y'));
    let bx = Ballot::new(2, val(b'X'));

    // First wave: v-blocking set accepted (1, Y) as prepared.
    ballot.process_envelope(
        &fx.prepare_envelope(node(2), by.clone(), Some(by.clone()), None, 0, 0),
        &fx.ctx(),
    );
    ballot.process_envelope(
        &fx.prepare_envelope(node(3), by.clone(), Some(by.clone()), None, 0, 0),
        &fx.ctx(),
    );
    assert_eq!(ballot.prepared(), Some(&by));

    // Second wave: the same nodes moved on and accepted (2, X).
    ballot.process_envelope(
        &fx.prepare_envelope(node(2), bx.clone(), Some(bx.clone()), None, 0, 0),
        &fx.ctx(),
    );
    ballot.process_envelope(
        &fx.prepare_envelope(node(3), bx.clone(), Some(bx.clone()), None, 0, 0),
        &fx.ctx(),
    );

    assert_eq!(ballot.prepared(), Some(&bx));
    assert_eq!(ballot.prepared_prime(), Some(&by));
    ballot.check_invariants().unwrap();
}

#[test]
fn ballot_counters_are_monotone() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'V'), true);

    let mut last_counter = ballot.current_ballot().unwrap().counter;

    let b3 = Ballot::new(3, val(b'V'));
    ballot.process_envelope(
        &fx.prepare_envelope(node(2), b3.clone(), Some(b3.clone()), None, 0, 0),
        &fx.ctx(),
    );
    ballot.process_envelope(
        &fx.prepare_envelope(node(3), b3.clone(), Some(b3.clone()), None, 0, 0),
        &fx.ctx(),
    );
    let counter = ballot.current_ballot().unwrap().counter;
    assert!(counter >= last_counter);
    last_counter = counter;

    // An explicit bump downward is refused.
    assert!(!ballot.bump_state(&fx.ctx(), val(b'V'), 1));
    assert!(ballot.current_ballot().unwrap().counter >= last_counter);
    ballot.check_invariants().unwrap();
}

#[test]
fn quorum_ahead_forces_a_bump() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'V'), true);
    assert_eq!(ballot.current_ballot().unwrap().counter, 1);

    let b3 = Ballot::new(3, val(b'V'));
    // First two envelopes at counter 3 establish heard-from-quorum
    // (prepare statements at or past our counter count toward it).
    ballot.process_envelope(
        &fx.prepare_envelope(node(2), b3.clone(), None, None, 0, 0),
        &fx.ctx(),
    );
    ballot.process_envelope(
        &fx.prepare_envelope(node(3), b3.clone(), None, None, 0, 0),
        &fx.ctx(),
    );
    assert!(ballot.heard_from_quorum());

    // Third envelope completes a quorum entirely at counter 3: we must
    // catch up to exactly that counter.
    ballot.process_envelope(
        &fx.prepare_envelope(node(4), b3.clone(), None, None, 0, 0),
        &fx.ctx(),
    );
    assert_eq!(ballot.current_ballot().unwrap().counter, 3);
    assert_eq!(ballot.current_ballot().unwrap().value, val(b'V'));
}

#[test]
fn confirm_statements_drive_externalize() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'V'), true);

    let b1 = Ballot::new(1, val(b'V'));

    // Prepared acceptance and confirmation via the other three nodes.
    for seed in 2..=4 {
        ballot.process_envelope(
            &fx.prepare_envelope(node(seed), b1.clone(), Some(b1.clone()), None, 0, 0),
            &fx.ctx(),
        );
    }
    assert_eq!(ballot.prepared(), Some(&b1));
    assert_eq!(ballot.high_ballot(), Some(&b1));

    // Commit acceptance and ratification via CONFIRM statements.
    for seed in 2..=4 {
        ballot.process_envelope(
            &fx.confirm_envelope(node(seed), b1.clone(), 1, 1, 1),
            &fx.ctx(),
        );
    }

    assert_eq!(ballot.phase(), BallotPhase::Externalize);
    assert_eq!(ballot.get_externalized_value(), Some(&val(b'V')));
    assert_eq!(ballot.commit(), Some(&b1));
    assert_eq!(fx.driver.externalized.read().clone(), vec![(1, val(b'V'))]);
    // Externalize retires the ballot timer.
    assert!(fx.driver.timers_stopped.load(Ordering::SeqCst) >= 1);
    ballot.check_invariants().unwrap();

    // Envelopes for other values are rejected after externalization.
    let stray = fx.prepare_envelope(node(2), Ballot::new(9, val(b'W')), None, None, 0, 0);
    assert_eq!(
        ballot.process_envelope(&stray, &fx.ctx()),
        EnvelopeState::Invalid
    );
}

#[test]
fn message_level_cap_defers_but_does_not_wedge() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'V'), true);

    let b1 = Ballot::new(1, val(b'V'));

    // Simulate arriving in the middle of a deep re-entrant cascade: the
    // pass returns without progress instead of recursing further.
    ballot.set_message_level_for_test(MAX_MESSAGE_LEVEL);
    let deferred = ballot.process_envelope(
        &fx.prepare_envelope(node(2), b1.clone(), Some(b1.clone()), None, 0, 0),
        &fx.ctx(),
    );
    assert_eq!(deferred, EnvelopeState::Valid);
    ballot.set_message_level_for_test(0);

    // Liveness: the next external envelope still advances the slot.
    let after = ballot.process_envelope(
        &fx.prepare_envelope(node(3), b1.clone(), Some(b1.clone()), None, 0, 0),
        &fx.ctx(),
    );
    assert_eq!(after, EnvelopeState::ValidNew);
    assert_eq!(ballot.prepared(), Some(&b1));
}

#[test]
fn abandon_ballot_increments_or_jumps() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'V'), true);

    assert!(ballot.abandon_ballot(0, &fx.ctx()));
    assert_eq!(ballot.current_ballot().unwrap().counter, 2);

    assert!(ballot.abandon_ballot(7, &fx.ctx()));
    assert_eq!(ballot.current_ballot().unwrap().counter, 7);

    // Jumping backwards is refused.
    assert!(!ballot.abandon_ballot(3, &fx.ctx()));
    assert_eq!(ballot.current_ballot().unwrap().counter, 7);
}

#[test]
fn abandon_prefers_the_smallest_value_seen() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();
    ballot.bump(&fx.ctx(), val(b'Y'), true);

    // Another faction is on 'X', which sorts below 'Y'.
    ballot.process_envelope(
        &fx.prepare_envelope(node(3), Ballot::new(1, val(b'X')), None, None, 0, 0),
        &fx.ctx(),
    );
    ballot.process_envelope(
        &fx.prepare_envelope(node(4), Ballot::new(1, val(b'X')), None, None, 0, 0),
        &fx.ctx(),
    );

    assert!(ballot.abandon_ballot(0, &fx.ctx()));
    let current = ballot.current_ballot().unwrap();
    assert_eq!(current.counter, 2);
    assert_eq!(current.value, val(b'X'));
}

#[test]
fn newer_statement_ordering() {
    let fx = Fixture::new();
    let b1 = Ballot::new(1, val(b'V'));
    let b2 = Ballot::new(2, val(b'V'));

    let prep_low = fx.prepare_envelope(node(2), b1.clone(), None, None, 0, 0);
    let prep_high = fx.prepare_envelope(node(2), b2.clone(), None, None, 0, 0);
    let prep_with_p = fx.prepare_envelope(node(2), b2.clone(), Some(b1.clone()), None, 0, 0);
    let conf = fx.confirm_envelope(node(2), b2.clone(), 2, 1, 2);

    // Higher ballot counter is newer.
    assert!(is_newer_statement_pair(
        &prep_low.statement,
        &prep_high.statement
    ));
    assert!(!is_newer_statement_pair(
        &prep_high.statement,
        &prep_low.statement
    ));

    // Same ballot, richer prepared field is newer.
    assert!(is_newer_statement_pair(
        &prep_high.statement,
        &prep_with_p.statement
    ));

    // Confirm beats any prepare; externalize beats confirm.
    assert!(is_newer_statement_pair(&prep_with_p.statement, &conf.statement));

    let mut ext = Envelope {
        statement: Statement {
            node_id: node(2),
            slot_index: 1,
            pledges: StatementPledges::Externalize(StatementExternalize {
                commit: b2.clone(),
                n_h: 2,
                commit_quorum_set_hash: hash_quorum_set(&fx.qset),
            }),
        },
        signature: Signature::default(),
    };
    fx.driver.sign_envelope(&mut ext);
    assert!(is_newer_statement_pair(&conf.statement, &ext.statement));
    // Nothing supersedes an externalize.
    assert!(!is_newer_statement_pair(&ext.statement, &conf.statement));
}

#[test]
fn statement_sanity_rejects_malformed_counters() {
    let fx = Fixture::new();
    let ballot = BallotProtocol::new();
    let ctx = fx.ctx();

    // Zero ballot counter from a remote node.
    let zero = fx.prepare_envelope(node(2), Ballot::new(0, val(b'V')), None, None, 0, 0);
    assert!(!ballot.is_statement_sane(&zero.statement, &ctx));

    // prepared_prime must be below and incompatible with prepared.
    let bad_prime = fx.prepare_envelope(
        node(2),
        Ballot::new(2, val(b'V')),
        Some(Ballot::new(1, val(b'V'))),
        Some(Ballot::new(1, val(b'V'))),
        0,
        0,
    );
    assert!(!ballot.is_statement_sane(&bad_prime.statement, &ctx));

    // n_h without a prepared ballot.
    let orphan_h = fx.prepare_envelope(node(2), Ballot::new(2, val(b'V')), None, None, 0, 2);
    assert!(!ballot.is_statement_sane(&orphan_h.statement, &ctx));

    // Confirm with an inverted commit interval.
    let bad_confirm = fx.confirm_envelope(node(2), Ballot::new(2, val(b'V')), 2, 2, 1);
    assert!(!ballot.is_statement_sane(&bad_confirm.statement, &ctx));

    // A well-formed statement passes.
    let ok = fx.prepare_envelope(node(2), Ballot::new(1, val(b'V')), None, None, 0, 0);
    assert!(ballot.is_statement_sane(&ok.statement, &ctx));

    // An unknown sender's quorum set cannot be resolved.
    let stranger = fx.prepare_envelope(node(9), Ballot::new(1, val(b'V')), None, None, 0, 0);
    assert!(!ballot.is_statement_sane(&stranger.statement, &ctx));
}

#[test]
fn set_state_from_envelope_restores_confirm() {
    let fx = Fixture::new();
    let mut ballot = BallotProtocol::new();

    let b2 = Ballot::new(2, val(b'V'));
    let saved = fx.confirm_envelope(node(1), b2.clone(), 2, 1, 2);
    assert!(ballot.set_state_from_envelope(&saved));

    assert_eq!(ballot.phase(), BallotPhase::Confirm);
    assert_eq!(ballot.current_ballot(), Some(&b2));
    assert_eq!(ballot.commit(), Some(&Ballot::new(1, val(b'V'))));
    assert_eq!(ballot.high_ballot(), Some(&b2));
    ballot.check_invariants().unwrap();
}

#[cfg(test)]
impl BallotProtocol {
    /// Test hook: pretend we are `level` deep in a re-entrant cascade.
    fn set_message_level_for_test(&mut self, level: u32) {
        self.message_level = level;
    }
}
