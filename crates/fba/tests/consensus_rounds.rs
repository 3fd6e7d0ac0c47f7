//! Multi-node consensus simulations.
//!
//! Several engines are wired together through a lock-step message pump
//! that delivers every emitted envelope to every other node until the
//! network goes quiet. The scenarios mirror how a small deployment
//! actually behaves: unanimous agreement, a split vote resolved by timer
//! bumps, and duplicate delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use concord_fba::quorum::simple_quorum_set;
use concord_fba::{Driver, Envelope, EnvelopeState, Fba, NodeId, QuorumSet, Signature, Value};

const SLOT: u64 = 1;

struct SimDriver {
    quorum_sets: Mutex<HashMap<NodeId, QuorumSet>>,
    outbox: Mutex<Vec<Envelope>>,
    all_emitted: Mutex<Vec<Envelope>>,
    timers_armed: Mutex<Vec<(u64, Duration)>>,
}

impl SimDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            quorum_sets: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Vec::new()),
            all_emitted: Mutex::new(Vec::new()),
            timers_armed: Mutex::new(Vec::new()),
        })
    }

    fn register(&self, node_id: NodeId, qset: QuorumSet) {
        self.quorum_sets.lock().insert(node_id, qset);
    }

    fn take_outbox(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.outbox.lock())
    }

    fn emitted_externalize_count(&self) -> usize {
        self.all_emitted
            .lock()
            .iter()
            .filter(|env| {
                matches!(
                    env.statement.pledges,
                    concord_fba::StatementPledges::Externalize(_)
                )
            })
            .count()
    }

    fn emitted_log(&self) -> Vec<Envelope> {
        self.all_emitted.lock().clone()
    }
}

impl Driver for SimDriver {
    fn sign_envelope(&self, envelope: &mut Envelope) {
        envelope.signature = Signature(vec![0xAB]);
    }

    fn verify_envelope(&self, envelope: &Envelope) -> bool {
        envelope.signature == Signature(vec![0xAB])
    }

    fn get_quorum_set(&self, node_id: &NodeId) -> Option<QuorumSet> {
        self.quorum_sets.lock().get(node_id).cloned()
    }

    fn emit_envelope(&self, envelope: &Envelope) {
        self.outbox.lock().push(envelope.clone());
        self.all_emitted.lock().push(envelope.clone());
    }

    fn value_externalized(&self, _slot_index: u64, _value: &Value) {}

    fn setup_timer(&self, slot_index: u64, timeout: Duration) {
        self.timers_armed.lock().push((slot_index, timeout));
    }

    fn stop_timer(&self, _slot_index: u64) {}
}

fn node(seed: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    NodeId(bytes)
}

fn val(byte: u8) -> Value {
    Value(vec![byte])
}

/// Build `n` engines sharing a symmetric `threshold`-of-`n` quorum set.
fn build_network(n: u8, threshold: u32) -> Vec<Arc<Fba<SimDriver>>> {
    let all: Vec<NodeId> = (1..=n).map(node).collect();
    let qset = simple_quorum_set(threshold, all.clone());

    (1..=n)
        .map(|seed| {
            let driver = SimDriver::new();
            for other in &all {
                driver.register(*other, qset.clone());
            }
            Arc::new(Fba::new(node(seed), qset.clone(), driver))
        })
        .collect()
}

/// Deliver every emitted envelope to every other node, `copies` times,
/// until the network is quiet.
fn pump(nodes: &[Arc<Fba<SimDriver>>], copies: usize) {
    loop {
        let mut delivered_any = false;
        for sender in nodes {
            for envelope in sender.driver().take_outbox() {
                delivered_any = true;
                for receiver in nodes {
                    if receiver.local_node_id() == &envelope.statement.node_id {
                        continue;
                    }
                    for _ in 0..copies {
                        let state = receiver.receive_envelope(&envelope);
                        assert_ne!(
                            state,
                            EnvelopeState::Invalid,
                            "honest envelope rejected by {}",
                            receiver.local_node_id()
                        );
                    }
                }
            }
        }
        if !delivered_any {
            break;
        }
    }
}

#[test]
fn four_honest_nodes_externalize_unanimously() {
    let nodes = build_network(4, 3);
    let v = val(b'V');

    for engine in &nodes {
        assert!(engine.bump_state(SLOT, v.clone(), true));
    }
    pump(&nodes, 1);

    for engine in &nodes {
        assert!(engine.is_slot_externalized(SLOT));
        assert_eq!(engine.get_externalized_value(SLOT), Some(v.clone()));

        let info = engine.get_slot_info(SLOT).unwrap();
        assert_eq!(info.ballot.phase, "Externalize");
        let commit = info.ballot.commit.expect("commit bounds after externalize");
        assert_eq!(commit.low, 1);
        assert_eq!(commit.high, 1);
        assert_eq!(info.ballot.high, 1);

        // Exactly one EXTERNALIZE envelope went out per node.
        assert_eq!(engine.driver().emitted_externalize_count(), 1);
    }
}

#[test]
fn split_vote_is_resolved_by_timer_bump() {
    let nodes = build_network(4, 3);
    let x = val(b'X');
    let y = val(b'Y');

    // Two factions at counter 1.
    assert!(nodes[0].bump_state(SLOT, x.clone(), true));
    assert!(nodes[1].bump_state(SLOT, x.clone(), true));
    assert!(nodes[2].bump_state(SLOT, y.clone(), true));
    assert!(nodes[3].bump_state(SLOT, y.clone(), true));
    pump(&nodes, 1);

    // 2-2 under a 3-of-4 threshold: nobody can have decided.
    for engine in &nodes {
        assert!(!engine.is_slot_externalized(SLOT));
    }

    // Every node's ballot timer fires; each abandons counter 1 and takes
    // the lexicographically smaller value seen on the network.
    for engine in &nodes {
        engine.ballot_timer_expired(SLOT);
    }
    pump(&nodes, 1);

    for engine in &nodes {
        assert!(engine.is_slot_externalized(SLOT));
        assert_eq!(engine.get_externalized_value(SLOT), Some(x.clone()));
        let info = engine.get_slot_info(SLOT).unwrap();
        assert_eq!(info.ballot.ballot_counter, 2);
    }
}

#[test]
fn duplicate_delivery_changes_nothing() {
    let reference = build_network(4, 3);
    let duplicated = build_network(4, 3);
    let v = val(b'V');

    for engine in reference.iter().chain(duplicated.iter()) {
        assert!(engine.bump_state(SLOT, v.clone(), true));
    }
    pump(&reference, 1);
    pump(&duplicated, 2);

    for (a, b) in reference.iter().zip(duplicated.iter()) {
        assert_eq!(
            a.get_externalized_value(SLOT),
            b.get_externalized_value(SLOT)
        );
        assert_eq!(a.get_last_envelope(SLOT), b.get_last_envelope(SLOT));
        // The duplicate deliveries caused no extra emissions.
        assert_eq!(a.driver().emitted_log(), b.driver().emitted_log());
    }
}

#[test]
fn timers_follow_ballot_adoption() {
    let nodes = build_network(4, 3);
    let engine = &nodes[0];

    assert!(engine.bump_state(SLOT, val(b'V'), true));
    let armed = engine.driver().timers_armed.lock().clone();
    assert!(!armed.is_empty());
    assert_eq!(armed[0].0, SLOT);

    // Timeouts escalate with the counter.
    engine.ballot_timer_expired(SLOT);
    let armed = engine.driver().timers_armed.lock().clone();
    assert!(armed.len() >= 2);
    assert!(armed[armed.len() - 1].1 >= armed[0].1);
}

#[test]
fn bad_signatures_never_reach_ballot_state() {
    let nodes = build_network(4, 3);
    let honest = &nodes[0];
    let observer = &nodes[1];

    assert!(honest.bump_state(SLOT, val(b'V'), true));
    let mut envelope = honest.driver().take_outbox().pop().unwrap();
    envelope.signature = Signature(vec![0xFF]);

    assert_eq!(
        observer.receive_envelope(&envelope),
        EnvelopeState::Invalid
    );
    // The slot was created but holds no foreign statement.
    assert_eq!(observer.get_slot_info(SLOT).unwrap().ballot.node_count, 0);
}

#[test]
fn purge_drops_decided_slots() {
    let nodes = build_network(4, 3);
    let v = val(b'V');
    for engine in &nodes {
        engine.bump_state(SLOT, v.clone(), true);
        engine.bump_state(SLOT + 1, v.clone(), true);
    }
    pump(&nodes, 1);

    let engine = &nodes[0];
    assert_eq!(engine.slot_count(), 2);
    engine.purge_slots(SLOT + 1, None);
    assert_eq!(engine.active_slots(), vec![SLOT + 1]);
    assert!(engine.get_externalized_value(SLOT).is_none());
}
