//! Shared scaffolding for overlay integration tests: stub collaborators
//! and a small "application" bundle wiring them into a `PeerContext`.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use concord_common::Hash256;
use concord_overlay::{
    ConsensusGateway, HerderGateway, Message, OverlayConfig, OverlayGateway, Peer, PeerContext,
    PeerSet, Scheduler, Transaction, TxSet,
};
use concord_wire::{
    Ballot, Envelope, NodeId, QuorumSet, Signature, Statement, StatementPledges, StatementPrepare,
    Value,
};

pub struct StubHerder {
    pub tx_sets: Mutex<HashMap<Hash256, TxSet>>,
    pub received_tx_sets: Mutex<Vec<TxSet>>,
    pub transactions: Mutex<Vec<Transaction>>,
    pub accept_transactions: AtomicBool,
    pub missing_tx_sets: Mutex<Vec<Hash256>>,
}

impl StubHerder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tx_sets: Mutex::new(HashMap::new()),
            received_tx_sets: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            accept_transactions: AtomicBool::new(true),
            missing_tx_sets: Mutex::new(Vec::new()),
        })
    }
}

impl HerderGateway for StubHerder {
    fn fetch_tx_set(&self, id: &Hash256, _create_fetch: bool) -> Option<TxSet> {
        self.tx_sets.lock().get(id).cloned()
    }

    fn recv_tx_set(&self, set: TxSet) {
        self.received_tx_sets.lock().push(set);
    }

    fn recv_transaction(&self, tx: Transaction) -> bool {
        self.transactions.lock().push(tx);
        self.accept_transactions.load(Ordering::SeqCst)
    }

    fn doesnt_have_tx_set(&self, id: &Hash256, _peer: &Arc<Peer>) {
        self.missing_tx_sets.lock().push(*id);
    }
}

pub struct StubOverlay {
    pub registry: Arc<PeerSet>,
    pub quorum_sets: Mutex<HashMap<Hash256, QuorumSet>>,
    pub flooded: Mutex<Vec<(Hash256, u64)>>,
    pub missing_quorum_sets: Mutex<Vec<Hash256>>,
}

impl StubOverlay {
    pub fn new(registry: Arc<PeerSet>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            quorum_sets: Mutex::new(HashMap::new()),
            flooded: Mutex::new(Vec::new()),
            missing_quorum_sets: Mutex::new(Vec::new()),
        })
    }
}

impl OverlayGateway for StubOverlay {
    fn fetch_quorum_set(&self, id: &Hash256, _create_fetch: bool) -> Option<QuorumSet> {
        self.quorum_sets.lock().get(id).cloned()
    }

    fn recv_quorum_set(&self, qset: QuorumSet) {
        self.quorum_sets
            .lock()
            .insert(Hash256::hash(&concord_wire::WireEncode::to_bytes(&qset)), qset);
    }

    fn doesnt_have_quorum_set(&self, id: &Hash256, _peer: &Arc<Peer>) {
        self.missing_quorum_sets.lock().push(*id);
    }

    fn broadcast_message(&self, msg: Message, source: &Arc<Peer>) {
        self.registry.broadcast(&msg, Some(source));
    }

    fn recv_flooded_msg(&self, id: Hash256, _msg: Message, ledger_index: u64, _peer: &Arc<Peer>) {
        self.flooded.lock().push((id, ledger_index));
    }
}

pub struct StubConsensus {
    pub statements: Mutex<Vec<Envelope>>,
}

impl StubConsensus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            statements: Mutex::new(Vec::new()),
        })
    }
}

impl ConsensusGateway for StubConsensus {
    fn recv_statement(&self, envelope: Envelope) {
        self.statements.lock().push(envelope);
    }
}

/// One test node: stub collaborators wired into a `PeerContext`.
pub struct TestApp {
    pub ctx: Arc<PeerContext>,
    pub herder: Arc<StubHerder>,
    pub overlay: Arc<StubOverlay>,
    pub consensus: Arc<StubConsensus>,
    pub registry: Arc<PeerSet>,
}

pub fn test_app_with_config(config: OverlayConfig, max_peers: usize) -> TestApp {
    let registry = PeerSet::new(max_peers);
    let herder = StubHerder::new();
    let overlay = StubOverlay::new(registry.clone());
    let consensus = StubConsensus::new();
    let ctx = Arc::new(PeerContext {
        config,
        scheduler: Scheduler::new(),
        herder: herder.clone(),
        overlay: overlay.clone(),
        consensus: consensus.clone(),
        registry: registry.clone(),
    });
    TestApp {
        ctx,
        herder,
        overlay,
        consensus,
        registry,
    }
}

pub fn test_app() -> TestApp {
    test_app_with_config(OverlayConfig::default(), 8)
}

/// Let posted events and loopback deliveries run. Under paused time this
/// drains every ready task before nudging the clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// A well-formed consensus envelope for flood tests.
pub fn test_envelope(slot: u64, seed: u8) -> Envelope {
    let mut node = [0u8; 32];
    node[0] = seed;
    Envelope {
        statement: Statement {
            node_id: NodeId(node),
            slot_index: slot,
            pledges: StatementPledges::Prepare(StatementPrepare {
                quorum_set_hash: Hash256::hash(b"qset"),
                ballot: Ballot::new(1, Value(vec![seed])),
                prepared: None,
                prepared_prime: None,
                n_c: 0,
                n_h: 0,
            }),
        },
        signature: Signature(vec![seed; 8]),
    }
}
