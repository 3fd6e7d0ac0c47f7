//! In-process loopback transport with fault injection.
//!
//! A loopback pair gives two sessions the exact peer contract — ordered
//! delivery, handshake, disconnect semantics — over a per-pair FIFO
//! queue instead of a socket, with knobs to duplicate, reorder, damage,
//! and drop messages. Each knob is an independent Bernoulli draw from a
//! seeded generator, so failure scenarios replay exactly.
//!
//! Effects apply at dequeue time, in this order:
//!
//! 1. **duplicate** — push a byte-wise copy back onto the queue front
//! 2. **reorder** — move the message to the queue back, delivering nothing
//! 3. **damage** — flip at least one bit
//! 4. **drop** — discard
//!
//! Otherwise the message is posted to the remote session's scheduler.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::distributions::{Bernoulli, Distribution};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{trace, warn};

use crate::peer::{Peer, PeerContext, PeerRole};
use crate::scheduler::Scheduler;
use crate::{OverlayError, Result};

/// Default RNG seed; override with [`LoopbackTransport::set_seed`] to
/// explore different fault interleavings.
const DEFAULT_SEED: u64 = 0x5EED;

/// Delivery statistics for one direction of a loopback pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopbackStats {
    /// Messages handed to `send`.
    pub messages_sent: u64,
    /// Messages posted to the remote session.
    pub messages_delivered: u64,
    /// Bytes posted to the remote session.
    pub bytes_delivered: u64,
    /// Messages copied back onto the queue front.
    pub messages_duplicated: u64,
    /// Messages moved to the queue back instead of delivered.
    pub messages_reordered: u64,
    /// Messages delivered with at least one bit flipped.
    pub messages_damaged: u64,
    /// Messages discarded.
    pub messages_dropped: u64,
}

/// One independent Bernoulli knob. `None` means the effect never fires,
/// which keeps the no-fault path free of sampling.
#[derive(Clone, Copy)]
struct FaultKnob {
    p: f64,
    dist: Option<Bernoulli>,
}

impl FaultKnob {
    fn off() -> Self {
        Self { p: 0.0, dist: None }
    }

    fn set(&mut self, p: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&p) {
            return Err(OverlayError::InvalidArgument(format!(
                "probability {} outside [0.0, 1.0]",
                p
            )));
        }
        self.dist = if p == 0.0 {
            None
        } else {
            Some(Bernoulli::new(p).map_err(|_| {
                OverlayError::InvalidArgument(format!("probability {} not representable", p))
            })?)
        };
        self.p = p;
        Ok(())
    }

    fn sample(&self, rng: &mut StdRng) -> bool {
        match &self.dist {
            Some(dist) => dist.sample(rng),
            None => false,
        }
    }
}

struct LoopbackInner {
    queue: VecDeque<Vec<u8>>,
    rng: StdRng,
    duplicate: FaultKnob,
    reorder: FaultKnob,
    damage: FaultKnob,
    drop: FaultKnob,
    corked: bool,
    max_queue_depth: usize,
    stats: LoopbackStats,
}

/// The sending half of one loopback direction: a queue feeding the
/// remote session through the fault knobs.
pub struct LoopbackTransport {
    scheduler: Scheduler,
    remote: Mutex<Option<Weak<Peer>>>,
    inner: Mutex<LoopbackInner>,
}

impl LoopbackTransport {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            remote: Mutex::new(None),
            inner: Mutex::new(LoopbackInner {
                queue: VecDeque::new(),
                rng: StdRng::seed_from_u64(DEFAULT_SEED),
                duplicate: FaultKnob::off(),
                reorder: FaultKnob::off(),
                damage: FaultKnob::off(),
                drop: FaultKnob::off(),
                corked: false,
                max_queue_depth: 0,
                stats: LoopbackStats::default(),
            }),
        }
    }

    pub(crate) fn set_remote(&self, remote: Weak<Peer>) {
        *self.remote.lock() = Some(remote);
    }

    pub(crate) fn clear_remote(&self) {
        *self.remote.lock() = None;
    }

    /// Queue an encoded message; drains whatever exceeds the configured
    /// queue depth (default 0: immediate delivery).
    pub(crate) fn enqueue(&self, bytes: Vec<u8>) {
        {
            let mut inner = self.inner.lock();
            inner.stats.messages_sent += 1;
            inner.queue.push_back(bytes);
        }
        self.flush_over_depth();
    }

    /// Break the pair link on disconnect. The remote side is torn down
    /// from a posted event, never synchronously.
    pub(crate) fn sever(&self, scheduler: &Scheduler) {
        let remote = self.remote.lock().take();
        self.inner.lock().queue.clear();
        if let Some(weak) = remote {
            if let Some(remote_peer) = weak.upgrade() {
                scheduler.post(move || {
                    if let Some(loopback) = remote_peer.loopback() {
                        loopback.clear_remote();
                    }
                    remote_peer.disconnect();
                });
            }
        }
    }

    /// Re-seed the fault generator.
    pub fn set_seed(&self, seed: u64) {
        self.inner.lock().rng = StdRng::seed_from_u64(seed);
    }

    /// Dequeue one message, apply the fault knobs, and (unless the dice
    /// said otherwise) post it to the remote session. Returns false when
    /// corked or empty.
    pub fn deliver_one(&self) -> bool {
        let delivery = {
            let mut inner = self.inner.lock();
            if inner.corked {
                return false;
            }
            let Some(mut msg) = inner.queue.pop_front() else {
                return false;
            };

            let duplicate = inner.duplicate;
            if duplicate.sample(&mut inner.rng) {
                trace!("loopback duplicated message");
                let copy = msg.clone();
                inner.queue.push_front(copy);
                inner.stats.messages_duplicated += 1;
            }

            let reorder = inner.reorder;
            if reorder.sample(&mut inner.rng) {
                trace!("loopback reordered message");
                inner.queue.push_back(msg);
                inner.stats.messages_reordered += 1;
                return true;
            }

            let damage = inner.damage;
            if damage.sample(&mut inner.rng) {
                if damage_message(&mut inner.rng, &mut msg) {
                    trace!("loopback damaged message");
                    inner.stats.messages_damaged += 1;
                }
            }

            let drop = inner.drop;
            if drop.sample(&mut inner.rng) {
                trace!("loopback dropped message");
                inner.stats.messages_dropped += 1;
                return true;
            }

            inner.stats.messages_delivered += 1;
            inner.stats.bytes_delivered += msg.len() as u64;
            msg
        };

        let remote = self.remote.lock().as_ref().and_then(Weak::upgrade);
        match remote {
            Some(remote_peer) => {
                self.scheduler.post(move || {
                    remote_peer.recv_frame(&delivery);
                });
            }
            None => warn!("loopback delivery with no remote link"),
        }
        true
    }

    /// Drain the queue. A reorder re-draws later, so the drain is
    /// attempt-bounded to stay finite under extreme knob settings.
    pub fn deliver_all(&self) {
        let mut attempts = self.drain_attempt_budget();
        while attempts > 0 {
            {
                let inner = self.inner.lock();
                if inner.corked || inner.queue.is_empty() {
                    break;
                }
            }
            if !self.deliver_one() {
                break;
            }
            attempts -= 1;
        }
    }

    /// Discard everything queued.
    pub fn drop_all(&self) {
        self.inner.lock().queue.clear();
    }

    /// Messages waiting in the queue.
    pub fn queued_message_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Bytes waiting in the queue.
    pub fn queued_byte_count(&self) -> usize {
        self.inner.lock().queue.iter().map(Vec::len).sum()
    }

    /// Snapshot of the delivery statistics.
    pub fn stats(&self) -> LoopbackStats {
        self.inner.lock().stats
    }

    /// Whether delivery is currently halted.
    pub fn corked(&self) -> bool {
        self.inner.lock().corked
    }

    /// Halt or resume delivery. Uncorking does not flush by itself.
    pub fn set_corked(&self, corked: bool) {
        self.inner.lock().corked = corked;
    }

    /// Queue depth above which `send` drains the queue.
    pub fn max_queue_depth(&self) -> usize {
        self.inner.lock().max_queue_depth
    }

    /// Set the auto-drain threshold.
    pub fn set_max_queue_depth(&self, depth: usize) {
        self.inner.lock().max_queue_depth = depth;
    }

    /// Probability that a dequeued message is duplicated.
    pub fn duplicate_probability(&self) -> f64 {
        self.inner.lock().duplicate.p
    }

    /// Set the duplicate probability; must be within `[0.0, 1.0]`.
    pub fn set_duplicate_probability(&self, p: f64) -> Result<()> {
        self.inner.lock().duplicate.set(p)
    }

    /// Probability that a dequeued message is moved to the queue back.
    pub fn reorder_probability(&self) -> f64 {
        self.inner.lock().reorder.p
    }

    /// Set the reorder probability; must be within `[0.0, 1.0]`.
    pub fn set_reorder_probability(&self, p: f64) -> Result<()> {
        self.inner.lock().reorder.set(p)
    }

    /// Probability that a delivered message has bits flipped.
    pub fn damage_probability(&self) -> f64 {
        self.inner.lock().damage.p
    }

    /// Set the damage probability; must be within `[0.0, 1.0]`.
    pub fn set_damage_probability(&self, p: f64) -> Result<()> {
        self.inner.lock().damage.set(p)
    }

    /// Probability that a dequeued message is discarded.
    pub fn drop_probability(&self) -> f64 {
        self.inner.lock().drop.p
    }

    /// Set the drop probability; must be within `[0.0, 1.0]`.
    pub fn set_drop_probability(&self, p: f64) -> Result<()> {
        self.inner.lock().drop.set(p)
    }

    fn flush_over_depth(&self) {
        let mut attempts = self.drain_attempt_budget();
        while attempts > 0 {
            {
                let inner = self.inner.lock();
                if inner.corked || inner.queue.len() <= inner.max_queue_depth {
                    break;
                }
            }
            if !self.deliver_one() {
                break;
            }
            attempts -= 1;
        }
    }

    fn drain_attempt_budget(&self) -> usize {
        self.inner.lock().queue.len() * 8 + 8
    }
}

/// Flip bits in `msg`: the flip count is drawn uniformly from
/// `[0, len)` but clamped to at least one, and each flip lands in a
/// distinct byte so a triggered damage always corrupts the message.
fn damage_message(rng: &mut StdRng, msg: &mut [u8]) -> bool {
    if msg.is_empty() {
        return false;
    }
    let requested = rng.gen_range(0..msg.len());
    let flips = requested.clamp(1, msg.len());
    for idx in rand::seq::index::sample(rng, msg.len(), flips) {
        let bit: u32 = rng.gen_range(0..8);
        msg[idx] ^= 1 << bit;
    }
    true
}

/// A linked pair of loopback sessions: `initiator` dialed, `acceptor`
/// answered, both already "connected" and registered. The handshake
/// proceeds through posted events exactly as it would over TCP.
pub struct LoopbackConnection {
    initiator: Arc<Peer>,
    acceptor: Arc<Peer>,
}

impl LoopbackConnection {
    /// Wire two applications together. Each side gets its own context so
    /// tests can give them different registries and collaborators.
    pub fn new(initiator_ctx: Arc<PeerContext>, acceptor_ctx: Arc<PeerContext>) -> Self {
        let initiator = Peer::new_loopback(initiator_ctx.clone(), PeerRole::Initiator);
        let acceptor = Peer::new_loopback(acceptor_ctx.clone(), PeerRole::Acceptor);

        if let (Some(a), Some(b)) = (initiator.loopback(), acceptor.loopback()) {
            a.set_remote(Arc::downgrade(&acceptor));
            b.set_remote(Arc::downgrade(&initiator));
        }

        initiator_ctx.registry.add_peer(initiator.clone());
        acceptor_ctx.registry.add_peer(acceptor.clone());

        // The pair is fully wired: the initiator's "connect" succeeds at
        // the next tick and greets first.
        let init = initiator.clone();
        initiator_ctx.scheduler.post(move || init.connected());

        Self {
            initiator,
            acceptor,
        }
    }

    /// The dialing side.
    pub fn initiator(&self) -> &Arc<Peer> {
        &self.initiator
    }

    /// The answering side.
    pub fn acceptor(&self) -> &Arc<Peer> {
        &self.acceptor
    }

    /// Tear the pair down. Dropping one side severs the other through
    /// posted events.
    pub fn close(&self) {
        self.initiator.disconnect();
    }
}
