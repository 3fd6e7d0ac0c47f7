//! The agreement engine: slots keyed by index plus the local identity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use concord_wire::{Envelope, NodeId, QuorumSet, Value};

use crate::driver::Driver;
use crate::info::SlotInfo;
use crate::slot::Slot;
use crate::{EnvelopeState, SlotContext};

/// Top-level engine. Owns one [`Slot`] per decision index, creating them
/// lazily on first contact and dropping them on [`purge_slots`].
///
/// All methods take `&self`; slot state lives behind a mutex so the
/// engine can be shared with timer callbacks and the overlay.
///
/// [`purge_slots`]: Fba::purge_slots
pub struct Fba<D: Driver> {
    local_node_id: NodeId,
    local_quorum_set: QuorumSet,
    driver: Arc<D>,
    slots: Mutex<HashMap<u64, Slot>>,
}

impl<D: Driver> Fba<D> {
    /// Create an engine for the given local identity.
    pub fn new(local_node_id: NodeId, local_quorum_set: QuorumSet, driver: Arc<D>) -> Self {
        Self {
            local_node_id,
            local_quorum_set,
            driver,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The local node id.
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// The local quorum set.
    pub fn local_quorum_set(&self) -> &QuorumSet {
        &self.local_quorum_set
    }

    /// The driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    fn ctx(&self, slot_index: u64) -> SlotContext<'_, D> {
        SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver: &self.driver,
            slot_index,
        }
    }

    /// Feed one envelope from the network into its slot.
    pub fn receive_envelope(&self, envelope: &Envelope) -> EnvelopeState {
        let slot_index = envelope.statement.slot_index;
        let ctx = self.ctx(slot_index);
        let mut slots = self.slots.lock();
        let slot = slots.entry(slot_index).or_insert_with(|| {
            debug!(slot = slot_index, "creating slot");
            Slot::new(slot_index)
        });
        slot.process_envelope(envelope, &ctx)
    }

    /// Propose `value` for a slot. With `force` the current ballot is
    /// superseded; otherwise only a pristine slot adopts the value.
    pub fn bump_state(&self, slot_index: u64, value: Value, force: bool) -> bool {
        let ctx = self.ctx(slot_index);
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index));
        slot.bump_state(&ctx, value, force)
    }

    /// Bump a slot to an explicit ballot counter.
    pub fn bump_state_to(&self, slot_index: u64, value: Value, counter: u32) -> bool {
        let ctx = self.ctx(slot_index);
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index));
        slot.bump_state_to(&ctx, value, counter)
    }

    /// Abandon the current ballot of a slot: move to counter `n`, or
    /// increment when `n == 0`.
    pub fn abandon_ballot(&self, slot_index: u64, counter: u32) -> bool {
        let ctx = self.ctx(slot_index);
        let mut slots = self.slots.lock();
        match slots.get_mut(&slot_index) {
            Some(slot) => slot.abandon_ballot(counter, &ctx),
            None => false,
        }
    }

    /// Entry point for the host's ballot timer.
    pub fn ballot_timer_expired(&self, slot_index: u64) -> bool {
        debug!(slot = slot_index, "ballot timer expired");
        self.abandon_ballot(slot_index, 0)
    }

    /// The externalized value of a slot, if consensus was reached.
    pub fn get_externalized_value(&self, slot_index: u64) -> Option<Value> {
        self.slots
            .lock()
            .get(&slot_index)
            .and_then(|slot| slot.get_externalized_value().cloned())
    }

    /// Whether a slot has externalized.
    pub fn is_slot_externalized(&self, slot_index: u64) -> bool {
        self.slots
            .lock()
            .get(&slot_index)
            .map(|slot| slot.is_externalized())
            .unwrap_or(false)
    }

    /// The latest envelope this node constructed for a slot.
    pub fn get_last_envelope(&self, slot_index: u64) -> Option<Envelope> {
        self.slots
            .lock()
            .get(&slot_index)
            .and_then(|slot| slot.get_last_envelope().cloned())
    }

    /// Envelopes supporting a slot's externalized value.
    pub fn get_externalizing_state(&self, slot_index: u64) -> Vec<Envelope> {
        let ctx = self.ctx(slot_index);
        self.slots
            .lock()
            .get(&slot_index)
            .map(|slot| slot.get_externalizing_state(&ctx))
            .unwrap_or_default()
    }

    /// Restore a slot from a saved self-envelope (restart path).
    pub fn set_state_from_envelope(&self, envelope: &Envelope) -> bool {
        let slot_index = envelope.statement.slot_index;
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index));
        slot.set_state_from_envelope(envelope)
    }

    /// Drop all slots strictly below `max_slot_index`, cancelling their
    /// timers. `slot_to_keep` survives regardless (e.g. the last closed
    /// slot, kept for late joiners).
    pub fn purge_slots(&self, max_slot_index: u64, slot_to_keep: Option<u64>) {
        let mut slots = self.slots.lock();
        slots.retain(|index, _| {
            let keep = *index >= max_slot_index || slot_to_keep == Some(*index);
            if !keep {
                self.driver.stop_timer(*index);
            }
            keep
        });
    }

    /// Number of live slots.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Indices of live slots, ascending.
    pub fn active_slots(&self) -> Vec<u64> {
        let mut indices: Vec<u64> = self.slots.lock().keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Serializable snapshot of a slot.
    pub fn get_slot_info(&self, slot_index: u64) -> Option<SlotInfo> {
        self.slots.lock().get(&slot_index).map(|slot| slot.get_info())
    }
}
