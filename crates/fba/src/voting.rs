//! Federated voting: the accept and ratify predicates.
//!
//! Both predicates run over the latest statement per node (`M` in the
//! per-slot state) and a pair of statement predicates supplied by the
//! caller:
//!
//! - **accept** holds when a v-blocking set already accepted the property
//!   (they can veto any quorum, so resisting them is pointless), or a
//!   quorum including the local node at least voted for it.
//! - **ratify** holds only on a full quorum vote; it is what makes a
//!   property irreversible.
//!
//! Duplicate envelopes cannot change the outcome — `M` holds one
//! statement per node — which is what absorbs replayed messages.

use std::collections::{HashMap, HashSet};

use concord_wire::{Envelope, NodeId, QuorumSet, Statement};

use crate::quorum::{is_blocking_set, is_quorum};

/// Federated accept over the latest statements.
///
/// Returns true iff a v-blocking set of nodes satisfies `accepted`, or a
/// quorum (evaluated against `local_quorum_set`, with per-node slices from
/// `get_quorum_set`) satisfies `voted` or `accepted`.
pub fn federated_accept<V, A, Q>(
    voted: V,
    accepted: A,
    envelopes: &HashMap<NodeId, Envelope>,
    local_quorum_set: &QuorumSet,
    get_quorum_set: Q,
) -> bool
where
    V: Fn(&Statement) -> bool,
    A: Fn(&Statement) -> bool,
    Q: Fn(&NodeId) -> Option<QuorumSet>,
{
    let mut accepted_nodes = HashSet::new();
    let mut supporters = HashSet::new();

    for (node_id, envelope) in envelopes {
        let statement = &envelope.statement;
        if accepted(statement) {
            accepted_nodes.insert(*node_id);
            supporters.insert(*node_id);
        } else if voted(statement) {
            supporters.insert(*node_id);
        }
    }

    if is_blocking_set(local_quorum_set, &accepted_nodes) {
        return true;
    }

    is_quorum(local_quorum_set, &supporters, get_quorum_set)
}

/// Federated ratify over the latest statements: quorum vote only.
pub fn federated_ratify<V, Q>(
    voted: V,
    envelopes: &HashMap<NodeId, Envelope>,
    local_quorum_set: &QuorumSet,
    get_quorum_set: Q,
) -> bool
where
    V: Fn(&Statement) -> bool,
    Q: Fn(&NodeId) -> Option<QuorumSet>,
{
    let mut supporters = HashSet::new();
    for (node_id, envelope) in envelopes {
        if voted(&envelope.statement) {
            supporters.insert(*node_id);
        }
    }

    is_quorum(local_quorum_set, &supporters, get_quorum_set)
}
