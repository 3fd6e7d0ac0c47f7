//! Quorum set predicates.
//!
//! A quorum *slice* is one node's trust declaration: a threshold over
//! validators and nested inner sets. A *quorum* is a set of nodes that
//! contains a slice of each of its members. A *v-blocking* set intersects
//! every slice of a node, so its members can jointly veto — or force —
//! that node's decisions.
//!
//! These predicates are pure; quorum-set lookup is a closure so callers
//! can answer from whatever statement or cache context they have.

use std::collections::HashSet;

use concord_common::Hash256;
use concord_wire::{NodeId, QuorumSet, WireEncode};

use crate::error::FbaError;

/// Maximum allowed nesting level for quorum sets.
pub const MAXIMUM_QUORUM_NESTING_LEVEL: u32 = 4;

/// Maximum allowed number of validator entries in a quorum set.
pub const MAXIMUM_QUORUM_NODES: usize = 1000;

/// Check if a set of nodes satisfies a quorum slice.
///
/// A slice is satisfied when at least `threshold` of its members
/// (validators plus inner sets) are satisfied.
pub fn is_quorum_slice(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let threshold = quorum_set.threshold as usize;
    if threshold == 0 {
        return true;
    }

    let mut count = 0;

    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }

    for inner_set in &quorum_set.inner_sets {
        if is_quorum_slice(inner_set, nodes) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }

    count >= threshold
}

/// Check if a set of nodes contains a quorum satisfying the local slice.
///
/// Iteratively prunes nodes whose own slices are not satisfied by the
/// remaining set until the set stabilizes, then checks the local node's
/// slice against the survivors. This finds quorums that are subsets of
/// the input rather than requiring the whole input to qualify.
pub fn is_quorum<F>(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>, get_quorum_set: F) -> bool
where
    F: Fn(&NodeId) -> Option<QuorumSet>,
{
    let mut remaining: Vec<NodeId> = nodes.iter().copied().collect();

    loop {
        let count = remaining.len();
        let remaining_set: HashSet<NodeId> = remaining.iter().copied().collect();
        remaining.retain(|node_id| {
            if let Some(qs) = get_quorum_set(node_id) {
                is_quorum_slice(&qs, &remaining_set)
            } else {
                false
            }
        });
        if remaining.len() == count {
            break;
        }
    }

    let remaining_set: HashSet<NodeId> = remaining.into_iter().collect();
    is_quorum_slice(quorum_set, &remaining_set)
}

/// Check if a set of nodes blocks every slice of `quorum_set`.
///
/// A blocking set leaves fewer than `threshold` unblocked members, so no
/// slice of the set's owner can be satisfied without it.
pub fn is_blocking_set(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let total = quorum_set.validators.len() + quorum_set.inner_sets.len();
    let threshold = quorum_set.threshold as usize;

    // The empty slice cannot be blocked.
    if threshold == 0 {
        return false;
    }

    let blocking_threshold = total.saturating_sub(threshold) + 1;

    let mut count = 0;
    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            count += 1;
        }
    }
    for inner_set in &quorum_set.inner_sets {
        if is_blocking_set(inner_set, nodes) {
            count += 1;
        }
    }

    count >= blocking_threshold
}

/// Alias of [`is_blocking_set`]: a set is v-blocking for a node when it
/// intersects all of the node's slices.
pub fn is_v_blocking(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    is_blocking_set(quorum_set, nodes)
}

/// Validate the structure of a quorum set.
///
/// Checks thresholds, nesting depth, duplicates, and total size. With
/// `extra_checks` the threshold must also be a strict majority.
pub fn is_quorum_set_sane(quorum_set: &QuorumSet, extra_checks: bool) -> Result<(), FbaError> {
    let mut checker = SanityChecker {
        extra_checks,
        known_nodes: HashSet::new(),
        count: 0,
    };
    checker.check(quorum_set, 0)?;

    if checker.count < 1 || checker.count > MAXIMUM_QUORUM_NODES {
        return Err(FbaError::InvalidQuorumSet(format!(
            "total node count {} outside 1..={}",
            checker.count, MAXIMUM_QUORUM_NODES
        )));
    }

    Ok(())
}

struct SanityChecker {
    extra_checks: bool,
    known_nodes: HashSet<NodeId>,
    count: usize,
}

impl SanityChecker {
    fn check(&mut self, quorum_set: &QuorumSet, depth: u32) -> Result<(), FbaError> {
        if depth > MAXIMUM_QUORUM_NESTING_LEVEL {
            return Err(FbaError::InvalidQuorumSet(
                "maximum nesting level exceeded".to_string(),
            ));
        }

        if quorum_set.threshold < 1 {
            return Err(FbaError::InvalidQuorumSet(
                "threshold must be greater than 0".to_string(),
            ));
        }

        let total = quorum_set.validators.len() + quorum_set.inner_sets.len();
        if quorum_set.threshold as usize > total {
            return Err(FbaError::InvalidQuorumSet(
                "threshold exceeds member count".to_string(),
            ));
        }

        let v_blocking_size = total.saturating_sub(quorum_set.threshold as usize) + 1;
        if self.extra_checks && (quorum_set.threshold as usize) < v_blocking_size {
            return Err(FbaError::InvalidQuorumSet(
                "threshold below v-blocking size (< 51%)".to_string(),
            ));
        }

        self.count = self.count.saturating_add(quorum_set.validators.len());
        for node in &quorum_set.validators {
            if !self.known_nodes.insert(*node) {
                return Err(FbaError::InvalidQuorumSet(
                    "duplicate node in quorum set".to_string(),
                ));
            }
        }

        for inner in &quorum_set.inner_sets {
            self.check(inner, depth + 1)?;
        }

        Ok(())
    }
}

/// Hash a quorum set over its canonical encoding.
pub fn hash_quorum_set(quorum_set: &QuorumSet) -> Hash256 {
    Hash256::hash(&quorum_set.to_bytes())
}

/// Build a flat quorum set: `threshold` over `validators`.
pub fn simple_quorum_set(threshold: u32, validators: Vec<NodeId>) -> QuorumSet {
    QuorumSet {
        threshold,
        validators,
        inner_sets: Vec::new(),
    }
}

/// The quorum set implied by an EXTERNALIZE statement: the sender alone.
/// A node that externalized no longer needs agreement from anyone.
pub fn singleton_quorum_set(node_id: NodeId) -> QuorumSet {
    simple_quorum_set(1, vec![node_id])
}
