//! Serializable snapshots of consensus state for monitoring and tests.

use serde::Serialize;

use concord_wire::{Ballot, Value};

/// Render a value as short hex for human consumption.
pub fn value_to_str(value: &Value) -> String {
    let head = &value.0[..value.0.len().min(8)];
    format!("{}[{}]", hex::encode(head), value.0.len())
}

/// A ballot rendered for serialization.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BallotSummary {
    /// Ballot counter.
    pub counter: u32,
    /// Short rendering of the ballot value.
    pub value: String,
}

impl BallotSummary {
    pub(crate) fn from_ballot(ballot: &Ballot) -> Self {
        Self {
            counter: ballot.counter,
            value: value_to_str(&ballot.value),
        }
    }
}

/// The commit interval `[low, high]`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommitBounds {
    /// Low end of the interval.
    pub low: u32,
    /// High end of the interval.
    pub high: u32,
}

/// Snapshot of one slot's ballot state.
#[derive(Debug, Clone, Serialize)]
pub struct BallotInfo {
    /// Phase name.
    pub phase: String,
    /// Current ballot counter, 0 before any ballot.
    pub ballot_counter: u32,
    /// Current ballot value, if any.
    pub ballot_value: Option<String>,
    /// Accepted-prepared ballot.
    pub prepared: Option<BallotSummary>,
    /// Runner-up incompatible prepared ballot.
    pub prepared_prime: Option<BallotSummary>,
    /// Commit interval, if one is accepted.
    pub commit: Option<CommitBounds>,
    /// Counter of the high ballot, 0 if none.
    pub high: u32,
    /// How many nodes we hold statements from.
    pub node_count: usize,
    /// Whether a quorum is at the current ballot.
    pub heard_from_quorum: bool,
}

/// Snapshot of a slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    /// The slot index.
    pub slot_index: u64,
    /// Ballot protocol state.
    pub ballot: BallotInfo,
    /// The decided value, once externalized.
    pub externalized_value: Option<String>,
}
