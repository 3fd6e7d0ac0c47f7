//! Consensus wire types: ballots, statements, envelopes, quorum sets.

use std::fmt;

use concord_common::Hash256;

use crate::codec::{get_bytes, put_bytes, Reader, WireDecode, WireEncode};
use crate::error::WireError;

/// Maximum nesting allowed while decoding quorum sets. Deeper structures
/// are rejected before validation ever sees them.
pub const MAX_QUORUM_SET_DECODE_DEPTH: u32 = 8;

/// A node identifier (public key bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Create from raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form for log lines.
    pub fn to_short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_short_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_short_hex())
    }
}

impl WireEncode for NodeId {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for NodeId {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self(r.read_array32()?))
    }
}

/// An opaque consensus value. Ordering is lexicographic over the bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Value(pub Vec<u8>);

impl Value {
    /// Empty value.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// True when the value carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.0[..self.0.len().min(4)];
        write!(f, "Value({}/{}B)", hex::encode(head), self.0.len())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl WireEncode for Value {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.0);
    }
}

impl WireDecode for Value {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self(get_bytes(r)?))
    }
}

/// An envelope signature. Verification lives behind the driver; the wire
/// layer only carries the bytes.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(pub Vec<u8>);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.0[..self.0.len().min(4)];
        write!(f, "Signature({}/{}B)", hex::encode(head), self.0.len())
    }
}

impl WireEncode for Signature {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.0);
    }
}

impl WireDecode for Signature {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self(get_bytes(r)?))
    }
}

/// A ballot: a counter paired with a candidate value.
///
/// Ballots order lexicographically by `(counter, value)` — the derived
/// `Ord` relies on the field order here. Two ballots are *compatible* when
/// their values are equal, regardless of counter.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot {
    /// Attempt counter within a slot; bumped on timeout.
    pub counter: u32,
    /// The value this ballot proposes.
    pub value: Value,
}

impl Ballot {
    /// Make a ballot from parts.
    pub fn new(counter: u32, value: Value) -> Self {
        Self { counter, value }
    }

    /// Two ballots are compatible iff they carry the same value.
    pub fn compatible(&self, other: &Ballot) -> bool {
        self.value == other.value
    }
}

impl fmt::Debug for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.counter, self.value)
    }
}

impl WireEncode for Ballot {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.counter.encode(buf);
        self.value.encode(buf);
    }
}

impl WireDecode for Ballot {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            counter: u32::decode(r)?,
            value: Value::decode(r)?,
        })
    }
}

impl WireEncode for Hash256 {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for Hash256 {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Hash256(r.read_array32()?))
    }
}

/// A quorum set: threshold over validators and nested inner sets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QuorumSet {
    /// How many members (validators + inner sets) must be satisfied.
    pub threshold: u32,
    /// Direct validator members.
    pub validators: Vec<NodeId>,
    /// Nested quorum sets.
    pub inner_sets: Vec<QuorumSet>,
}

impl QuorumSet {
    fn decode_at_depth(r: &mut Reader<'_>, depth: u32) -> Result<Self, WireError> {
        if depth > MAX_QUORUM_SET_DECODE_DEPTH {
            return Err(WireError::NestingTooDeep(MAX_QUORUM_SET_DECODE_DEPTH));
        }
        let threshold = u32::decode(r)?;
        let validators = Vec::<NodeId>::decode(r)?;
        let inner_count = r.read_len(4)?;
        let mut inner_sets = Vec::with_capacity(inner_count);
        for _ in 0..inner_count {
            inner_sets.push(Self::decode_at_depth(r, depth + 1)?);
        }
        Ok(Self {
            threshold,
            validators,
            inner_sets,
        })
    }
}

impl WireEncode for QuorumSet {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.threshold.encode(buf);
        self.validators.encode(buf);
        (self.inner_sets.len() as u32).encode(buf);
        for inner in &self.inner_sets {
            inner.encode(buf);
        }
    }
}

impl WireDecode for QuorumSet {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Self::decode_at_depth(r, 0)
    }
}

/// PREPARE pledges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatementPrepare {
    /// Hash of the sender's quorum set.
    pub quorum_set_hash: Hash256,
    /// Current ballot (`b`).
    pub ballot: Ballot,
    /// Highest accepted-prepared ballot (`p`).
    pub prepared: Option<Ballot>,
    /// Second-highest accepted-prepared, incompatible with `p` (`p'`).
    pub prepared_prime: Option<Ballot>,
    /// Lowest counter of the commit interval being voted (`c.n`), 0 if none.
    pub n_c: u32,
    /// Counter of the highest confirmed-prepared ballot (`h.n`), 0 if none.
    pub n_h: u32,
}

/// CONFIRM pledges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatementConfirm {
    /// Current ballot (`b`).
    pub ballot: Ballot,
    /// Counter of the highest accepted-prepared ballot.
    pub n_prepared: u32,
    /// Lowest counter of the accepted commit interval.
    pub n_commit: u32,
    /// Highest counter of the accepted commit interval.
    pub n_h: u32,
    /// Hash of the sender's quorum set.
    pub quorum_set_hash: Hash256,
}

/// EXTERNALIZE pledges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatementExternalize {
    /// The irrevocably committed ballot (`c`).
    pub commit: Ballot,
    /// Highest counter of the confirmed commit interval.
    pub n_h: u32,
    /// Hash of the quorum set in force when commit was confirmed.
    pub commit_quorum_set_hash: Hash256,
}

/// NOMINATE pledges. Carried for wire completeness; the ballot engine
/// treats nominations as out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatementNominate {
    /// Hash of the sender's quorum set.
    pub quorum_set_hash: Hash256,
    /// Values voted for.
    pub votes: Vec<Value>,
    /// Values accepted.
    pub accepted: Vec<Value>,
}

/// The pledge union of a statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatementPledges {
    /// Voting to prepare a ballot.
    Prepare(StatementPrepare),
    /// Confirming a prepared ballot and voting to commit.
    Confirm(StatementConfirm),
    /// Irreversible commitment.
    Externalize(StatementExternalize),
    /// Value nomination.
    Nominate(StatementNominate),
}

const PLEDGE_TAG_PREPARE: u32 = 0;
const PLEDGE_TAG_CONFIRM: u32 = 1;
const PLEDGE_TAG_EXTERNALIZE: u32 = 2;
const PLEDGE_TAG_NOMINATE: u32 = 3;

impl WireEncode for StatementPledges {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            StatementPledges::Prepare(prep) => {
                PLEDGE_TAG_PREPARE.encode(buf);
                prep.quorum_set_hash.encode(buf);
                prep.ballot.encode(buf);
                prep.prepared.encode(buf);
                prep.prepared_prime.encode(buf);
                prep.n_c.encode(buf);
                prep.n_h.encode(buf);
            }
            StatementPledges::Confirm(conf) => {
                PLEDGE_TAG_CONFIRM.encode(buf);
                conf.ballot.encode(buf);
                conf.n_prepared.encode(buf);
                conf.n_commit.encode(buf);
                conf.n_h.encode(buf);
                conf.quorum_set_hash.encode(buf);
            }
            StatementPledges::Externalize(ext) => {
                PLEDGE_TAG_EXTERNALIZE.encode(buf);
                ext.commit.encode(buf);
                ext.n_h.encode(buf);
                ext.commit_quorum_set_hash.encode(buf);
            }
            StatementPledges::Nominate(nom) => {
                PLEDGE_TAG_NOMINATE.encode(buf);
                nom.quorum_set_hash.encode(buf);
                nom.votes.encode(buf);
                nom.accepted.encode(buf);
            }
        }
    }
}

impl WireDecode for StatementPledges {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        match r.read_u32()? {
            PLEDGE_TAG_PREPARE => Ok(StatementPledges::Prepare(StatementPrepare {
                quorum_set_hash: Hash256::decode(r)?,
                ballot: Ballot::decode(r)?,
                prepared: Option::<Ballot>::decode(r)?,
                prepared_prime: Option::<Ballot>::decode(r)?,
                n_c: u32::decode(r)?,
                n_h: u32::decode(r)?,
            })),
            PLEDGE_TAG_CONFIRM => Ok(StatementPledges::Confirm(StatementConfirm {
                ballot: Ballot::decode(r)?,
                n_prepared: u32::decode(r)?,
                n_commit: u32::decode(r)?,
                n_h: u32::decode(r)?,
                quorum_set_hash: Hash256::decode(r)?,
            })),
            PLEDGE_TAG_EXTERNALIZE => Ok(StatementPledges::Externalize(StatementExternalize {
                commit: Ballot::decode(r)?,
                n_h: u32::decode(r)?,
                commit_quorum_set_hash: Hash256::decode(r)?,
            })),
            PLEDGE_TAG_NOMINATE => Ok(StatementPledges::Nominate(StatementNominate {
                quorum_set_hash: Hash256::decode(r)?,
                votes: Vec::<Value>::decode(r)?,
                accepted: Vec::<Value>::decode(r)?,
            })),
            tag => Err(WireError::UnknownTag {
                context: "statement pledges",
                tag,
            }),
        }
    }
}

/// A consensus statement: who said what about which slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    /// The asserting node.
    pub node_id: NodeId,
    /// The decision slot this statement is about.
    pub slot_index: u64,
    /// The pledges being made.
    pub pledges: StatementPledges,
}

impl Statement {
    /// The quorum-set hash a receiver must resolve to evaluate this
    /// statement. For EXTERNALIZE this is the commit quorum-set hash, not
    /// a statement-level hash; NOMINATE carries its own hash.
    pub fn companion_quorum_set_hash(&self) -> Hash256 {
        match &self.pledges {
            StatementPledges::Prepare(prep) => prep.quorum_set_hash,
            StatementPledges::Confirm(conf) => conf.quorum_set_hash,
            StatementPledges::Externalize(ext) => ext.commit_quorum_set_hash,
            StatementPledges::Nominate(nom) => nom.quorum_set_hash,
        }
    }
}

impl WireEncode for Statement {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.node_id.encode(buf);
        self.slot_index.encode(buf);
        self.pledges.encode(buf);
    }
}

impl WireDecode for Statement {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            node_id: NodeId::decode(r)?,
            slot_index: u64::decode(r)?,
            pledges: StatementPledges::decode(r)?,
        })
    }
}

/// A signed statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// The statement being transported.
    pub statement: Statement,
    /// Signature over the statement; checked by the driver.
    pub signature: Signature,
}

impl WireEncode for Envelope {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.statement.encode(buf);
        self.signature.encode(buf);
    }
}

impl WireDecode for Envelope {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            statement: Statement::decode(r)?,
            signature: Signature::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seed: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        NodeId(bytes)
    }

    #[test]
    fn ballot_ordering_is_counter_then_value() {
        let a = Ballot::new(1, Value(vec![9]));
        let b = Ballot::new(2, Value(vec![0]));
        let c = Ballot::new(2, Value(vec![1]));
        assert!(a < b);
        assert!(b < c);
        assert!(a.compatible(&Ballot::new(7, Value(vec![9]))));
        assert!(!a.compatible(&b));
    }

    #[test]
    fn prepare_round_trip_with_and_without_options() {
        let qset_hash = Hash256::hash(b"qset");
        let full = Envelope {
            statement: Statement {
                node_id: node(1),
                slot_index: 42,
                pledges: StatementPledges::Prepare(StatementPrepare {
                    quorum_set_hash: qset_hash,
                    ballot: Ballot::new(3, Value(vec![1, 2, 3])),
                    prepared: Some(Ballot::new(2, Value(vec![1, 2, 3]))),
                    prepared_prime: Some(Ballot::new(1, Value(vec![9]))),
                    n_c: 1,
                    n_h: 2,
                }),
            },
            signature: Signature(vec![0xAA; 64]),
        };
        assert_eq!(Envelope::from_bytes(&full.to_bytes()).unwrap(), full);

        let bare = Envelope {
            statement: Statement {
                node_id: node(2),
                slot_index: 1,
                pledges: StatementPledges::Prepare(StatementPrepare {
                    quorum_set_hash: qset_hash,
                    ballot: Ballot::new(1, Value(vec![5])),
                    prepared: None,
                    prepared_prime: None,
                    n_c: 0,
                    n_h: 0,
                }),
            },
            signature: Signature(vec![]),
        };
        assert_eq!(Envelope::from_bytes(&bare.to_bytes()).unwrap(), bare);
    }

    #[test]
    fn externalize_companion_hash_is_the_commit_hash() {
        let commit_hash = Hash256::hash(b"commit-qset");
        let st = Statement {
            node_id: node(3),
            slot_index: 9,
            pledges: StatementPledges::Externalize(StatementExternalize {
                commit: Ballot::new(4, Value(vec![7])),
                n_h: 4,
                commit_quorum_set_hash: commit_hash,
            }),
        };
        assert_eq!(st.companion_quorum_set_hash(), commit_hash);
    }

    #[test]
    fn quorum_set_round_trip_and_depth_cap() {
        let qs = QuorumSet {
            threshold: 2,
            validators: vec![node(1), node(2)],
            inner_sets: vec![QuorumSet {
                threshold: 1,
                validators: vec![node(3)],
                inner_sets: vec![],
            }],
        };
        assert_eq!(QuorumSet::from_bytes(&qs.to_bytes()).unwrap(), qs);

        // Build a chain deeper than the decoder allows.
        let mut deep = QuorumSet {
            threshold: 1,
            validators: vec![node(1)],
            inner_sets: vec![],
        };
        for _ in 0..(MAX_QUORUM_SET_DECODE_DEPTH + 1) {
            deep = QuorumSet {
                threshold: 1,
                validators: vec![],
                inner_sets: vec![deep],
            };
        }
        assert!(matches!(
            QuorumSet::from_bytes(&deep.to_bytes()),
            Err(WireError::NestingTooDeep(_))
        ));
    }

    #[test]
    fn truncated_envelope_fails() {
        let env = Envelope {
            statement: Statement {
                node_id: node(1),
                slot_index: 1,
                pledges: StatementPledges::Confirm(StatementConfirm {
                    ballot: Ballot::new(1, Value(vec![1])),
                    n_prepared: 1,
                    n_commit: 1,
                    n_h: 1,
                    quorum_set_hash: Hash256::ZERO,
                }),
            },
            signature: Signature(vec![1, 2, 3]),
        };
        let bytes = env.to_bytes();
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(Envelope::from_bytes(&bytes[..cut]).is_err());
        }
    }
}
