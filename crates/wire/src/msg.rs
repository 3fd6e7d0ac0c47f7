//! Overlay message taxonomy and payloads.

use std::fmt;

use concord_common::Hash256;

use crate::codec::{get_bytes, get_bytes_list, put_bytes, put_bytes_list, Reader, WireDecode, WireEncode};
use crate::consensus::{Envelope, QuorumSet};
use crate::error::WireError;

/// Top-level message tags, in taxonomy order. The numeric values are the
/// wire tags and must never be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Handshake greeting.
    Hello = 0,
    /// Error report.
    ErrorMsg = 1,
    /// "I don't have the item you asked for."
    DontHave = 2,
    /// Request for known peer addresses.
    GetPeers = 3,
    /// Peer address hints.
    Peers = 4,
    /// Request for a ledger history range.
    GetHistory = 5,
    /// Ledger history payload.
    History = 6,
    /// Request for a ledger delta.
    GetDelta = 7,
    /// Ledger delta payload.
    Delta = 8,
    /// Request for a transaction set by hash.
    GetTxSet = 9,
    /// Transaction set payload.
    TxSet = 10,
    /// Request for a quorum set by hash.
    GetQuorumSet = 11,
    /// Quorum set payload.
    QuorumSet = 12,
    /// Request for validations of a ledger.
    GetValidations = 13,
    /// Validation envelopes.
    Validations = 14,
    /// A single transaction flood.
    Transaction = 15,
    /// A federated agreement envelope flood.
    FbaMessage = 16,
}

impl MessageType {
    /// Decode from a wire tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        use MessageType::*;
        Some(match tag {
            0 => Hello,
            1 => ErrorMsg,
            2 => DontHave,
            3 => GetPeers,
            4 => Peers,
            5 => GetHistory,
            6 => History,
            7 => GetDelta,
            8 => Delta,
            9 => GetTxSet,
            10 => TxSet,
            11 => GetQuorumSet,
            12 => QuorumSet,
            13 => GetValidations,
            14 => Validations,
            15 => Transaction,
            16 => FbaMessage,
            _ => return None,
        })
    }

    /// Human-readable name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::ErrorMsg => "ERROR_MSG",
            MessageType::DontHave => "DONT_HAVE",
            MessageType::GetPeers => "GET_PEERS",
            MessageType::Peers => "PEERS",
            MessageType::GetHistory => "GET_HISTORY",
            MessageType::History => "HISTORY",
            MessageType::GetDelta => "GET_DELTA",
            MessageType::Delta => "DELTA",
            MessageType::GetTxSet => "GET_TX_SET",
            MessageType::TxSet => "TX_SET",
            MessageType::GetQuorumSet => "GET_QUORUMSET",
            MessageType::QuorumSet => "QUORUMSET",
            MessageType::GetValidations => "GET_VALIDATIONS",
            MessageType::Validations => "VALIDATIONS",
            MessageType::Transaction => "TRANSACTION",
            MessageType::FbaMessage => "FBA_MESSAGE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl WireEncode for MessageType {
    fn encode(&self, buf: &mut Vec<u8>) {
        (*self as u32).encode(buf);
    }
}

impl WireDecode for MessageType {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let tag = r.read_u32()?;
        Self::from_tag(tag).ok_or(WireError::UnknownTag {
            context: "message type",
            tag,
        })
    }
}

/// HELLO payload: the first message on every session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    /// Overlay protocol version; sessions with a mismatch are refused.
    pub protocol_version: u32,
    /// Free-form software version string.
    pub version_str: String,
    /// Port the sender accepts connections on.
    pub listening_port: u16,
}

/// ERROR_MSG payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMsg {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable description.
    pub message: String,
}

/// DONT_HAVE payload: the requested item is unavailable here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DontHave {
    /// What kind of item was requested.
    pub kind: MessageType,
    /// Identifier of the missing item.
    pub req_hash: Hash256,
}

/// A peer address hint carried in PEERS.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    /// Host name or dotted-quad address.
    pub host: String,
    /// Listening port.
    pub port: u16,
}

impl PeerAddress {
    /// Make an address from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl WireEncode for PeerAddress {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.host.encode(buf);
        self.port.encode(buf);
    }
}

impl WireDecode for PeerAddress {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            host: String::decode(r)?,
            port: u16::decode(r)?,
        })
    }
}

/// A transaction as flooded on the wire. The body is opaque to the
/// overlay; the herder interprets it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Serialized transaction body.
    pub raw: Vec<u8>,
}

impl Transaction {
    /// Identifier used for flood dedup and DONT_HAVE replies.
    pub fn id(&self) -> Hash256 {
        Hash256::hash(&self.raw)
    }
}

impl WireEncode for Transaction {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.raw);
    }
}

impl WireDecode for Transaction {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            raw: get_bytes(r)?,
        })
    }
}

/// A transaction set exchanged via GET_TX_SET / TX_SET.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TxSet {
    /// Member transactions.
    pub txs: Vec<Transaction>,
}

impl TxSet {
    /// Content hash identifying this set.
    pub fn hash(&self) -> Hash256 {
        Hash256::hash(&self.to_bytes())
    }
}

impl WireEncode for TxSet {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.txs.len() as u32).encode(buf);
        for tx in &self.txs {
            tx.encode(buf);
        }
    }
}

impl WireDecode for TxSet {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let len = r.read_len(4)?;
        let mut txs = Vec::with_capacity(len);
        for _ in 0..len {
            txs.push(Transaction::decode(r)?);
        }
        Ok(Self { txs })
    }
}

/// A top-level overlay message.
///
/// The history, delta, and validations payloads are pinned minimally: the
/// overlay only frames and routes them, their interpretation belongs to
/// the collaborators behind the gateway traits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Handshake greeting.
    Hello(Hello),
    /// Error report.
    ErrorMsg(ErrorMsg),
    /// Requested item is unavailable.
    DontHave(DontHave),
    /// Ask for peer address hints.
    GetPeers,
    /// Peer address hints.
    Peers(Vec<PeerAddress>),
    /// Ask for a ledger range.
    GetHistory {
        /// First ledger requested.
        first_ledger: u64,
        /// Last ledger requested.
        last_ledger: u64,
    },
    /// Opaque ledger history entries.
    History(Vec<Vec<u8>>),
    /// Ask for the delta since a ledger.
    GetDelta {
        /// Ledger the requester already has.
        from_ledger: u64,
    },
    /// Opaque delta entries.
    Delta(Vec<Vec<u8>>),
    /// Ask for a transaction set by hash.
    GetTxSet(Hash256),
    /// Transaction set payload.
    TxSet(TxSet),
    /// Ask for a quorum set by hash.
    GetQuorumSet(Hash256),
    /// Quorum set payload.
    QuorumSet(QuorumSet),
    /// Ask for validations of a ledger.
    GetValidations {
        /// Slot whose validations are requested.
        ledger_index: u64,
    },
    /// Validation envelopes for past slots.
    Validations(Vec<Envelope>),
    /// A flooded transaction.
    Transaction(Transaction),
    /// A flooded consensus envelope.
    FbaMessage(Envelope),
}

impl Message {
    /// The tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::ErrorMsg(_) => MessageType::ErrorMsg,
            Message::DontHave(_) => MessageType::DontHave,
            Message::GetPeers => MessageType::GetPeers,
            Message::Peers(_) => MessageType::Peers,
            Message::GetHistory { .. } => MessageType::GetHistory,
            Message::History(_) => MessageType::History,
            Message::GetDelta { .. } => MessageType::GetDelta,
            Message::Delta(_) => MessageType::Delta,
            Message::GetTxSet(_) => MessageType::GetTxSet,
            Message::TxSet(_) => MessageType::TxSet,
            Message::GetQuorumSet(_) => MessageType::GetQuorumSet,
            Message::QuorumSet(_) => MessageType::QuorumSet,
            Message::GetValidations { .. } => MessageType::GetValidations,
            Message::Validations(_) => MessageType::Validations,
            Message::Transaction(_) => MessageType::Transaction,
            Message::FbaMessage(_) => MessageType::FbaMessage,
        }
    }

    /// True for messages that are propagated to all peers.
    pub fn is_flood(&self) -> bool {
        matches!(self, Message::Transaction(_) | Message::FbaMessage(_))
    }
}

impl WireEncode for Message {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.message_type().encode(buf);
        match self {
            Message::Hello(hello) => {
                hello.protocol_version.encode(buf);
                hello.version_str.encode(buf);
                hello.listening_port.encode(buf);
            }
            Message::ErrorMsg(err) => {
                err.code.encode(buf);
                err.message.encode(buf);
            }
            Message::DontHave(dh) => {
                dh.kind.encode(buf);
                dh.req_hash.encode(buf);
            }
            Message::GetPeers => {}
            Message::Peers(addrs) => addrs.encode(buf),
            Message::GetHistory {
                first_ledger,
                last_ledger,
            } => {
                first_ledger.encode(buf);
                last_ledger.encode(buf);
            }
            Message::History(entries) => put_bytes_list(buf, entries),
            Message::GetDelta { from_ledger } => from_ledger.encode(buf),
            Message::Delta(entries) => put_bytes_list(buf, entries),
            Message::GetTxSet(id) => id.encode(buf),
            Message::TxSet(set) => set.encode(buf),
            Message::GetQuorumSet(id) => id.encode(buf),
            Message::QuorumSet(qs) => qs.encode(buf),
            Message::GetValidations { ledger_index } => ledger_index.encode(buf),
            Message::Validations(envs) => envs.encode(buf),
            Message::Transaction(tx) => tx.encode(buf),
            Message::FbaMessage(env) => env.encode(buf),
        }
    }
}

impl WireDecode for Message {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let ty = MessageType::decode(r)?;
        Ok(match ty {
            MessageType::Hello => Message::Hello(Hello {
                protocol_version: u32::decode(r)?,
                version_str: String::decode(r)?,
                listening_port: u16::decode(r)?,
            }),
            MessageType::ErrorMsg => Message::ErrorMsg(ErrorMsg {
                code: u32::decode(r)?,
                message: String::decode(r)?,
            }),
            MessageType::DontHave => Message::DontHave(DontHave {
                kind: MessageType::decode(r)?,
                req_hash: Hash256::decode(r)?,
            }),
            MessageType::GetPeers => Message::GetPeers,
            MessageType::Peers => Message::Peers(Vec::<PeerAddress>::decode(r)?),
            MessageType::GetHistory => Message::GetHistory {
                first_ledger: u64::decode(r)?,
                last_ledger: u64::decode(r)?,
            },
            MessageType::History => Message::History(get_bytes_list(r)?),
            MessageType::GetDelta => Message::GetDelta {
                from_ledger: u64::decode(r)?,
            },
            MessageType::Delta => Message::Delta(get_bytes_list(r)?),
            MessageType::GetTxSet => Message::GetTxSet(Hash256::decode(r)?),
            MessageType::TxSet => Message::TxSet(TxSet::decode(r)?),
            MessageType::GetQuorumSet => Message::GetQuorumSet(Hash256::decode(r)?),
            MessageType::QuorumSet => Message::QuorumSet(QuorumSet::decode(r)?),
            MessageType::GetValidations => Message::GetValidations {
                ledger_index: u64::decode(r)?,
            },
            MessageType::Validations => Message::Validations(Vec::<Envelope>::decode(r)?),
            MessageType::Transaction => Message::Transaction(Transaction::decode(r)?),
            MessageType::FbaMessage => Message::FbaMessage(Envelope::decode(r)?),
        })
    }
}
