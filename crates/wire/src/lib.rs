//! Wire data model for concord.
//!
//! This crate defines everything that crosses a session boundary: the
//! consensus types (ballots, statements, envelopes, quorum sets) and the
//! overlay message taxonomy, together with the canonical tagged-union
//! codec they travel in.
//!
//! # Encoding
//!
//! The encoding is deliberately boring: fixed-width big-endian integers,
//! length-prefixed byte strings and vectors, a `0`/`1` word for options,
//! and a `u32` tag for union variants. It is canonical — a value has
//! exactly one encoding — so hashes over encoded bytes can serve as
//! identities (quorum-set hashes, flood ids).
//!
//! Decoding is total: every input either produces a value or a
//! [`WireError`]; the overlay converts the latter into a session drop.
//!
//! Framing (the 4-byte length prefix in front of each message) is the
//! overlay's job, not this crate's.

mod codec;
mod consensus;
mod error;
mod msg;

pub use codec::{
    get_bytes, get_bytes_list, put_bytes, put_bytes_list, Reader, WireDecode, WireEncode,
};
pub use consensus::{
    Ballot, Envelope, NodeId, QuorumSet, Signature, Statement, StatementConfirm,
    StatementExternalize, StatementNominate, StatementPledges, StatementPrepare, Value,
    MAX_QUORUM_SET_DECODE_DEPTH,
};
pub use error::WireError;
pub use msg::{
    DontHave, ErrorMsg, Hello, Message, MessageType, PeerAddress, Transaction, TxSet,
};

// Re-export the hash type alongside the types that embed it.
pub use concord_common::Hash256;
