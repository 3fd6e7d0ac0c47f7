//! Error types for the agreement engine.

use thiserror::Error;

/// Errors that can occur during federated agreement operations.
#[derive(Debug, Error)]
pub enum FbaError {
    /// A statement failed sanity checking (bad signature, malformed
    /// counters, wrong slot). The offending statement is discarded; the
    /// session that carried it is not at fault.
    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    /// A quorum set failed structural validation.
    #[error("invalid quorum set: {0}")]
    InvalidQuorumSet(String),

    /// The requested slot does not exist (never created or purged).
    #[error("slot not found: {0}")]
    SlotNotFound(u64),

    /// An internal invariant was violated. The slot that produced this is
    /// considered poisoned.
    #[error("internal state error: {0}")]
    Internal(String),
}
