//! Error types for the zero-trust protocol kernel.

use thiserror::Error;

use crate::evidence::CheatEvidence;

/// Result type alias for kernel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons an operation was rejected as protocol misuse rather than a cheat.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectedReason {
    /// `record_self_action` called when `turn` belongs to the peer.
    #[error("not your turn")]
    NotYourTurn,
    /// A commitment was already set and cannot be overwritten.
    #[error("commitment already set")]
    CommitmentAlreadySet,
    /// The peer's identity has not been established yet.
    #[error("unknown peer")]
    UnknownPeer,
    /// The operation is not valid in the current protocol phase.
    #[error("wrong phase")]
    PhaseWrong,
    /// A transaction with this `(participant_id, nonce)` pair was already appended.
    #[error("duplicate nonce")]
    DuplicateNonce,
}

/// Errors surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Protocol misuse: the call was well-formed but not permitted right now.
    #[error("rejected: {0}")]
    Rejected(RejectedReason),

    /// A cheat was detected and classified; the protocol has moved to TERMINATED.
    #[error("cheat evidence: {0:?}")]
    Evidence(CheatEvidence),

    /// A persisted snapshot failed to re-verify on load.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    /// Reconnection found a diverging ledger that cannot be resolved by
    /// extending a shared prefix.
    #[error("unresolvable fork at index {divergent_index}")]
    UnresolvableFork {
        /// First index at which the two ledgers disagree.
        divergent_index: u64,
    },

    /// Lower-level cryptographic or encoding failure.
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Canonical-encoding failure (e.g. a float snuck into a hashed value).
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
