//! Cheat taxonomy (C7): classified evidence objects and the invalidation
//! decision they drive.
//!
//! The taxonomy is closed: exactly the seven kinds below. Every
//! [`CheatEvidence`] is self-contained — it carries the offending
//! transaction, proof, or block reference so a third party, given only the
//! ledger and the accused's public key, can re-derive the verdict.

use serde::{Deserialize, Serialize};

/// The seven classified cheat kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheatKind {
    /// A signature failed to verify against the claimed `participant_id`.
    ForgedSignature,
    /// A Merkle membership proof failed to verify against the peer's committed root.
    InvalidProof,
    /// A revealed witness decodes to values inconsistent with earlier revealed bits.
    CommitmentMismatch,
    /// Ledger replay failed invariant I1 (chain linkage) or I2 (block hash/difficulty).
    LedgerTamper,
    /// A pending action exceeded its deadline.
    TimeoutStall,
    /// A transaction was appended whose `participant_id` did not hold `turn`.
    DoubleMove,
    /// An action's declared type was outside the application's allowlist.
    InvalidMove,
}

impl std::fmt::Display for CheatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A self-contained, classified record of a protocol violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheatEvidence {
    /// Which of the seven closed kinds this is.
    pub kind: CheatKind,
    /// The `participant_id` of the accused party.
    pub accused: String,
    /// The offending transaction, proof, or block reference, opaque to the
    /// evidence type itself but re-derivable by any verifier holding the
    /// accused's public key.
    pub witness: serde_json::Value,
    /// Millisecond timestamp at which the evidence was produced.
    pub at: u64,
}

impl CheatEvidence {
    /// Construct evidence from any JSON-serializable witness value.
    pub fn new(
        kind: CheatKind,
        accused: impl Into<String>,
        witness: impl Serialize,
        at: u64,
    ) -> Self {
        Self {
            kind,
            accused: accused.into(),
            witness: serde_json::to_value(witness).unwrap_or(serde_json::Value::Null),
            at,
        }
    }
}
