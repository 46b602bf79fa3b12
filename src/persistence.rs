//! State persistence (C8): deterministic snapshot serialization and
//! crash-safe atomic writes.
//!
//! Snapshots never carry a private key — `identity_public` is the only
//! identity material on the wire; the signing key is always supplied
//! separately by the caller's own secret store.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::evidence::CheatEvidence;
use crate::hash::canonical_bytes;
use crate::ledger::{Block, Transaction};
use crate::protocol::Phase;

/// Snapshot of everything [`crate::protocol::Engine`] needs to resume a
/// session, short of the private signing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version; bumped on any incompatible schema change.
    pub version: u32,
    /// The sealed block sequence (see [`crate::ledger::Ledger::blocks`]).
    pub ledger: Vec<Block>,
    /// Transactions appended but not yet sealed into a block (see
    /// [`crate::ledger::Ledger::pending`]) — sealing only happens on
    /// invalidation, so most sessions have pending transactions that must
    /// survive a snapshot/restore roundtrip.
    pub pending: Vec<Transaction>,
    /// Everything [`crate::protocol::Engine`] tracks outside the ledger.
    pub protocol: ProtocolSnapshot,
    /// Hex-encoded uncompressed public key of the owning identity.
    pub identity_public: String,
}

/// The non-ledger half of an [`Engine`](crate::protocol::Engine)'s state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSnapshot {
    /// Coarse phase at the moment of the snapshot.
    pub phase: Phase,
    /// The peer's `participant_id`, once known.
    pub peer_id: Option<String>,
    /// This engine's published commitment, once set.
    pub self_commit: Option<crate::commitment::CommitmentPublic>,
    /// The peer's published commitment, once known.
    pub peer_commit: Option<crate::commitment::CommitmentPublic>,
    /// Whose turn it is, once `ACTIVE`.
    pub turn: Option<String>,
    /// The local nonce counter, so a restored engine never reuses a nonce.
    pub nonce: u64,
    /// Evidence that terminated the protocol, if any.
    pub invalidated_by: Option<CheatEvidence>,
}

/// The current snapshot format version produced by this crate.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialize a snapshot to its canonical byte encoding (see
/// [`crate::hash`] module docs for what "canonical" means here).
///
/// # Errors
///
/// Propagates encoding failures from `serde_json`.
pub fn serialize(snapshot: &Snapshot) -> Result<Vec<u8>> {
    canonical_bytes(snapshot)
}

/// Parse and structurally validate a snapshot's bytes.
///
/// This only checks that `bytes` decodes to a `Snapshot` of a known
/// version; it does **not** re-verify the ledger — callers must call
/// [`crate::ledger::Ledger::verify`] (or
/// [`crate::protocol::Engine::restore`], which does this for you) before
/// trusting the result.
///
/// # Errors
///
/// Returns `CorruptState` if `bytes` does not decode to a `Snapshot`, or
/// decodes to an unsupported version.
pub fn deserialize(bytes: &[u8]) -> Result<Snapshot> {
    let snapshot: Snapshot =
        serde_json::from_slice(bytes).map_err(|e| Error::CorruptState(format!("malformed snapshot: {e}")))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::CorruptState(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

/// Atomically write `bytes` to `path`: write to `path.tmp`, then rename
/// over `path`. A reader observing `path` mid-write always sees either
/// the old contents or the new ones, never a truncation.
///
/// # Errors
///
/// Returns the underlying I/O error from either the temp-file write or
/// the rename.
pub fn save_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)
}

/// Load raw snapshot bytes from `path`.
///
/// # Errors
///
/// Returns the underlying I/O error, e.g. `NotFound` on first run.
pub fn load(path: &Path) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            ledger: Vec::new(),
            pending: Vec::new(),
            protocol: ProtocolSnapshot {
                phase: Phase::Init,
                peer_id: None,
                self_commit: None,
                peer_commit: None,
                turn: None,
                nonce: 0,
                invalidated_by: None,
            },
            identity_public: "deadbeef".to_string(),
        }
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let snapshot = sample_snapshot();
        let bytes = serialize(&snapshot).unwrap();
        let back = deserialize(&bytes).unwrap();
        assert_eq!(snapshot, back);
    }

    #[test]
    fn deserialize_rejects_garbage() {
        let err = deserialize(b"not json").unwrap_err();
        assert!(matches!(err, Error::CorruptState(_)));
    }

    #[test]
    fn deserialize_rejects_unknown_version() {
        let mut snapshot = sample_snapshot();
        snapshot.version = 99;
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let err = deserialize(&bytes).unwrap_err();
        assert!(matches!(err, Error::CorruptState(_)));
    }

    #[test]
    fn save_atomic_then_load_roundtrips_and_leaves_no_tmp_file() {
        let dir = std::env::temp_dir().join(format!("ztpk-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snapshot.json");

        let snapshot = sample_snapshot();
        let bytes = serialize(&snapshot).unwrap();
        save_atomic(&path, &bytes).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(deserialize(&loaded).unwrap(), snapshot);
        assert!(!path.with_extension("tmp").exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
