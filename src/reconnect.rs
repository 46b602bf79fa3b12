//! Reconnection orchestrator (C9): flush-on-disconnect, load-and-reverify,
//! and suffix reconciliation on reconnect.
//!
//! This module performs no network I/O itself — the transport layer hands
//! it the peer's claimed head and, if asked, the peer's claimed suffix
//! blocks. What it owns is the decision of whether that suffix is a
//! legitimate extension of the shared history, a sign of tampering, or an
//! unresolvable fork.

use std::path::Path;

use serde::Serialize;

use crate::commitment::CommitmentScheme;
use crate::error::Error;
use crate::evidence::CheatKind;
use crate::hash::{Digest, Identity};
use crate::ledger::{Block, VerifyFailure};
use crate::options::EngineOptions;
use crate::persistence::{self, Snapshot};
use crate::protocol::Engine;

/// Errors from reconnection: I/O failures are surfaced unchanged, distinct
/// from protocol-level errors (see spec.md's error propagation policy).
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Loading or saving the snapshot failed at the filesystem layer.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A protocol-level error: corrupt state, classified cheat evidence, or
    /// an unresolvable fork.
    #[error(transparent)]
    Protocol(#[from] Error),
}

/// The result of reconciling local history against a peer's claimed head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Local and peer heads already agree; nothing to do.
    AlreadyInSync,
    /// The peer was ahead; this many blocks were verified and appended.
    ExtendedBy(usize),
}

/// Flush the current session state to `path` via an atomic write (see
/// [`persistence::save_atomic`]). Call this on disconnect.
///
/// # Errors
///
/// Returns [`ReconnectError::Io`] if the write fails, or
/// [`ReconnectError::Protocol`] if the snapshot cannot be canonically
/// encoded.
pub fn flush<C: CommitmentScheme>(engine: &Engine<C>, path: &Path) -> Result<(), ReconnectError>
where
    C::Query: Serialize + Clone,
    C::Fact: Serialize + Clone,
{
    let snapshot = engine.snapshot();
    let bytes = persistence::serialize(&snapshot)?;
    persistence::save_atomic(path, &bytes)?;
    Ok(())
}

/// Load a previously flushed snapshot from `path` and rebuild an engine,
/// re-verifying the ledger before returning it. Call this on reconnect,
/// before exchanging heads with the peer.
///
/// # Errors
///
/// Returns [`ReconnectError::Io`] if the snapshot cannot be read, or
/// [`ReconnectError::Protocol(CorruptState)`] if it fails to decode or
/// re-verify.
pub fn load_and_verify<C: CommitmentScheme>(
    path: &Path,
    identity: Identity,
    scheme: C,
    options: &EngineOptions,
) -> Result<Engine<C>, ReconnectError>
where
    C::Query: Serialize + Clone,
    C::Fact: Serialize + Clone,
{
    let bytes = persistence::load(path)?;
    let snapshot: Snapshot = persistence::deserialize(&bytes)?;
    Ok(Engine::restore(identity, scheme, snapshot, options)?)
}

/// Reconcile local history against a peer's claimed head, after exchanging
/// latest-block hashes out of band.
///
/// - If heads already agree, returns [`ReconcileOutcome::AlreadyInSync`].
/// - If the peer is ahead, `peer_suffix` is verified block-by-block (chain
///   linkage, hash/difficulty, and every transaction signature) and
///   appended; a bad signature on the peer's chain is classified
///   `LEDGER_TAMPER` against the peer, while any other structural mismatch
///   (broken linkage, bad hash) is reported as
///   [`Error::UnresolvableFork`] — divergence that extending a prefix
///   cannot repair.
/// - If the peer is not ahead but the heads still disagree, the chains have
///   already forked at or below the peer's claimed height: also
///   [`Error::UnresolvableFork`].
///
/// # Errors
///
/// See variant docs above; all failures are `Err(ReconnectError::Protocol(_))`.
pub fn reconcile<C: CommitmentScheme>(
    engine: &mut Engine<C>,
    peer_head_index: u64,
    peer_head_hash: Digest,
    peer_suffix: Vec<Block>,
    now: u64,
) -> Result<ReconcileOutcome, ReconnectError>
where
    C::Query: Serialize + Clone,
    C::Fact: Serialize + Clone,
{
    let local_head = engine.ledger().head().clone();
    if local_head.index == peer_head_index && local_head.hash == peer_head_hash {
        return Ok(ReconcileOutcome::AlreadyInSync);
    }

    if peer_head_index <= local_head.index {
        // The peer is not ahead, yet the heads disagree: the two histories
        // diverged somewhere at or below the peer's claimed height. No
        // suffix can repair that.
        return Err(Error::UnresolvableFork {
            divergent_index: peer_head_index,
        }
        .into());
    }

    let known_keys = engine.known_keys().clone();
    let peer_id = engine.peer_id().unwrap_or("unknown").to_string();
    let mut applied = 0usize;

    for block in peer_suffix {
        let index = block.index;
        if let Err(reason) = engine.ledger_mut().try_append_block(block, &known_keys) {
            return match reason {
                VerifyFailure::BadSignature => Err(ReconnectError::Protocol(engine.terminate_with_evidence(
                    CheatKind::LedgerTamper,
                    peer_id,
                    serde_json::json!({ "index": index, "reason": reason.to_string() }),
                    now,
                ))),
                VerifyFailure::ChainBroken | VerifyFailure::HashMismatch | VerifyFailure::TimestampRegression => {
                    Err(Error::UnresolvableFork { divergent_index: index }.into())
                }
            };
        }
        applied += 1;
    }

    if engine.ledger().head().hash != peer_head_hash {
        return Err(Error::UnresolvableFork {
            divergent_index: engine.ledger().head().index,
        }
        .into());
    }

    Ok(ReconcileOutcome::ExtendedBy(applied))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::GridCommitment;

    fn make_engine(seed: [u8; 32]) -> Engine<GridCommitment> {
        let identity = Identity::from_seed(&seed).unwrap();
        let scheme = GridCommitment::new(2, std::collections::BTreeSet::new(), b"s".to_vec());
        Engine::new(identity, scheme, 1000, &EngineOptions::default()).unwrap()
    }

    #[test]
    fn flush_then_load_and_verify_roundtrips() {
        let seed = [7u8; 32];
        let mut engine = make_engine(seed);
        engine.set_self_commitment(1001).unwrap();

        let dir = std::env::temp_dir().join(format!("ztpk-reconnect-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snap.json");

        flush(&engine, &path).unwrap();

        let identity = Identity::from_seed(&seed).unwrap();
        let scheme = GridCommitment::new(2, std::collections::BTreeSet::new(), b"s".to_vec());
        let restored = load_and_verify(&path, identity, scheme, &EngineOptions::default()).unwrap();
        assert_eq!(restored.self_id(), engine.self_id());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reconcile_already_in_sync_is_a_no_op() {
        let mut engine = make_engine([1u8; 32]);
        let head = engine.ledger().head().clone();
        let outcome = reconcile(&mut engine, head.index, head.hash, vec![], 2000).unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyInSync);
    }

    #[test]
    fn reconcile_extends_with_valid_peer_suffix() {
        let seed = [3u8; 32];
        let mut alice = make_engine(seed);
        alice.set_self_commitment(1001).unwrap();

        // Bob starts from the same genesis and independently seals the same
        // commitment transaction, producing a suffix alice can adopt.
        let mut bob = make_engine(seed);
        bob.set_self_commitment(1001).unwrap();
        let tx = bob.ledger().pending()[0].clone();
        let mut source = crate::ledger::Ledger::new(1000, 2, 2000).unwrap();
        source.append(tx).unwrap();
        let sealed = source.seal(1050).unwrap().clone();

        let outcome = reconcile(&mut alice, sealed.index, sealed.hash, vec![sealed], 2000).unwrap();
        assert_eq!(outcome, ReconcileOutcome::ExtendedBy(1));
        assert_eq!(alice.verify_ledger().unwrap(), None);
    }

    #[test]
    fn reconcile_rejects_suffix_with_forged_signature() {
        let mut alice = make_engine([4u8; 32]);
        let attacker = Identity::generate();

        let mut source = crate::ledger::Ledger::new(1000, 2, 2000).unwrap();
        let tx = crate::ledger::Transaction::sign(
            &attacker,
            crate::ledger::MoveType::Action,
            serde_json::json!({"type": "query"}),
            1001,
            1,
        )
        .unwrap();
        source.append(tx).unwrap();
        let sealed = source.seal(1002).unwrap().clone();

        let err = reconcile(&mut alice, sealed.index, sealed.hash, vec![sealed], 2000).unwrap_err();
        match err {
            ReconnectError::Protocol(Error::Evidence(e)) => assert_eq!(e.kind, CheatKind::LedgerTamper),
            other => panic!("expected LEDGER_TAMPER evidence, got {other:?}"),
        }
        assert_eq!(alice.phase(), crate::protocol::Phase::Terminated);
    }

    #[test]
    fn reconcile_reports_fork_when_peer_not_ahead_but_heads_disagree() {
        let mut alice = make_engine([5u8; 32]);
        let head = alice.ledger().head().clone();
        let err = reconcile(&mut alice, head.index, Digest::from_bytes([0xAB; 32]), vec![], 2000).unwrap_err();
        assert!(matches!(
            err,
            ReconnectError::Protocol(Error::UnresolvableFork { .. })
        ));
    }
}
