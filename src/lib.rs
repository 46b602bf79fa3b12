//! A zero-trust protocol kernel for two-party peer-to-peer interactions.
//!
//! Two parties who do not trust each other and share no ambient authority
//! exchange a fixed vocabulary of signed, ledgered transactions — commit,
//! act, respond, prove, invalidate — while every move is checked against a
//! closed taxonomy of cheats. Either party can, at any time, hand a third
//! party the ledger and the public keys involved and have them independently
//! re-derive who (if anyone) cheated.
//!
//! # Layout
//!
//! - [`hash`] — SHA-256 digests, canonical encoding, secp256k1 identity (C1)
//! - [`merkle`] — Merkle tree construction and membership proofs (C2)
//! - [`commitment`] — the abstract commitment-scheme surface plus a grid
//!   reference implementation (C3)
//! - [`ledger`] — the append-only, signed, hash-chained transaction log (C4)
//! - [`protocol`] — the `Engine` state machine driving phase transitions (C5)
//! - [`enforcement`] — the turn/timeout monitor (C6)
//! - [`evidence`] — the closed seven-kind cheat taxonomy (C7)
//! - [`persistence`] — deterministic snapshot serialization (C8)
//! - [`reconnect`] — flush/restore/reconcile on disconnect (C9)
//! - [`options`] — construction-time configuration
//! - [`error`] — the error and rejection-reason taxonomy
//!
//! # Example
//!
//! ```
//! use ztpk::commitment::GridCommitment;
//! use ztpk::hash::Identity;
//! use ztpk::options::EngineOptions;
//! use ztpk::protocol::Engine;
//! use std::collections::BTreeSet;
//!
//! let options = EngineOptions::default();
//! let alice_scheme = GridCommitment::new(4, BTreeSet::from([(0, 0)]), b"alice-seed".to_vec());
//! let mut alice = Engine::new(Identity::generate(), alice_scheme, 1_000, &options).unwrap();
//! let alice_public = alice.set_self_commitment(1_000).unwrap();
//! assert_eq!(alice.phase(), ztpk::protocol::Phase::Committed);
//! assert_eq!(alice.get_self_commitment(), Some(&alice_public));
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

pub mod commitment;
pub mod enforcement;
pub mod error;
pub mod evidence;
pub mod hash;
pub mod ledger;
pub mod merkle;
pub mod options;
pub mod persistence;
pub mod protocol;
pub mod reconnect;

pub use commitment::{CommitmentPublic, CommitmentScheme, GridCommitment, GridQuery};
pub use error::{Error, RejectedReason, Result};
pub use evidence::{CheatEvidence, CheatKind};
pub use hash::{Digest, Identity, PublicKey, Signature};
pub use ledger::{Block, Ledger, MoveType, Transaction};
pub use merkle::{MerkleProof, MerkleTree};
pub use options::EngineOptions;
pub use protocol::{Engine, Phase};
