//! Ledger (C4): append-only, signed, hash-chained block log with integrity
//! replay.
//!
//! This is a personal tamper-evident log, not a distributed-consensus
//! artifact (spec.md Non-goals): there is no mining race and no fork
//! choice. The proof-of-work difficulty exists solely as a local tamper
//! cost; trusted deployments may run with `difficulty_bits = 0` without
//! losing soundness.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, RejectedReason, Result};
use crate::hash::{canonical_bytes, sha256, Digest, Identity, PublicKey};
use crate::merkle::MerkleTree;

/// The five transaction kinds exchanged by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveType {
    /// Phase 1: publish a commitment root.
    Commit,
    /// A turn-based action.
    Action,
    /// A response to an action, optionally carrying a Merkle proof.
    Response,
    /// A standalone revealed Merkle proof.
    Proof,
    /// Terminates the protocol with attached cheat evidence.
    Invalidation,
}

/// A signed, appendable unit of protocol history.
///
/// The signature covers the canonical encoding of every field except
/// `signature` itself (see [`Transaction::signing_bytes`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// What kind of move this transaction records.
    pub move_type: MoveType,
    /// The `participant_id` of the signer.
    pub participant_id: String,
    /// Move-specific payload.
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Strictly increasing per `participant_id`.
    pub nonce: u64,
    /// Signature over [`Transaction::signing_bytes`].
    pub signature: crate::hash::Signature,
}

#[derive(Serialize)]
struct UnsignedTransaction<'a> {
    move_type: MoveType,
    participant_id: &'a str,
    data: &'a serde_json::Value,
    timestamp: u64,
    nonce: u64,
}

impl Transaction {
    /// Build and sign a transaction with the given identity.
    pub fn sign(
        identity: &Identity,
        move_type: MoveType,
        data: serde_json::Value,
        timestamp: u64,
        nonce: u64,
    ) -> Result<Self> {
        let participant_id = identity.public_key().participant_id();
        let unsigned = UnsignedTransaction {
            move_type,
            participant_id: &participant_id,
            data: &data,
            timestamp,
            nonce,
        };
        let bytes = canonical_bytes(&unsigned)?;
        let signature = identity.sign(&bytes);
        Ok(Self {
            move_type,
            participant_id,
            data,
            timestamp,
            nonce,
            signature,
        })
    }

    /// Canonical bytes covered by `signature`.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let unsigned = UnsignedTransaction {
            move_type: self.move_type,
            participant_id: &self.participant_id,
            data: &self.data,
            timestamp: self.timestamp,
            nonce: self.nonce,
        };
        canonical_bytes(&unsigned)
    }

    /// Verify this transaction's signature against a public key.
    ///
    /// Returns `Ok(())` on success; an `Err` means the signature was forged
    /// or the key does not match — callers at the protocol layer turn this
    /// into `CheatKind::ForgedSignature` evidence.
    pub fn verify_signature(&self, public_key: &PublicKey) -> Result<()> {
        let bytes = self.signing_bytes()?;
        crate::hash::verify(public_key, &bytes, &self.signature)
    }

    /// SHA-256 digest of this transaction's canonical encoding (including
    /// the signature), used as a Merkle leaf when sealing a block.
    pub fn hash(&self) -> Result<Digest> {
        Ok(sha256(&canonical_bytes(self)?))
    }
}

#[derive(Serialize)]
struct BlockHeader {
    index: u64,
    prev_hash: Digest,
    merkle_root: Digest,
    timestamp: u64,
    nonce: u64,
}

/// A sealed block: an ordered batch of transactions plus the chain link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Height; genesis is 0.
    pub index: u64,
    /// Hash of the preceding block; all-zero for genesis.
    pub prev_hash: Digest,
    /// The transactions sealed into this block, in append order.
    pub transactions: Vec<Transaction>,
    /// Milliseconds since the Unix epoch at sealing time.
    pub timestamp: u64,
    /// Proof-of-work nonce chosen to satisfy the sealing difficulty.
    pub nonce: u64,
    /// `SHA256(canonical(index, prev_hash, merkle_root(tx_hashes), timestamp, nonce))`.
    pub hash: Digest,
}

impl Block {
    fn compute_hash(
        index: u64,
        prev_hash: Digest,
        merkle_root: Digest,
        timestamp: u64,
        nonce: u64,
    ) -> Result<Digest> {
        let header = BlockHeader {
            index,
            prev_hash,
            merkle_root,
            timestamp,
            nonce,
        };
        Ok(sha256(&canonical_bytes(&header)?))
    }

    fn merkle_root(transactions: &[Transaction]) -> Result<Digest> {
        let mut leaves = Vec::with_capacity(transactions.len());
        for tx in transactions {
            leaves.push(canonical_bytes(tx)?);
        }
        Ok(MerkleTree::build(&leaves).root())
    }

    /// Build the genesis block: index 0, no transactions, `prev_hash` all-zero.
    pub fn genesis(timestamp: u64) -> Result<Self> {
        let merkle_root = Self::merkle_root(&[])?;
        let hash = Self::compute_hash(0, Digest::ZERO, merkle_root, timestamp, 0)?;
        Ok(Self {
            index: 0,
            prev_hash: Digest::ZERO,
            transactions: Vec::new(),
            timestamp,
            nonce: 0,
            hash,
        })
    }

    /// Seal a non-genesis block by brute-forcing a nonce that satisfies
    /// `difficulty_bits` leading zero bits in the resulting hash.
    pub fn seal(
        index: u64,
        prev_hash: Digest,
        transactions: Vec<Transaction>,
        timestamp: u64,
        difficulty_bits: u32,
    ) -> Result<Self> {
        let merkle_root = Self::merkle_root(&transactions)?;
        let mut nonce = 0u64;
        loop {
            let hash = Self::compute_hash(index, prev_hash, merkle_root, timestamp, nonce)?;
            if hash.leading_zero_bits() >= difficulty_bits {
                return Ok(Self {
                    index,
                    prev_hash,
                    transactions,
                    timestamp,
                    nonce,
                    hash,
                });
            }
            nonce += 1;
        }
    }

    /// Recompute this block's hash from its contents and compare to `self.hash`.
    pub fn recompute_hash(&self) -> Result<Digest> {
        let merkle_root = Self::merkle_root(&self.transactions)?;
        Self::compute_hash(self.index, self.prev_hash, merkle_root, self.timestamp, self.nonce)
    }
}

/// The reason `Ledger::verify` rejected a ledger, naming the failing invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    /// I1: `blocks[i].prev_hash != blocks[i-1].hash`.
    ChainBroken,
    /// I2: a block's stored hash does not match its recomputed hash, or
    /// fails to meet the sealing difficulty.
    HashMismatch,
    /// I3: a non-genesis transaction's signature does not verify.
    BadSignature,
    /// I4: a block's timestamp regresses beyond the configured clock-skew
    /// tolerance.
    TimestampRegression,
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::ChainBroken => "prev_hash does not match preceding block's hash",
            Self::HashMismatch => "hash mismatch",
            Self::BadSignature => "transaction signature does not verify",
            Self::TimestampRegression => "timestamp regressed beyond tolerance",
        };
        write!(f, "{msg}")
    }
}

/// Append-only, signed, hash-chained ledger.
#[derive(Debug, Clone)]
pub struct Ledger {
    blocks: Vec<Block>,
    pending: Vec<Transaction>,
    /// Highest nonce seen per participant, for at-most-once enforcement.
    nonces: HashMap<String, u64>,
    difficulty_bits: u32,
    clock_skew_tolerance_ms: u64,
}

impl Ledger {
    /// Create a new ledger with a freshly sealed genesis block.
    pub fn new(genesis_timestamp: u64, difficulty_bits: u32, clock_skew_tolerance_ms: u64) -> Result<Self> {
        let genesis = Block::genesis(genesis_timestamp)?;
        Ok(Self {
            blocks: vec![genesis],
            pending: Vec::new(),
            nonces: HashMap::new(),
            difficulty_bits,
            clock_skew_tolerance_ms,
        })
    }

    /// Reconstruct a ledger from an already-sealed block sequence (used by
    /// persistence and reconnection). Does not verify; call `verify()`
    /// afterwards.
    #[must_use] 
    pub fn from_blocks(blocks: Vec<Block>, difficulty_bits: u32, clock_skew_tolerance_ms: u64) -> Self {
        let mut nonces = HashMap::new();
        for block in &blocks {
            for tx in &block.transactions {
                let entry = nonces.entry(tx.participant_id.clone()).or_insert(0);
                *entry = (*entry).max(tx.nonce);
            }
        }
        Self {
            blocks,
            pending: Vec::new(),
            nonces,
            difficulty_bits,
            clock_skew_tolerance_ms,
        }
    }

    /// All sealed blocks, oldest first.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The most recently sealed block.
    #[must_use]
    pub fn head(&self) -> &Block {
        self.blocks.last().expect("ledger is never empty")
    }

    /// Transactions appended but not yet sealed into a block.
    #[must_use]
    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    /// Append a transaction to the pending buffer.
    ///
    /// At-most-once: a transaction whose `(participant_id, nonce)` has
    /// already been appended (sealed or pending) is rejected.
    pub fn append(&mut self, tx: Transaction) -> Result<()> {
        let last_nonce = self.nonces.get(&tx.participant_id).copied();
        if let Some(last) = last_nonce {
            if tx.nonce <= last {
                return Err(Error::Rejected(RejectedReason::DuplicateNonce));
            }
        }
        debug!(participant = %tx.participant_id, nonce = tx.nonce, ?tx.move_type, "appending transaction");
        self.nonces.insert(tx.participant_id.clone(), tx.nonce);
        self.pending.push(tx);
        Ok(())
    }

    /// Seal the pending buffer into a new block at the configured difficulty.
    pub fn seal(&mut self, timestamp: u64) -> Result<&Block> {
        let index = self.blocks.len() as u64;
        let prev_hash = self.head().hash;
        let transactions = std::mem::take(&mut self.pending);
        let block = Block::seal(index, prev_hash, transactions, timestamp, self.difficulty_bits)?;
        info!(index, nonce = block.nonce, txs = block.transactions.len(), "sealed block");
        self.blocks.push(block);
        Ok(self.head())
    }

    /// Replay I1-I4 against a map of known public keys (`participant_id` ->
    /// key), returning the first failing block index and reason, if any.
    pub fn verify(&self, known_keys: &HashMap<String, PublicKey>) -> Result<Option<(u64, VerifyFailure)>> {
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                let prev = &self.blocks[i - 1];
                if block.prev_hash != prev.hash {
                    warn!(index = i, "ledger chain broken");
                    return Ok(Some((i as u64, VerifyFailure::ChainBroken)));
                }
                let tolerance = self.clock_skew_tolerance_ms;
                if block.timestamp + tolerance < prev.timestamp {
                    return Ok(Some((i as u64, VerifyFailure::TimestampRegression)));
                }
            }

            let recomputed = block.recompute_hash()?;
            let difficulty_met = i == 0 || block.hash.leading_zero_bits() >= self.difficulty_bits;
            if recomputed != block.hash || !difficulty_met {
                warn!(index = i, "ledger hash mismatch");
                return Ok(Some((i as u64, VerifyFailure::HashMismatch)));
            }

            if i > 0 {
                for tx in &block.transactions {
                    match known_keys.get(&tx.participant_id) {
                        Some(key) => {
                            if tx.verify_signature(key).is_err() {
                                return Ok(Some((i as u64, VerifyFailure::BadSignature)));
                            }
                        }
                        None => return Ok(Some((i as u64, VerifyFailure::BadSignature))),
                    }
                }
            }
        }
        Ok(None)
    }

    /// Serialize to the canonical wire/storage form (see C8).
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_bytes(&self.blocks)
    }

    /// Accept an already-sealed block received from a peer during
    /// reconnection (C9), verifying it links onto the current head and that
    /// every transaction it carries is properly signed before appending.
    ///
    /// Unlike [`Ledger::seal`], this never searches for a nonce: the block
    /// arrives pre-sealed and is accepted only if its stored hash already
    /// satisfies the configured difficulty.
    ///
    /// # Errors
    ///
    /// Returns the first [`VerifyFailure`] that would also be reported by
    /// [`Ledger::verify`] for this block.
    pub fn try_append_block(
        &mut self,
        block: Block,
        known_keys: &HashMap<String, PublicKey>,
    ) -> std::result::Result<(), VerifyFailure> {
        let head = self.head();
        if block.index != head.index + 1 || block.prev_hash != head.hash {
            return Err(VerifyFailure::ChainBroken);
        }
        if block.timestamp + self.clock_skew_tolerance_ms < head.timestamp {
            return Err(VerifyFailure::TimestampRegression);
        }
        let recomputed = block.recompute_hash().map_err(|_| VerifyFailure::HashMismatch)?;
        if recomputed != block.hash || block.hash.leading_zero_bits() < self.difficulty_bits {
            return Err(VerifyFailure::HashMismatch);
        }
        for tx in &block.transactions {
            match known_keys.get(&tx.participant_id) {
                Some(key) if tx.verify_signature(key).is_ok() => {}
                _ => return Err(VerifyFailure::BadSignature),
            }
        }

        for tx in &block.transactions {
            let entry = self.nonces.entry(tx.participant_id.clone()).or_insert(0);
            *entry = (*entry).max(tx.nonce);
        }
        self.blocks.push(block);
        Ok(())
    }
}
