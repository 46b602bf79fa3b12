//! Protocol state machine (C5): commitment exchange, turn-based
//! action/response, and termination/invalidation.
//!
//! `Engine<C>` is generic over the commitment scheme in play (C3); the
//! shipped reference scheme is [`crate::commitment::GridCommitment`].

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::commitment::{CommitmentPublic, CommitmentScheme};
use crate::enforcement::{Monitor, MonitorView, PendingAction};
use crate::error::{Error, RejectedReason, Result};
use crate::evidence::{CheatEvidence, CheatKind};
use crate::hash::{Digest, Identity, PublicKey};
use crate::ledger::{Ledger, MoveType, Transaction};
use crate::merkle::MerkleProof;

/// Coarse protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Identity exists; no commitment published yet.
    Init,
    /// This party's commitment is published; waiting on (or already have)
    /// the peer's.
    Committed,
    /// Both commitments known; turn-based action/response underway.
    Active,
    /// Invalidated or otherwise ended; no further transitions are permitted.
    Terminated,
}

/// The outcome of successfully validating and appending a peer transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted;

/// The zero-trust protocol engine for one local peer.
#[derive(Debug)]
pub struct Engine<C: CommitmentScheme> {
    identity: Identity,
    self_id: String,
    peer_id: Option<String>,
    phase: Phase,
    self_commit: Option<CommitmentPublic>,
    peer_commit: Option<CommitmentPublic>,
    turn: Option<String>,
    pending_action: Option<PendingAction>,
    invalidated_by: Option<CheatEvidence>,
    scheme: C,
    ledger: Ledger,
    monitor: Monitor,
    enforcement_enabled: bool,
    nonce: u64,
    known_keys: HashMap<String, PublicKey>,
    /// Every `(query, fact)` the peer has revealed so far, keyed by the
    /// query's canonical JSON encoding, so a later contradictory reveal
    /// about the same position can be classified as `CommitmentMismatch`.
    revealed_facts: HashMap<String, serde_json::Value>,
}

impl<C: CommitmentScheme> Engine<C>
where
    C::Query: Serialize + Clone,
    C::Fact: Serialize + Clone,
{
    /// Construct a new engine. The commitment scheme already encapsulates
    /// the hidden witness (see [`CommitmentScheme`]); call
    /// [`Engine::set_self_commitment`] to publish its root and advance to
    /// `COMMITTED`.
    ///
    /// # Errors
    ///
    /// Propagates failure to seal the ledger's genesis block.
    pub fn new(identity: Identity, scheme: C, now: u64, options: &crate::options::EngineOptions) -> Result<Self> {
        let self_id = identity.public_key().participant_id();
        let mut known_keys = HashMap::new();
        known_keys.insert(self_id.clone(), identity.public_key().clone());
        let ledger = Ledger::new(now, options.difficulty_bits, options.clock_skew_tolerance_ms)?;
        Ok(Self {
            identity,
            self_id,
            peer_id: None,
            phase: Phase::Init,
            self_commit: None,
            peer_commit: None,
            turn: None,
            pending_action: None,
            invalidated_by: None,
            scheme,
            ledger,
            monitor: Monitor::new(),
            enforcement_enabled: options.enable_enforcement,
            nonce: 0,
            known_keys,
            revealed_facts: HashMap::new(),
        })
    }

    /// This engine's `participant_id`.
    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Current coarse phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// The participant permitted to append the next action, once `ACTIVE`.
    #[must_use]
    pub fn turn(&self) -> Option<&str> {
        self.turn.as_deref()
    }

    /// The evidence that terminated the protocol, if any.
    #[must_use]
    pub fn invalidated_by(&self) -> Option<&CheatEvidence> {
        self.invalidated_by.as_ref()
    }

    /// Read-only access to the underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Mutable access to the underlying ledger (used by the reconnection
    /// orchestrator, C9, to splice in a verified peer suffix).
    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    /// The peer's `participant_id`, once known.
    #[must_use]
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Every public key this engine currently trusts, keyed by
    /// `participant_id`.
    #[must_use]
    pub fn known_keys(&self) -> &HashMap<String, PublicKey> {
        &self.known_keys
    }

    /// Mutable access to the enforcement monitor's configuration.
    pub fn monitor_mut(&mut self) -> &mut Monitor {
        &mut self.monitor
    }

    /// Terminate the protocol with externally observed cheat evidence (used
    /// by the reconnection orchestrator when a peer's replayed suffix fails
    /// to validate).
    pub fn terminate_with_evidence(
        &mut self,
        kind: CheatKind,
        accused: impl Into<String>,
        witness: impl Serialize,
        now: u64,
    ) -> Error {
        self.invalidate(kind, accused, witness, now)
    }

    fn next_nonce(&mut self) -> u64 {
        self.nonce += 1;
        self.nonce
    }

    fn require_phase(&self, expected: Phase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::Rejected(RejectedReason::PhaseWrong))
        }
    }

    /// Compare `fact` against whatever was previously revealed for `query`,
    /// recording it if this is the first reveal. Returns the witness JSON
    /// for a `CommitmentMismatch` if the peer has contradicted an earlier
    /// reveal about the same position.
    fn check_revealed_fact(&mut self, query: &C::Query, fact: &C::Fact) -> Option<serde_json::Value> {
        let key = serde_json::to_string(query).unwrap_or_default();
        let value = serde_json::to_value(fact).unwrap_or(serde_json::Value::Null);
        if let Some(previous) = self.revealed_facts.get(&key) {
            if *previous != value {
                return Some(serde_json::json!({
                    "query": key,
                    "previously_revealed": previous,
                    "now_revealed": value,
                }));
            }
            return None;
        }
        self.revealed_facts.insert(key, value);
        None
    }

    fn invalidate(&mut self, kind: CheatKind, accused: impl Into<String>, witness: impl Serialize, now: u64) -> Error {
        let evidence = CheatEvidence::new(kind, accused, witness, now);
        warn!(?evidence.kind, accused = %evidence.accused, "protocol invalidated");
        let nonce = self.next_nonce();
        if let Ok(tx) = Transaction::sign(
            &self.identity,
            MoveType::Invalidation,
            serde_json::to_value(&evidence).unwrap_or(serde_json::Value::Null),
            now,
            nonce,
        ) {
            let _ = self.ledger.append(tx);
            let _ = self.ledger.seal(now);
        }
        self.phase = Phase::Terminated;
        self.invalidated_by = Some(evidence.clone());
        Error::Evidence(evidence)
    }

    /// `INIT -> COMMITTED`: publish this engine's commitment root.
    ///
    /// # Errors
    ///
    /// Returns `Rejected(CommitmentAlreadySet)` if already committed, or
    /// `Rejected(PhaseWrong)` if not in `INIT`.
    pub fn set_self_commitment(&mut self, now: u64) -> Result<CommitmentPublic> {
        if self.self_commit.is_some() {
            return Err(Error::Rejected(RejectedReason::CommitmentAlreadySet));
        }
        self.require_phase(Phase::Init)?;

        let public = self.scheme.public();
        let data = serde_json::to_value(&public)?;
        let nonce = self.next_nonce();
        let tx = Transaction::sign(&self.identity, MoveType::Commit, data, now, nonce)?;
        self.ledger.append(tx)?;

        self.self_commit = Some(public.clone());
        self.phase = Phase::Committed;
        info!(self_id = %self.self_id, root = %public.root, "self commitment set");
        Ok(public)
    }

    /// The published commitment, once set.
    #[must_use]
    pub fn get_self_commitment(&self) -> Option<&CommitmentPublic> {
        self.self_commit.as_ref()
    }

    fn peer_public_key(&self, participant_id: &str) -> Result<PublicKey> {
        PublicKey::try_from(participant_id.to_string())
            .map_err(|_| Error::Crypto("participant_id is not a valid public key encoding".into()))
    }

    fn maybe_advance_to_active(&mut self) {
        if self.phase == Phase::Committed && self.self_commit.is_some() && self.peer_commit.is_some() {
            let peer = self.peer_id.clone().expect("peer known once peer_commit is set");
            self.turn = Some(if self.self_id < peer { self.self_id.clone() } else { peer });
            self.phase = Phase::Active;
            info!(turn = ?self.turn, "protocol active");
        }
    }

    /// `COMMITTED -> COMMITTED` (or `-> ACTIVE` once both sides are known):
    /// record the peer's published commitment.
    ///
    /// Verifies the peer's signature on their own COMMIT transaction before
    /// trusting `public`, and appends that transaction to the local ledger
    /// unmodified so it replays identically on both sides.
    ///
    /// # Errors
    ///
    /// Returns `Rejected(CommitmentAlreadySet)` on overwrite attempts, or
    /// `Evidence(ForgedSignature)` if `signed_commit_tx`'s signature does
    /// not verify.
    pub fn set_peer_commitment(
        &mut self,
        public: CommitmentPublic,
        signed_commit_tx: Transaction,
        now: u64,
    ) -> Result<()> {
        if self.peer_commit.is_some() {
            return Err(Error::Rejected(RejectedReason::CommitmentAlreadySet));
        }
        if signed_commit_tx.move_type != MoveType::Commit {
            return Err(Error::Rejected(RejectedReason::PhaseWrong));
        }

        let peer_id = signed_commit_tx.participant_id.clone();
        let peer_key = self.peer_public_key(&peer_id)?;
        if signed_commit_tx.verify_signature(&peer_key).is_err() {
            return Err(self.invalidate(CheatKind::ForgedSignature, peer_id, &signed_commit_tx, now));
        }

        self.known_keys.insert(peer_id.clone(), peer_key);
        self.peer_id = Some(peer_id.clone());
        self.peer_commit = Some(public);
        debug!(peer_id = %peer_id, "peer commitment recorded");

        // Append the peer's own signed transaction verbatim: re-signing it
        // under a local nonce would invalidate the signature, since nonce is
        // covered by signing_bytes().
        let _ = self.ledger.append(signed_commit_tx);

        self.maybe_advance_to_active();
        Ok(())
    }

    /// `ACTIVE -> ACTIVE`: record and sign a local action, provided it is
    /// this engine's turn.
    ///
    /// # Errors
    ///
    /// `Rejected(PhaseWrong)` outside `ACTIVE`; `Rejected(NotYourTurn)` when
    /// `turn != self`.
    pub fn record_self_action(
        &mut self,
        action_id: impl Into<String>,
        action_type: impl Into<String>,
        data: serde_json::Value,
        now: u64,
        timeout_ms: u64,
    ) -> Result<Transaction> {
        self.require_phase(Phase::Active)?;
        if self.turn.as_deref() != Some(self.self_id.as_str()) {
            return Err(Error::Rejected(RejectedReason::NotYourTurn));
        }

        let action_type = action_type.into();
        let mut payload = serde_json::json!({ "type": action_type, "data": data });
        payload["id"] = serde_json::Value::String(action_id.into());

        let nonce = self.next_nonce();
        let tx = Transaction::sign(&self.identity, MoveType::Action, payload, now, nonce)?;
        self.ledger.append(tx.clone())?;

        self.pending_action = Some(PendingAction {
            id: tx.data["id"].as_str().unwrap_or_default().to_string(),
            action_type,
            data: tx.data["data"].clone(),
            started_at: now,
            timeout_ms,
        });
        // Turn-based alternation (Battleship-style): the responder becomes
        // the next actor, so `turn` flips here and stays put through the
        // response.
        self.turn = self.peer_id.clone();
        debug!(nonce, "self action recorded; turn flipped to peer");
        Ok(tx)
    }

    /// `ACTIVE -> ACTIVE`: validate and append a peer action transaction.
    ///
    /// # Errors
    ///
    /// `Rejected(UnknownPeer)`/`Rejected(PhaseWrong)`/`Rejected(DuplicateNonce)`
    /// for protocol misuse; `Evidence(ForgedSignature | DoubleMove |
    /// InvalidMove)` for classified cheats.
    pub fn verify_peer_action(&mut self, tx: Transaction, now: u64) -> Result<Accepted> {
        let peer_id = self.peer_id.clone().ok_or(Error::Rejected(RejectedReason::UnknownPeer))?;
        if tx.participant_id != peer_id {
            return Err(Error::Rejected(RejectedReason::UnknownPeer));
        }
        self.require_phase(Phase::Active)?;

        let peer_key = self
            .known_keys
            .get(&peer_id)
            .cloned()
            .ok_or(Error::Rejected(RejectedReason::UnknownPeer))?;
        if tx.verify_signature(&peer_key).is_err() {
            return Err(self.invalidate(CheatKind::ForgedSignature, peer_id, &tx, now));
        }

        if self.turn.as_deref() != Some(peer_id.as_str()) {
            return Err(self.invalidate(CheatKind::DoubleMove, peer_id, &tx, now));
        }

        if self.enforcement_enabled {
            let action_type = tx.data["type"].as_str().unwrap_or_default();
            if self.monitor.check_action_allowed(&peer_id, action_type, now).is_some() {
                return Err(self.invalidate(CheatKind::InvalidMove, peer_id, &tx, now));
            }
        }

        let action_id = tx.data["id"].as_str().unwrap_or_default().to_string();
        let action_type = tx.data["type"].as_str().unwrap_or_default().to_string();
        let action_data = tx.data["data"].clone();
        self.ledger.append(tx)?;

        self.pending_action = Some(PendingAction {
            id: action_id,
            action_type,
            data: action_data,
            started_at: now,
            timeout_ms: u64::MAX / 2,
        });
        self.turn = Some(self.self_id.clone());
        Ok(Accepted)
    }

    /// `ACTIVE -> ACTIVE`: record and sign a local response, optionally
    /// carrying a Merkle membership proof over this engine's own
    /// commitment.
    pub fn record_self_response(
        &mut self,
        data: serde_json::Value,
        proof: Option<&MerkleProof>,
        now: u64,
    ) -> Result<Transaction> {
        self.require_phase(Phase::Active)?;

        let mut payload = serde_json::json!({ "data": data });
        if let Some(p) = proof {
            payload["proof"] = serde_json::to_value(p)?;
        }

        let nonce = self.next_nonce();
        let tx = Transaction::sign(&self.identity, MoveType::Response, payload, now, nonce)?;
        self.ledger.append(tx.clone())?;
        self.pending_action = None;
        Ok(tx)
    }

    /// `ACTIVE -> ACTIVE`: validate a peer response, checking any attached
    /// proof against the peer's published commitment root and binding the
    /// asserted fact to what the proof's leaf actually reveals.
    ///
    /// # Errors
    ///
    /// `Evidence(ForgedSignature)` on a bad signature; `Evidence(InvalidProof)`
    /// when a proof does not verify against the peer's root or the asserted
    /// fact disagrees with the proof's leaf; `Evidence(CommitmentMismatch)`
    /// when the asserted fact contradicts an earlier reveal for the same
    /// query.
    pub fn verify_peer_response(
        &mut self,
        tx: Transaction,
        query: Option<C::Query>,
        asserted_fact: Option<C::Fact>,
        now: u64,
    ) -> Result<Accepted> {
        let peer_id = self.peer_id.clone().ok_or(Error::Rejected(RejectedReason::UnknownPeer))?;
        if tx.participant_id != peer_id {
            return Err(Error::Rejected(RejectedReason::UnknownPeer));
        }
        self.require_phase(Phase::Active)?;

        let peer_key = self
            .known_keys
            .get(&peer_id)
            .cloned()
            .ok_or(Error::Rejected(RejectedReason::UnknownPeer))?;
        if tx.verify_signature(&peer_key).is_err() {
            return Err(self.invalidate(CheatKind::ForgedSignature, peer_id, &tx, now));
        }

        if let Some(proof_value) = tx.data.get("proof") {
            let proof: MerkleProof = serde_json::from_value(proof_value.clone())?;
            let root = self
                .peer_commit
                .as_ref()
                .ok_or(Error::Rejected(RejectedReason::UnknownPeer))?
                .root;
            let query = query.ok_or(Error::Rejected(RejectedReason::PhaseWrong))?;
            let asserted_fact = asserted_fact.ok_or(Error::Rejected(RejectedReason::PhaseWrong))?;

            if let Some(witness) = self.check_revealed_fact(&query, &asserted_fact) {
                return Err(self.invalidate(CheatKind::CommitmentMismatch, peer_id, witness, now));
            }
            if !C::verify_membership(&root, &query, &asserted_fact, &proof) {
                return Err(self.invalidate(CheatKind::InvalidProof, peer_id, &tx, now));
            }
        }

        self.ledger.append(tx)?;
        self.pending_action = None;
        Ok(Accepted)
    }

    /// Produce a membership proof plus a signed `PROOF` transaction
    /// wrapping it.
    pub fn generate_proof(&mut self, query: C::Query, now: u64) -> Result<(MerkleProof, Transaction)> {
        let proof = self.scheme.prove(query)?;
        let data = serde_json::json!({ "proof": proof });
        let nonce = self.next_nonce();
        let tx = Transaction::sign(&self.identity, MoveType::Proof, data, now, nonce)?;
        self.ledger.append(tx.clone())?;
        Ok((proof, tx))
    }

    /// Verify a standalone peer-generated proof (outside a RESPONSE
    /// transaction) against `peer_root`, binding `asserted_fact` to the
    /// proof's leaf and to any earlier reveal for the same query.
    ///
    /// # Errors
    ///
    /// `Evidence(ForgedSignature)` / `Evidence(InvalidProof)` as above;
    /// `Evidence(CommitmentMismatch)` when `asserted_fact` contradicts an
    /// earlier reveal for `query`.
    pub fn verify_peer_proof(
        &mut self,
        proof: &MerkleProof,
        wrapper: &Transaction,
        peer_root: &Digest,
        query: &C::Query,
        asserted_fact: &C::Fact,
        now: u64,
    ) -> Result<Accepted> {
        let peer_id = self.peer_id.clone().ok_or(Error::Rejected(RejectedReason::UnknownPeer))?;
        let peer_key = self
            .known_keys
            .get(&peer_id)
            .cloned()
            .ok_or(Error::Rejected(RejectedReason::UnknownPeer))?;
        if wrapper.verify_signature(&peer_key).is_err() {
            return Err(self.invalidate(CheatKind::ForgedSignature, peer_id, wrapper, now));
        }
        if let Some(witness) = self.check_revealed_fact(query, asserted_fact) {
            return Err(self.invalidate(CheatKind::CommitmentMismatch, peer_id, witness, now));
        }
        if !C::verify_membership(peer_root, query, asserted_fact, proof) {
            return Err(self.invalidate(CheatKind::InvalidProof, peer_id, wrapper, now));
        }
        Ok(Accepted)
    }

    /// Replay I1-I4 against all known public keys, returning the first
    /// failing block index and reason, if any.
    ///
    /// # Errors
    ///
    /// Propagates canonical-encoding failures from the ledger.
    pub fn verify_ledger(&self) -> Result<Option<(u64, crate::ledger::VerifyFailure)>> {
        self.ledger.verify(&self.known_keys)
    }

    /// Replay the ledger; a failure is classified as `LEDGER_TAMPER`
    /// evidence and terminates the protocol.
    ///
    /// # Errors
    ///
    /// Returns `Evidence(LedgerTamper)` on the first failing invariant.
    pub fn replay(&mut self, now: u64) -> Result<()> {
        if let Some((index, reason)) = self.verify_ledger()? {
            let accused = self.peer_id.clone().unwrap_or_else(|| "unknown".to_string());
            return Err(self.invalidate(
                CheatKind::LedgerTamper,
                accused,
                serde_json::json!({ "index": index, "reason": reason.to_string() }),
                now,
            ));
        }
        Ok(())
    }

    /// Run one enforcement-monitor tick, applying any resulting evidence.
    pub fn monitor_tick(&mut self, now: u64) -> Option<&CheatEvidence> {
        if !self.enforcement_enabled || self.phase == Phase::Terminated {
            return None;
        }
        let Some(peer_id) = self.peer_id.clone() else {
            return None;
        };
        // Only the peer can be stalling: if the pending action is owed by
        // self (about to respond), no timeout applies.
        let owed_by_peer = self.turn.as_deref() == Some(peer_id.as_str());
        let view = MonitorView {
            peer_id: &peer_id,
            pending_action: if owed_by_peer { self.pending_action.as_ref() } else { None },
            now,
        };
        if let Some(evidence) = self.monitor.tick(&view) {
            let kind = evidence.kind;
            let witness = evidence.witness.clone();
            let _ = self.invalidate(kind, peer_id, witness, now);
            return self.invalidated_by.as_ref();
        }
        None
    }

    /// Borrow the commitment scheme (for test/demo code that needs to
    /// inspect the witness directly).
    #[must_use]
    pub fn scheme(&self) -> &C {
        &self.scheme
    }

    /// Capture everything needed to resume this session, short of the
    /// private signing key (see C8).
    ///
    /// Includes not-yet-sealed transactions (`ledger.pending()`) alongside
    /// the sealed block sequence — sealing only happens on invalidation, so
    /// most sessions accumulate pending transactions that a snapshot must
    /// not silently drop.
    #[must_use]
    pub fn snapshot(&self) -> crate::persistence::Snapshot {
        crate::persistence::Snapshot {
            version: crate::persistence::SNAPSHOT_VERSION,
            ledger: self.ledger.blocks().to_vec(),
            pending: self.ledger.pending().to_vec(),
            protocol: crate::persistence::ProtocolSnapshot {
                phase: self.phase,
                peer_id: self.peer_id.clone(),
                self_commit: self.self_commit.clone(),
                peer_commit: self.peer_commit.clone(),
                turn: self.turn.clone(),
                nonce: self.nonce,
                invalidated_by: self.invalidated_by.clone(),
            },
            identity_public: self.self_id.clone(),
        }
    }

    /// Rebuild an engine from a snapshot, re-verifying the ledger before
    /// returning it. `identity` and `scheme` are supplied fresh by the
    /// caller, since neither the private key nor the commitment witness
    /// ever appears in a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `CorruptState` if the snapshot's `identity_public` does not
    /// match `identity`, or if ledger replay (I1-I4) fails.
    pub fn restore(
        identity: Identity,
        scheme: C,
        snapshot: crate::persistence::Snapshot,
        options: &crate::options::EngineOptions,
    ) -> Result<Self> {
        let self_id = identity.public_key().participant_id();
        if self_id != snapshot.identity_public {
            return Err(Error::CorruptState(
                "snapshot identity_public does not match supplied identity".into(),
            ));
        }

        let mut known_keys = HashMap::new();
        known_keys.insert(self_id.clone(), identity.public_key().clone());
        if let Some(peer_id) = &snapshot.protocol.peer_id {
            let peer_key = PublicKey::try_from(peer_id.clone())
                .map_err(|_| Error::CorruptState("snapshot peer_id is not a valid public key".into()))?;
            known_keys.insert(peer_id.clone(), peer_key);
        }

        let mut ledger = Ledger::from_blocks(snapshot.ledger, options.difficulty_bits, options.clock_skew_tolerance_ms);
        for tx in snapshot.pending {
            let key = known_keys
                .get(&tx.participant_id)
                .ok_or_else(|| Error::CorruptState("snapshot pending transaction has unknown participant_id".into()))?;
            tx.verify_signature(key)
                .map_err(|_| Error::CorruptState("snapshot pending transaction has an invalid signature".into()))?;
            ledger.append(tx)?;
        }
        let engine = Self {
            identity,
            self_id,
            peer_id: snapshot.protocol.peer_id,
            phase: snapshot.protocol.phase,
            self_commit: snapshot.protocol.self_commit,
            peer_commit: snapshot.protocol.peer_commit,
            turn: snapshot.protocol.turn,
            pending_action: None,
            invalidated_by: snapshot.protocol.invalidated_by,
            scheme,
            ledger,
            monitor: Monitor::new(),
            enforcement_enabled: options.enable_enforcement,
            nonce: snapshot.protocol.nonce,
            known_keys,
            revealed_facts: HashMap::new(),
        };

        if let Some((index, reason)) = engine.verify_ledger()? {
            return Err(Error::CorruptState(format!(
                "ledger replay failed at block {index}: {reason}"
            )));
        }

        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::{GridCommitment, GridQuery};
    use crate::options::EngineOptions;

    fn make_engine(seed: [u8; 32], marked: &[(u32, u32)]) -> Engine<GridCommitment> {
        let identity = Identity::from_seed(&seed).unwrap();
        let scheme = GridCommitment::new(4, marked.iter().copied().collect(), b"s".to_vec());
        Engine::new(identity, scheme, 1000, &EngineOptions::default()).unwrap()
    }

    fn commit_and_exchange(alice: &mut Engine<GridCommitment>, bob: &mut Engine<GridCommitment>, now: u64) {
        let alice_pub = alice.set_self_commitment(now).unwrap();
        let bob_pub = bob.set_self_commitment(now).unwrap();

        let alice_commit_tx = alice.ledger.pending().first().cloned().expect("alice commit tx pending");
        let bob_commit_tx = bob.ledger.pending().first().cloned().expect("bob commit tx pending");

        bob.set_peer_commitment(alice_pub, alice_commit_tx, now).unwrap();
        alice.set_peer_commitment(bob_pub, bob_commit_tx, now).unwrap();
    }

    #[test]
    fn happy_path_s1_grid_query_and_proof() {
        let mut alice = make_engine([1u8; 32], &[(0, 0), (1, 1)]);
        let mut bob = make_engine([2u8; 32], &[(3, 3)]);
        commit_and_exchange(&mut alice, &mut bob, 1001);

        assert_eq!(alice.phase(), Phase::Active);
        assert_eq!(bob.phase(), Phase::Active);

        let first_turn = alice.turn().unwrap().to_string();
        let (active, other) = if first_turn == alice.self_id() {
            (&mut alice, &mut bob)
        } else {
            (&mut bob, &mut alice)
        };

        let action = active
            .record_self_action("a1", "query", serde_json::json!({"x": 3, "y": 3}), 1002, 5000)
            .unwrap();
        other.verify_peer_action(action, 1003).unwrap();

        let (proof, _wrapper) = other.generate_proof(GridQuery { x: 3, y: 3 }, 1004).unwrap();
        let response = other
            .record_self_response(serde_json::json!({"hit": true}), Some(&proof), 1005)
            .unwrap();
        active
            .verify_peer_response(response, Some(GridQuery { x: 3, y: 3 }), Some(true), 1006)
            .unwrap();

        assert_eq!(active.verify_ledger().unwrap(), None);
        assert_eq!(other.verify_ledger().unwrap(), None);
    }

    #[test]
    fn s2_lying_response_with_valid_proof_is_rejected() {
        // Other's grid has (3,3) unmarked. The proof it generates is
        // genuine (leaf bytes untouched, so it walks correctly to the
        // root) but the response claims a hit anyway — the asserted fact
        // disagrees with what the proof's own leaf reveals.
        let mut alice = make_engine([1u8; 32], &[(0, 0)]);
        let mut bob = make_engine([2u8; 32], &[]);
        commit_and_exchange(&mut alice, &mut bob, 1001);

        let first_turn = alice.turn().unwrap().to_string();
        let (active, other) = if first_turn == alice.self_id() {
            (&mut alice, &mut bob)
        } else {
            (&mut bob, &mut alice)
        };

        let action = active
            .record_self_action("a1", "query", serde_json::json!({"x": 3, "y": 3}), 1002, 5000)
            .unwrap();
        other.verify_peer_action(action, 1003).unwrap();

        let (proof, _wrapper) = other.generate_proof(GridQuery { x: 3, y: 3 }, 1004).unwrap();
        let response = other
            .record_self_response(serde_json::json!({"hit": true}), Some(&proof), 1005)
            .unwrap();
        let err = active
            .verify_peer_response(response, Some(GridQuery { x: 3, y: 3 }), Some(true), 1006)
            .unwrap_err();
        match err {
            Error::Evidence(ref e) => assert_eq!(e.kind, CheatKind::InvalidProof),
            _ => panic!("expected Evidence, got {err:?}"),
        }
        assert_eq!(active.phase(), Phase::Terminated);
    }

    #[test]
    fn contradicting_an_earlier_reveal_is_commitment_mismatch() {
        let mut alice = make_engine([1u8; 32], &[(0, 0)]);
        let mut bob = make_engine([2u8; 32], &[(3, 3)]);
        commit_and_exchange(&mut alice, &mut bob, 1001);

        let first_turn = alice.turn().unwrap().to_string();
        let (active, other) = if first_turn == alice.self_id() {
            (&mut alice, &mut bob)
        } else {
            (&mut bob, &mut alice)
        };

        let action = active
            .record_self_action("a1", "query", serde_json::json!({"x": 3, "y": 3}), 1002, 5000)
            .unwrap();
        other.verify_peer_action(action, 1003).unwrap();
        let (proof, wrapper) = other.generate_proof(GridQuery { x: 3, y: 3 }, 1004).unwrap();
        active
            .verify_peer_proof(&proof, &wrapper, &other.get_self_commitment().unwrap().root, &GridQuery { x: 3, y: 3 }, &true, 1005)
            .unwrap();

        // Same proof, same query, but now asserting the opposite fact —
        // must be caught as a contradiction of the earlier reveal rather
        // than silently re-verified as a fresh (and then valid-looking)
        // proof.
        let err = active
            .verify_peer_proof(&proof, &wrapper, &other.get_self_commitment().unwrap().root, &GridQuery { x: 3, y: 3 }, &false, 1006)
            .unwrap_err();
        match err {
            Error::Evidence(ref e) => assert_eq!(e.kind, CheatKind::CommitmentMismatch),
            _ => panic!("expected Evidence, got {err:?}"),
        }
        assert_eq!(active.phase(), Phase::Terminated);
    }

    #[test]
    fn s2_invalid_proof_terminates_protocol() {
        let mut alice = make_engine([1u8; 32], &[(0, 0)]);
        let mut bob = make_engine([2u8; 32], &[]);
        commit_and_exchange(&mut alice, &mut bob, 1001);

        let first_turn = alice.turn().unwrap().to_string();
        let (active, other) = if first_turn == alice.self_id() {
            (&mut alice, &mut bob)
        } else {
            (&mut bob, &mut alice)
        };

        let action = active
            .record_self_action("a1", "query", serde_json::json!({"x": 3, "y": 3}), 1002, 5000)
            .unwrap();
        other.verify_peer_action(action, 1003).unwrap();

        // Other's grid has (3,3) unmarked; forge a proof claiming marked=true.
        let (mut proof, _wrapper) = other.generate_proof(GridQuery { x: 3, y: 3 }, 1004).unwrap();
        let mut decoded: serde_json::Value = serde_json::from_slice(&proof.leaf_value).unwrap();
        decoded["marked"] = serde_json::Value::Bool(true);
        proof.leaf_value = serde_json::to_vec(&decoded).unwrap();

        let response = other
            .record_self_response(serde_json::json!({"hit": true}), Some(&proof), 1005)
            .unwrap();
        let err = active
            .verify_peer_response(response, Some(GridQuery { x: 3, y: 3 }), Some(true), 1006)
            .unwrap_err();
        match err {
            Error::Evidence(ref e) => assert_eq!(e.kind, CheatKind::InvalidProof),
            _ => panic!("expected Evidence, got {err:?}"),
        }
        assert_eq!(active.phase(), Phase::Terminated);
    }

    #[test]
    fn commitment_already_set_is_rejected() {
        let mut alice = make_engine([1u8; 32], &[]);
        alice.set_self_commitment(1000).unwrap();
        let err = alice.set_self_commitment(1001).unwrap_err();
        assert_eq!(err, Error::Rejected(RejectedReason::CommitmentAlreadySet));
    }

    #[test]
    fn action_off_turn_is_rejected_not_evidence() {
        let mut alice = make_engine([1u8; 32], &[(0, 0)]);
        let mut bob = make_engine([2u8; 32], &[]);
        commit_and_exchange(&mut alice, &mut bob, 1001);

        let first_turn = alice.turn().unwrap().to_string();
        let not_turn = if first_turn == alice.self_id() { &mut bob } else { &mut alice };
        let err = not_turn
            .record_self_action("x", "query", serde_json::json!({}), 1002, 5000)
            .unwrap_err();
        assert_eq!(err, Error::Rejected(RejectedReason::NotYourTurn));
    }

    #[test]
    fn action_before_active_phase_is_rejected() {
        let mut alice = make_engine([1u8; 32], &[]);
        let err = alice
            .record_self_action("x", "query", serde_json::json!({}), 1000, 5000)
            .unwrap_err();
        assert_eq!(err, Error::Rejected(RejectedReason::PhaseWrong));
    }

    #[test]
    fn snapshot_restore_roundtrip_preserves_active_state() {
        let seed = [1u8; 32];
        let mut alice = make_engine(seed, &[(0, 0), (1, 1)]);
        let mut bob = make_engine([2u8; 32], &[(3, 3)]);
        commit_and_exchange(&mut alice, &mut bob, 1001);

        // Commitment exchange already left unsealed transactions behind —
        // these must not be dropped by the snapshot/restore roundtrip.
        assert!(!alice.ledger().pending().is_empty());
        let pending_before = alice.ledger().pending().to_vec();
        let blocks_before = alice.ledger().blocks().to_vec();

        let snapshot = alice.snapshot();
        let identity = Identity::from_seed(&seed).unwrap();
        let scheme = GridCommitment::new(4, [(0, 0), (1, 1)].into_iter().collect(), b"s".to_vec());
        let restored =
            Engine::restore(identity, scheme, snapshot, &EngineOptions::default()).unwrap();

        assert_eq!(restored.phase(), Phase::Active);
        assert_eq!(restored.turn(), alice.turn());
        assert_eq!(restored.self_id(), alice.self_id());
        assert_eq!(restored.ledger().blocks(), blocks_before.as_slice());
        assert_eq!(restored.ledger().pending(), pending_before.as_slice());
    }

    #[test]
    fn restore_rejects_forged_pending_transaction() {
        let mut alice = make_engine([6u8; 32], &[]);
        alice.set_self_commitment(1000).unwrap();
        let mut snapshot = alice.snapshot();

        let attacker = Identity::generate();
        let forged = crate::ledger::Transaction::sign(
            &attacker,
            crate::ledger::MoveType::Action,
            serde_json::json!({"type": "query"}),
            1001,
            99,
        )
        .unwrap();
        snapshot.pending.push(forged);

        let identity = Identity::from_seed(&[6u8; 32]).unwrap();
        let scheme = GridCommitment::new(4, std::collections::BTreeSet::new(), b"s".to_vec());
        let err = Engine::restore(identity, scheme, snapshot, &EngineOptions::default()).unwrap_err();
        assert!(matches!(err, Error::CorruptState(_)));
    }

    #[test]
    fn restore_rejects_mismatched_identity() {
        let mut alice = make_engine([1u8; 32], &[]);
        alice.set_self_commitment(1000).unwrap();
        let snapshot = alice.snapshot();

        let wrong_identity = Identity::from_seed(&[9u8; 32]).unwrap();
        let scheme = GridCommitment::new(4, std::collections::BTreeSet::new(), b"s".to_vec());
        let err = Engine::restore(wrong_identity, scheme, snapshot, &EngineOptions::default()).unwrap_err();
        assert!(matches!(err, Error::CorruptState(_)));
    }
}
