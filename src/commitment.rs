//! Commitment interface (C3): an abstract surface for binding a party to a
//! hidden witness, plus a reference grid-membership implementation.
//!
//! Spec note (open question, resolved): the grid scheme incorporates `seed`
//! into every leaf's bytes, so a verifier who lacks the seed cannot
//! reconstruct leaf bytes independently. This is why [`MerkleProof`] ships
//! `leaf_value` — do not be tempted to "optimize" that field away.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::Digest;
use crate::merkle::{self, MerkleProof, MerkleTree};

/// The public, wire-safe half of a commitment: a root digest plus scheme
/// metadata. Never carries the private witness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentPublic {
    /// Merkle root (or equivalent) binding the hidden witness.
    pub root: Digest,
    /// Identifies which commitment scheme produced this root.
    pub scheme_tag: String,
    /// Scheme-specific public parameters (e.g. `grid_size`).
    pub params: std::collections::BTreeMap<String, serde_json::Value>,
}

/// The abstract commitment-scheme surface every concrete scheme implements.
///
/// Implementations are responsible for:
/// - **hiding**: the root must be pseudorandom in the witness under a fresh
///   per-session seed;
/// - **binding**: two distinct witnesses yielding the same root must be
///   computationally infeasible;
/// - **determinism**: the same witness and seed always yield the same root.
pub trait CommitmentScheme {
    /// The scheme-specific query type passed to [`CommitmentScheme::prove`].
    type Query;
    /// The scheme-specific truth value a response or proof reveals about
    /// `Query` (e.g. "is this cell marked?").
    type Fact;

    /// The committed root.
    fn commit_root(&self) -> Digest;

    /// Produce a membership proof for `query`.
    fn prove(&self, query: Self::Query) -> Result<MerkleProof>;

    /// Verify a membership proof against an externally supplied root *and*
    /// bind `asserted_fact` to what the proof's leaf actually reveals.
    ///
    /// A proof that walks correctly to `root` but whose leaf contradicts
    /// `asserted_fact` must be rejected here — accepting it is exactly the
    /// valid-proof-but-lying-response cheat this trait exists to prevent.
    fn verify_membership(root: &Digest, query: &Self::Query, asserted_fact: &Self::Fact, proof: &MerkleProof) -> bool;

    /// The scheme's wire identifier.
    fn scheme_tag(&self) -> &'static str;

    /// The public half of this commitment, suitable for transmission.
    fn public(&self) -> CommitmentPublic;
}

/// A single reference-scheme query: "is the cell at `(x, y)` marked?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridQuery {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GridLeaf {
    x: u32,
    y: u32,
    marked: bool,
    seed: String,
}

/// Reference grid-membership commitment.
///
/// Enumerates every cell of a `grid_size` x `grid_size` grid in row-major
/// order; each leaf encodes `(x, y, marked, seed)`. The seed is private and
/// is folded into every leaf so the committed root is pseudorandom in the
/// marked-position witness.
#[derive(Debug, Clone)]
pub struct GridCommitment {
    grid_size: u32,
    marked_positions: BTreeSet<(u32, u32)>,
    seed: Vec<u8>,
    tree: MerkleTree,
}

impl GridCommitment {
    /// Build a grid commitment over `grid_size x grid_size` cells.
    #[must_use]
    pub fn new(grid_size: u32, marked_positions: BTreeSet<(u32, u32)>, seed: Vec<u8>) -> Self {
        let seed_hex = hex::encode(&seed);
        let mut leaves = Vec::with_capacity((grid_size * grid_size) as usize);
        for y in 0..grid_size {
            for x in 0..grid_size {
                let leaf = GridLeaf {
                    x,
                    y,
                    marked: marked_positions.contains(&(x, y)),
                    seed: seed_hex.clone(),
                };
                leaves.push(serde_json::to_vec(&leaf).expect("grid leaf always serializes"));
            }
        }
        let tree = MerkleTree::build(&leaves);
        Self {
            grid_size,
            marked_positions,
            seed,
            tree,
        }
    }

    fn leaf_index(&self, query: &GridQuery) -> usize {
        (query.y * self.grid_size + query.x) as usize
    }

    /// The grid's side length.
    #[must_use]
    pub const fn grid_size(&self) -> u32 {
        self.grid_size
    }
}

impl CommitmentScheme for GridCommitment {
    type Query = GridQuery;
    /// Whether the queried cell is marked.
    type Fact = bool;

    fn commit_root(&self) -> Digest {
        self.tree.root()
    }

    fn prove(&self, query: GridQuery) -> Result<MerkleProof> {
        let idx = self.leaf_index(&query);
        let leaf = GridLeaf {
            x: query.x,
            y: query.y,
            marked: self.marked_positions.contains(&(query.x, query.y)),
            seed: hex::encode(&self.seed),
        };
        let leaf_bytes = serde_json::to_vec(&leaf)?;
        self.tree.prove(idx, &leaf_bytes)
    }

    fn verify_membership(root: &Digest, query: &GridQuery, asserted_fact: &bool, proof: &MerkleProof) -> bool {
        // The seed is private: the verifier cannot reconstruct leaf bytes
        // and must instead trust proof.leaf_value, binding the revealed
        // (x, y, marked) to both the query and the claimed fact.
        revealed_fact_matches_proof(query.x, query.y, *asserted_fact, proof) && merkle::verify_membership(root, proof)
    }

    fn scheme_tag(&self) -> &'static str {
        "grid-membership-v1"
    }

    fn public(&self) -> CommitmentPublic {
        let mut params = std::collections::BTreeMap::new();
        params.insert(
            "grid_size".to_string(),
            serde_json::Value::from(self.grid_size),
        );
        CommitmentPublic {
            root: self.commit_root(),
            scheme_tag: self.scheme_tag().to_string(),
            params,
        }
    }
}

/// Assert that the `(x, y, marked)` triple revealed by a response equals the
/// fields decoded from `proof.leaf_value` — the binding check the protocol
/// layer performs before trusting a revealed fact.
#[must_use]
pub fn revealed_fact_matches_proof(x: u32, y: u32, marked: bool, proof: &MerkleProof) -> bool {
    let Ok(decoded): std::result::Result<serde_json::Value, _> =
        serde_json::from_slice(&proof.leaf_value)
    else {
        return false;
    };
    decoded.get("x").and_then(serde_json::Value::as_u64) == Some(u64::from(x))
        && decoded.get("y").and_then(serde_json::Value::as_u64) == Some(u64::from(y))
        && decoded.get("marked").and_then(serde_json::Value::as_bool) == Some(marked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(marked: &[(u32, u32)]) -> GridCommitment {
        GridCommitment::new(4, marked.iter().copied().collect(), b"a-seed".to_vec())
    }

    #[test]
    fn commit_root_is_deterministic() {
        let a = grid(&[(0, 0), (1, 1)]);
        let b = grid(&[(0, 0), (1, 1)]);
        assert_eq!(a.commit_root(), b.commit_root());
    }

    #[test]
    fn distinct_witnesses_yield_distinct_roots() {
        let mut seen = std::collections::HashSet::new();
        for x in 0..4 {
            for y in 0..4 {
                let g = grid(&[(x, y)]);
                assert!(seen.insert(g.commit_root()), "collision at ({x},{y})");
            }
        }
    }

    #[test]
    fn prove_and_verify_marked_cell() {
        let g = grid(&[(3, 3)]);
        let proof = g.prove(GridQuery { x: 3, y: 3 }).unwrap();
        assert!(GridCommitment::verify_membership(
            &g.commit_root(),
            &GridQuery { x: 3, y: 3 },
            &true,
            &proof
        ));
        assert!(revealed_fact_matches_proof(3, 3, true, &proof));
    }

    #[test]
    fn prove_and_verify_unmarked_cell() {
        let g = grid(&[(3, 3)]);
        let proof = g.prove(GridQuery { x: 0, y: 0 }).unwrap();
        assert!(GridCommitment::verify_membership(
            &g.commit_root(),
            &GridQuery { x: 0, y: 0 },
            &false,
            &proof
        ));
        assert!(revealed_fact_matches_proof(0, 0, false, &proof));
        assert!(!revealed_fact_matches_proof(0, 0, true, &proof));
    }

    #[test]
    fn substituting_wrong_query_into_proof_is_rejected() {
        let g = grid(&[(3, 3)]);
        let proof = g.prove(GridQuery { x: 3, y: 3 }).unwrap();
        // Proof is for (3,3); claiming it proves (0,0) must fail.
        assert!(!GridCommitment::verify_membership(
            &g.commit_root(),
            &GridQuery { x: 0, y: 0 },
            &true,
            &proof
        ));
    }

    #[test]
    fn claiming_a_valid_proofs_cell_is_unmarked_when_it_is_marked_is_rejected() {
        // A structurally valid proof for a marked cell, paired with a lying
        // asserted fact, must not verify — this is the cheat the asserted
        // fact binding exists to catch.
        let g = grid(&[(3, 3)]);
        let proof = g.prove(GridQuery { x: 3, y: 3 }).unwrap();
        assert!(!GridCommitment::verify_membership(
            &g.commit_root(),
            &GridQuery { x: 3, y: 3 },
            &false,
            &proof
        ));
    }

    #[test]
    fn public_commitment_carries_no_witness() {
        let g = grid(&[(1, 2)]);
        let public = g.public();
        let json = serde_json::to_string(&public).unwrap();
        assert!(!json.contains("a-seed"));
        assert!(json.contains("grid_size"));
        assert!(json.contains("scheme_tag"));
    }
}
