//! Merkle tree (C2): binary Merkle tree over ordered leaves, with inclusion
//! proof generation and verification.
//!
//! Leaf hashing uses a `0x00` domain prefix and internal-node hashing uses a
//! `0x01` prefix, so a leaf digest can never collide with an internal node
//! digest (a standard second-preimage defense). Odd levels duplicate their
//! last node rather than padding with zero, which keeps every level's size
//! even without introducing a distinguishable all-zero leaf.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{sha256, Digest};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Which side of its parent a sibling digest sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Sibling is the left child; the current hash folds in on the right.
    Left,
    /// Sibling is the right child; the current hash folds in on the left.
    Right,
}

/// An inclusion proof for one leaf of a [`MerkleTree`].
///
/// The root it proves membership in is *not* embedded — the verifier
/// supplies it separately (typically from the peer's published
/// `CommitmentPublic.root`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the leaf this proof covers.
    pub leaf_index: u64,
    /// The raw leaf bytes (not the leaf digest) this proof covers.
    pub leaf_value: Vec<u8>,
    /// Sibling digests from the leaf level up to the root, in order.
    pub siblings: Vec<(Digest, Side)>,
}

/// A binary Merkle tree built over ordered, opaque leaf byte-strings.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// One vector of digests per level, level 0 being the leaf digests.
    levels: Vec<Vec<Digest>>,
    leaf_count: usize,
}

fn hash_leaf(value: &[u8]) -> Digest {
    let mut bytes = Vec::with_capacity(value.len() + 1);
    bytes.push(LEAF_PREFIX);
    bytes.extend_from_slice(value);
    sha256(&bytes)
}

fn hash_node(left: &Digest, right: &Digest) -> Digest {
    let mut bytes = Vec::with_capacity(65);
    bytes.push(NODE_PREFIX);
    bytes.extend_from_slice(left.as_bytes());
    bytes.extend_from_slice(right.as_bytes());
    sha256(&bytes)
}

impl MerkleTree {
    /// Build a tree over ordered leaves.
    ///
    /// An empty leaf set produces a tree whose root is `sha256("")`; such a
    /// tree permits no proof construction.
    #[must_use]
    pub fn build(leaves: &[Vec<u8>]) -> Self {
        if leaves.is_empty() {
            return Self {
                levels: vec![vec![sha256(b"")]],
                leaf_count: 0,
            };
        }

        let mut level: Vec<Digest> = leaves.iter().map(|l| hash_leaf(l)).collect();
        let mut levels = vec![level.clone()];

        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().unwrap());
            }
            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                next.push(hash_node(&pair[0], &pair[1]));
            }
            levels.push(next.clone());
            level = next;
        }

        Self {
            levels,
            leaf_count: leaves.len(),
        }
    }

    /// The Merkle root.
    #[must_use]
    pub fn root(&self) -> Digest {
        *self.levels.last().unwrap().last().unwrap()
    }

    /// Number of leaves the tree was built from.
    #[must_use]
    pub const fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Construct an inclusion proof for the leaf at `idx`.
    ///
    /// # Errors
    ///
    /// Returns an error if `idx >= leaf_count()`.
    pub fn prove(&self, idx: usize, leaf_value: &[u8]) -> Result<MerkleProof> {
        if self.leaf_count == 0 || idx >= self.leaf_count {
            return Err(Error::Crypto(format!(
                "leaf index {idx} out of range for {} leaves",
                self.leaf_count
            )));
        }

        let mut siblings = Vec::new();
        let mut index = idx;
        // Walk every level except the root, mirroring how build() padded an
        // odd-sized level by duplicating the last node.
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if index.is_multiple_of(2) { index + 1 } else { index - 1 };
            let sibling = if sibling_index < level.len() {
                level[sibling_index]
            } else {
                // Odd level: the duplicated last node is the sibling.
                level[level.len() - 1]
            };
            let side = if index.is_multiple_of(2) { Side::Right } else { Side::Left };
            siblings.push((sibling, side));
            index /= 2;
        }

        Ok(MerkleProof {
            leaf_index: idx as u64,
            leaf_value: leaf_value.to_vec(),
            siblings,
        })
    }
}

/// Check that a proof's sibling path is consistent with its claimed
/// `leaf_index`, without hashing anything.
///
/// Each `Side` already records which child the path took at that level —
/// `Right` means the current node was the left (even-indexed) child,
/// `Left` means it was the right (odd-indexed) one — so the leaf index can
/// be reconstructed bit-by-bit from the side sequence alone. A proof whose
/// sibling count is too short to express `leaf_index`, or whose sides
/// decode to a different index entirely, is rejected here before any
/// hashing is attempted.
fn structurally_consistent(proof: &MerkleProof) -> bool {
    if proof.siblings.is_empty() {
        return proof.leaf_index == 0;
    }
    if proof.siblings.len() >= 64 {
        return false;
    }
    let mut reconstructed: u64 = 0;
    for (depth, (_, side)) in proof.siblings.iter().enumerate() {
        let bit = match side {
            Side::Left => 1u64,
            Side::Right => 0u64,
        };
        reconstructed |= bit << depth;
    }
    reconstructed == proof.leaf_index
}

/// Verify a [`MerkleProof`] against an externally-supplied root.
///
/// First rejects a structurally inconsistent sibling path (see
/// [`structurally_consistent`]), then recomputes the leaf digest from
/// `proof.leaf_value`, folds in each sibling using its recorded side, and
/// compares the result to `root`.
#[must_use]
pub fn verify_membership(root: &Digest, proof: &MerkleProof) -> bool {
    if !structurally_consistent(proof) {
        return false;
    }
    let mut current = hash_leaf(&proof.leaf_value);
    for (sibling, side) in &proof.siblings {
        current = match side {
            Side::Left => hash_node(sibling, &current),
            Side::Right => hash_node(&current, sibling),
        };
    }
    current == *root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("leaf-{i}").into_bytes()).collect()
    }

    #[test]
    fn empty_tree_root_is_hash_of_empty_string() {
        let tree = MerkleTree::build(&[]);
        assert_eq!(tree.root(), sha256(b""));
    }

    #[test]
    fn empty_tree_rejects_proof() {
        let tree = MerkleTree::build(&[]);
        assert!(tree.prove(0, b"x").is_err());
    }

    #[test]
    fn single_leaf_proof_round_trips() {
        let tree = MerkleTree::build(&leaves(1));
        let proof = tree.prove(0, &leaves(1)[0]).unwrap();
        assert!(verify_membership(&tree.root(), &proof));
    }

    #[test]
    fn every_leaf_proves_membership_in_odd_and_even_sized_trees() {
        for n in [1, 2, 3, 4, 5, 7, 8, 16, 17] {
            let ls = leaves(n);
            let tree = MerkleTree::build(&ls);
            for (i, leaf) in ls.iter().enumerate() {
                let proof = tree.prove(i, leaf).unwrap();
                assert!(
                    verify_membership(&tree.root(), &proof),
                    "leaf {i} of {n} failed to verify"
                );
            }
        }
    }

    #[test]
    fn substituting_another_leafs_fact_fails_verification() {
        let ls = leaves(5);
        let tree = MerkleTree::build(&ls);
        let mut proof = tree.prove(0, &ls[0]).unwrap();
        proof.leaf_value = ls[1].clone();
        assert!(!verify_membership(&tree.root(), &proof));
    }

    #[test]
    fn out_of_range_index_fails() {
        let tree = MerkleTree::build(&leaves(4));
        assert!(tree.prove(4, b"x").is_err());
    }

    #[test]
    fn wrong_root_fails_verification() {
        let ls = leaves(4);
        let tree = MerkleTree::build(&ls);
        let proof = tree.prove(0, &ls[0]).unwrap();
        let other_root = sha256(b"not the root");
        assert!(!verify_membership(&other_root, &proof));
    }

    #[test]
    fn truncated_sibling_path_is_rejected_without_hashing() {
        let ls = leaves(8);
        let tree = MerkleTree::build(&ls);
        let mut proof = tree.prove(5, &ls[5]).unwrap();
        proof.siblings.pop();
        assert!(!verify_membership(&tree.root(), &proof));
    }

    #[test]
    fn sides_inconsistent_with_leaf_index_are_rejected() {
        let ls = leaves(8);
        let tree = MerkleTree::build(&ls);
        let mut proof = tree.prove(5, &ls[5]).unwrap();
        proof.leaf_index = 2;
        assert!(!verify_membership(&tree.root(), &proof));
    }

    #[test]
    fn leaf_and_node_hashing_use_distinct_domains() {
        // A single leaf's digest must not equal hash_node of two empty inputs
        // under a matching prefix scheme, demonstrating prefix separation.
        let leaf_digest = hash_leaf(b"");
        let node_digest = hash_node(&sha256(b""), &sha256(b""));
        assert_ne!(leaf_digest, node_digest);
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Every leaf of an arbitrarily-sized tree proves membership at its
        /// own index and nowhere else.
        #[test]
        fn every_leaf_proves_membership_and_only_its_own(
            leaves in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 1..40),
        ) {
            let tree = MerkleTree::build(&leaves);
            let root = tree.root();
            for (i, leaf) in leaves.iter().enumerate() {
                let proof = tree.prove(i, leaf).unwrap();
                prop_assert!(verify_membership(&root, &proof));

                if leaves.len() > 1 {
                    let wrong = &leaves[(i + 1) % leaves.len()];
                    if wrong != leaf {
                        let mut forged = proof.clone();
                        forged.leaf_value = wrong.clone();
                        prop_assert!(!verify_membership(&root, &forged));
                    }
                }
            }
        }
    }
}
