//! Fixed-depth Merkle tree for block commitments
//!
//! # Design
//!
//! - Binary tree of depth 16 (65,536 leaves) with Keccak-256 hashing
//! - Unused leaf slots hold `keccak256("")`, so a partially filled block
//!   commits to a root that does not depend on its transaction count
//! - Proofs always carry one sibling per level; the leaf index decides
//!   whether a sibling goes on the left or on the right

use crate::crypto::{keccak, keccak_concat};
use crate::{Error, Result};
use ethers::types::H256;
use serde::{Deserialize, Serialize};

/// Depth of every block tree
pub const TREE_DEPTH: usize = 16;

/// Hash a pair of nodes
fn hash_pair(left: &H256, right: &H256) -> H256 {
    keccak_concat(&[left.as_bytes(), right.as_bytes()])
}

/// Merkle proof (path from leaf to root)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Root the proof recombines to
    pub root: H256,
    /// Leaf being proven
    pub leaf: H256,
    /// Leaf position in the tree
    pub index: u64,
    /// Sibling hashes from the leaf level upward
    pub proof: Vec<H256>,
}

impl MerkleProof {
    /// Recompute the root from the leaf and its siblings
    pub fn compute_root(&self) -> H256 {
        let mut current = self.leaf;
        let mut index = self.index;
        for sibling in &self.proof {
            current = if index & 1 == 0 {
                hash_pair(&current, sibling)
            } else {
                hash_pair(sibling, &current)
            };
            index >>= 1;
        }
        current
    }

    /// Verify the proof against its root
    pub fn verify(&self) -> bool {
        self.compute_root() == self.root
    }

    /// Siblings concatenated, the layout the root chain contract expects
    pub fn proof_bytes(&self) -> Vec<u8> {
        self.proof
            .iter()
            .flat_map(|sibling| sibling.as_bytes().iter().copied())
            .collect()
    }
}

/// Merkle tree over a block's transaction leaves
#[derive(Debug, Clone)]
pub struct FixedMerkleTree {
    depth: usize,
    /// `layers[0]` holds the populated leaves, `layers[depth]` the root
    layers: Vec<Vec<H256>>,
    /// Root of an all-empty subtree at each level
    zero_hashes: Vec<H256>,
}

impl FixedMerkleTree {
    /// Build a tree of `depth` levels over `leaves`
    pub fn new(depth: usize, leaves: Vec<H256>) -> Result<Self> {
        let capacity = 1usize
            .checked_shl(depth as u32)
            .ok_or_else(|| Error::Other(format!("Merkle depth {} too large", depth)))?;
        if leaves.len() > capacity {
            return Err(Error::Other(format!(
                "{} leaves exceed tree capacity {}",
                leaves.len(),
                capacity
            )));
        }

        let mut zero_hashes = Vec::with_capacity(depth + 1);
        zero_hashes.push(keccak(&[]));
        for level in 0..depth {
            let zero = zero_hashes[level];
            zero_hashes.push(hash_pair(&zero, &zero));
        }

        let mut layers = Vec::with_capacity(depth + 1);
        layers.push(leaves);
        for level in 0..depth {
            let current = &layers[level];
            let next: Vec<H256> = current
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&zero_hashes[level]);
                    hash_pair(&pair[0], right)
                })
                .collect();
            layers.push(next);
        }

        Ok(Self {
            depth,
            layers,
            zero_hashes,
        })
    }

    /// Build a depth-16 tree
    pub fn from_leaves(leaves: Vec<H256>) -> Result<Self> {
        Self::new(TREE_DEPTH, leaves)
    }

    /// Root hash
    pub fn root(&self) -> H256 {
        self.layers[self.depth]
            .first()
            .copied()
            .unwrap_or(self.zero_hashes[self.depth])
    }

    /// Number of populated leaves
    pub fn len(&self) -> usize {
        self.layers[0].len()
    }

    /// True if no leaf is populated
    pub fn is_empty(&self) -> bool {
        self.layers[0].is_empty()
    }

    /// Index of a leaf value
    pub fn position(&self, leaf: &H256) -> Option<usize> {
        self.layers[0].iter().position(|candidate| candidate == leaf)
    }

    /// Proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaf = *self.layers[0].get(index)?;
        let mut proof = Vec::with_capacity(self.depth);
        let mut position = index;
        for level in 0..self.depth {
            let sibling = self.layers[level]
                .get(position ^ 1)
                .copied()
                .unwrap_or(self.zero_hashes[level]);
            proof.push(sibling);
            position >>= 1;
        }
        Some(MerkleProof {
            root: self.root(),
            leaf,
            index: index as u64,
            proof,
        })
    }

    /// Proof for a leaf looked up by value
    pub fn proof_for_leaf(&self, leaf: &H256) -> Option<MerkleProof> {
        self.proof(self.position(leaf)?)
    }
}
