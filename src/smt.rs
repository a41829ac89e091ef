//! Sparse Merkle tree over 32-byte keys.
//!
//! The tree has `DEPTH` levels; a key's bits, most significant first, select
//! the path from the root. Absent subtrees hash to precomputed defaults, so
//! only the nodes on populated paths are kept in memory.
//!
//! Hashing:
//! * empty leaf: 32 zero bytes; a zero value is the same as no leaf
//! * leaf:       `H(0x00 || key || value)`
//! * inner node: `H(0x01 || left || right)`
//!
//! Proof siblings run leaf-to-root, one per level.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::crypto::{hex_hash, hex_hashes, Hash};

pub const DEPTH: usize = 256;
const ZERO: Hash = [0u8; 32];
const NODE_CONTEXT: &str = "veiled-ledger smt";

/// Default hash of an empty subtree at each height (0 = leaf level).
static EMPTY: Lazy<Vec<Hash>> = Lazy::new(|| {
    let mut levels = Vec::with_capacity(DEPTH + 1);
    levels.push(ZERO);
    for h in 0..DEPTH {
        levels.push(node_hash(&levels[h], &levels[h]));
    }
    levels
});

pub fn empty_root() -> Hash {
    EMPTY[DEPTH]
}

fn leaf_hash(key: &Hash, value: &Hash) -> Hash {
    if *value == ZERO {
        return ZERO;
    }
    let mut hasher = blake3::Hasher::new_derive_key(NODE_CONTEXT);
    hasher.update(&[0x00]);
    hasher.update(key);
    hasher.update(value);
    *hasher.finalize().as_bytes()
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(NODE_CONTEXT);
    hasher.update(&[0x01]);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

fn bit(key: &Hash, index: usize) -> u8 {
    (key[index / 8] >> (7 - index % 8)) & 1
}

/// `key` with every bit at position `depth` and beyond cleared.
fn path_prefix(key: &Hash, depth: usize) -> Hash {
    let mut out = ZERO;
    let full = depth / 8;
    out[..full].copy_from_slice(&key[..full]);
    if depth % 8 != 0 {
        let mask = 0xFFu8 << (8 - depth % 8);
        out[full] = key[full] & mask;
    }
    out
}

/// Sibling of the node at `height` on `key`'s path.
fn sibling_prefix(key: &Hash, height: usize) -> Hash {
    let depth = DEPTH - height;
    let mut out = path_prefix(key, depth);
    let index = depth - 1;
    out[index / 8] ^= 1 << (7 - index % 8);
    out
}

/// Inclusion (or, with a zero value, exclusion) proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    #[serde(with = "hex_hash")]
    pub root: Hash,
    #[serde(with = "hex_hashes")]
    pub siblings: Vec<Hash>,
    #[serde(with = "hex_hash")]
    pub key: Hash,
    #[serde(with = "hex_hash")]
    pub value: Hash,
}

impl MerkleProof {
    /// Recompute the root from `(key, value, siblings)` and compare.
    pub fn verify(&self) -> bool {
        compute_root(&self.key, &self.value, &self.siblings).map_or(false, |r| r == self.root)
    }
}

/// Fold a leaf up through its siblings. `None` if the sibling count is wrong.
pub fn compute_root(key: &Hash, value: &Hash, siblings: &[Hash]) -> Option<Hash> {
    if siblings.len() != DEPTH {
        return None;
    }
    let mut current = leaf_hash(key, value);
    for (height, sibling) in siblings.iter().enumerate() {
        current = if bit(key, DEPTH - 1 - height) == 0 {
            node_hash(&current, sibling)
        } else {
            node_hash(sibling, &current)
        };
    }
    Some(current)
}

#[derive(Debug, Clone, Default)]
pub struct SparseMerkleTree {
    leaves: HashMap<Hash, Hash>,
    nodes: HashMap<(u16, Hash), Hash>,
}

impl SparseMerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Hash {
        self.node(DEPTH, &ZERO)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// The stored value, zero when the key is absent.
    pub fn get(&self, key: &Hash) -> Hash {
        self.leaves.get(key).copied().unwrap_or(ZERO)
    }

    fn node(&self, height: usize, prefix: &Hash) -> Hash {
        self.nodes.get(&(height as u16, *prefix)).copied().unwrap_or(EMPTY[height])
    }

    fn store_node(&mut self, height: usize, prefix: Hash, hash: Hash) {
        if hash == EMPTY[height] {
            self.nodes.remove(&(height as u16, prefix));
        } else {
            self.nodes.insert((height as u16, prefix), hash);
        }
    }

    /// Insert or overwrite `key`; a zero `value` removes it. Returns the new root.
    pub fn update(&mut self, key: Hash, value: Hash) -> Hash {
        if value == ZERO {
            self.leaves.remove(&key);
        } else {
            self.leaves.insert(key, value);
        }

        let mut current = leaf_hash(&key, &value);
        for height in 0..DEPTH {
            self.store_node(height, path_prefix(&key, DEPTH - height), current);
            let sibling = self.node(height, &sibling_prefix(&key, height));
            current = if bit(&key, DEPTH - 1 - height) == 0 {
                node_hash(&current, &sibling)
            } else {
                node_hash(&sibling, &current)
            };
        }
        self.store_node(DEPTH, ZERO, current);
        current
    }

    pub fn proof(&self, key: &Hash) -> MerkleProof {
        let siblings = (0..DEPTH)
            .map(|height| self.node(height, &sibling_prefix(key, height)))
            .collect();
        MerkleProof { root: self.root(), siblings, key: *key, value: self.get(key) }
    }
}
