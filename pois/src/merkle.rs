//! SHA-256 Merkle tree over the labels of one idle file.
//!
//! - Leaves are SHA-256 hashes of labels
//! - Internal nodes hash the concatenation of their children
//! - Openings carry the label itself so the verifier can also check how it was derived

use crate::hash::{Digest, sha256_concat};
use crate::types::MhtProof;
use crate::{PoisError, Result};

/// Position marker for a node that is the left child of its parent.
pub const LOC_LEFT: u8 = 0;
/// Position marker for a node that is the right child of its parent.
pub const LOC_RIGHT: u8 = 1;

/// A binary Merkle tree over idle file labels.
///
/// The tree is stored as a flat array where:
/// - Leaves occupy indices [leaf_count..2*leaf_count)
/// - Internal nodes occupy indices [1..leaf_count)
/// - Index 0 is unused (for 1-indexed arithmetic)
#[derive(Clone, Debug)]
pub struct MerkleTree {
    nodes: Vec<Digest>,
    /// Always a power of 2
    leaf_count: usize,
    original_count: usize,
}

impl MerkleTree {
    /// Build a tree from labels, padding the leaf count to the next power of 2.
    pub fn from_labels<L: AsRef<[u8]>>(labels: &[L]) -> Result<Self> {
        if labels.is_empty() {
            return Err(PoisError::EmptyData);
        }

        let original_count = labels.len();
        let leaf_count = original_count.next_power_of_two();
        let mut nodes = vec![[0u8; 32]; 2 * leaf_count];

        for (i, label) in labels.iter().enumerate() {
            nodes[leaf_count + i] = leaf_hash(label.as_ref());
        }
        let padding = leaf_hash(b"");
        for node in nodes.iter_mut().skip(leaf_count + original_count) {
            *node = padding;
        }

        for i in (1..leaf_count).rev() {
            nodes[i] = sha256_concat(&[&nodes[2 * i], &nodes[2 * i + 1]]);
        }

        Ok(Self {
            nodes,
            leaf_count,
            original_count,
        })
    }

    pub fn root(&self) -> Digest {
        self.nodes[1]
    }

    pub fn chunk_count(&self) -> usize {
        self.original_count
    }

    /// Number of levels from leaf to root.
    pub fn depth(&self) -> usize {
        self.leaf_count.trailing_zeros() as usize
    }

    /// Open leaf `index`, which must hold `label`.
    pub fn proof(&self, index: usize, label: &[u8]) -> Result<MhtProof> {
        if index >= self.original_count {
            return Err(PoisError::ChunkIndexOutOfBounds {
                index: index as i64,
                max: self.original_count as i64 - 1,
            });
        }
        if self.nodes[self.leaf_count + index] != leaf_hash(label) {
            return Err(PoisError::MerkleTreeError(format!(
                "label does not match leaf {index}"
            )));
        }

        let mut paths = Vec::with_capacity(self.depth());
        let mut locs = Vec::with_capacity(self.depth());
        let mut node_index = self.leaf_count + index;

        while node_index > 1 {
            // XOR with 1 flips the last bit: even->odd (right sibling), odd->even (left sibling)
            paths.push(self.nodes[node_index ^ 1].to_vec());
            locs.push(if node_index % 2 == 0 { LOC_LEFT } else { LOC_RIGHT });
            node_index /= 2;
        }

        Ok(MhtProof {
            index: index as u32,
            label: label.to_vec(),
            paths,
            locs,
        })
    }

    /// Check an opening against a root.
    ///
    /// The position markers must agree with the claimed leaf index, otherwise
    /// a valid path for one leaf could be replayed for another.
    pub fn verify_proof_against_root(proof: &MhtProof, expected_root: &[u8]) -> bool {
        if proof.paths.len() != proof.locs.len() || proof.paths.len() >= 32 {
            return false;
        }
        if (proof.index as u64) >> proof.paths.len() != 0 {
            return false;
        }

        let mut current = leaf_hash(&proof.label);
        for (level, (sibling, loc)) in proof.paths.iter().zip(&proof.locs).enumerate() {
            let expected_loc = ((proof.index >> level) & 1) as u8;
            if *loc != expected_loc {
                return false;
            }
            current = match *loc {
                LOC_LEFT => sha256_concat(&[&current, sibling]),
                LOC_RIGHT => sha256_concat(&[sibling, &current]),
                _ => return false,
            };
        }

        current.as_slice() == expected_root
    }
}

fn leaf_hash(label: &[u8]) -> Digest {
    sha256_concat(&[label])
}
