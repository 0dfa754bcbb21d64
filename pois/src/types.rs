//! Proof messages exchanged with TEE verifiers.

use serde::{Deserialize, Serialize};

use crate::acc::AccWitnessNode;
use crate::hash::{Digest, sha256_concat};
use crate::Result;

/// Merkle opening of one idle file label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MhtProof {
    /// Chunk index within the file
    pub index: u32,
    pub label: Vec<u8>,
    /// Sibling hashes from leaf to root
    pub paths: Vec<Vec<u8>>,
    /// Position of the current node at each level (0 left, 1 right)
    pub locs: Vec<u8>,
}

/// Opening of a challenged label together with the labels it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitProof {
    pub node: MhtProof,
    pub parents: Vec<MhtProof>,
    pub elders: Vec<MhtProof>,
}

/// Proof that a commit batch folds into the accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccProof {
    pub indexs: Vec<i64>,
    /// Accumulator elements of the committed files
    pub elements: Vec<Vec<u8>>,
    /// Chain from the new level-0 accumulator to the new top
    pub wit_chain: AccWitnessNode,
    /// `[old_top, new_top]`
    pub acc_path: Vec<Vec<u8>>,
}

/// A batch of generated idle files awaiting commitment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleCommit {
    pub file_indexs: Vec<i64>,
    pub roots: Vec<Vec<u8>>,
}

impl IdleCommit {
    pub fn len(&self) -> usize {
        self.file_indexs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_indexs.is_empty()
    }
}

/// Space proof of the idle files `[left, right)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceProof {
    pub left: i64,
    pub right: i64,
    /// Merkle root of each file
    pub roots: Vec<Vec<u8>>,
    /// Per file, one opening per challenge seed
    pub proofs: Vec<Vec<MhtProof>>,
    /// Per file, witness chain of its element against the challenged accumulator
    pub wit_chains: Vec<AccWitnessNode>,
}

/// Proof that the oldest elements were removed from the accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionProof {
    /// Merkle roots of the removed files, oldest first
    pub roots: Vec<Vec<u8>>,
    /// Chain from the old level-0 accumulator of the shrinking group to the old top
    pub wit_chain: AccWitnessNode,
    /// `[remaining_group_acc, new_top]`
    pub acc_path: Vec<Vec<u8>>,
}

impl DeletionProof {
    /// Whether every part the verifier needs is present.
    pub fn is_complete(&self) -> bool {
        !self.roots.is_empty()
            && self.acc_path.len() == 2
            && !self.wit_chain.elem.is_empty()
            && !self.wit_chain.wit.is_empty()
    }
}

/// SHA-256 of the bincode encoding of a proof.
pub fn proof_hash<T: Serialize>(proof: &T) -> Result<Digest> {
    let bytes = bincode::serialize(proof)?;
    Ok(sha256_concat(&[&bytes]))
}
