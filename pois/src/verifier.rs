//! Checks a TEE runs against idle space proofs.
//!
//! All functions return `false`/`None` on any mismatch rather than an
//! error: a malformed proof is simply an invalid one.

use num_bigint::BigUint;

use crate::acc::{AccKey, accumulate, exponent, same_acc};
use crate::challenge::ChallengeHandle;
use crate::hash::{challenged_chunk, derive_label, element};
use crate::merkle::MerkleTree;
use crate::types::{AccProof, CommitProof, DeletionProof, IdleCommit, MhtProof, SpaceProof};

/// Public idle file parameters a verifier needs.
#[derive(Debug, Clone)]
pub struct IdleFileParams {
    /// Label key derived from the miner id
    pub seed: [u8; 32],
    pub chunk_size: usize,
    pub chunks: usize,
    pub elems_num: i64,
}

fn opens(proof: &MhtProof, index: i64, root: &[u8]) -> bool {
    proof.index as i64 == index && MerkleTree::verify_proof_against_root(proof, root)
}

/// Verify the label openings answering a commit challenge.
pub fn verify_commit_proofs(
    params: &IdleFileParams,
    commit: &IdleCommit,
    rows: &[Vec<i64>],
    proofs: &[Vec<CommitProof>],
) -> bool {
    if rows.len() != proofs.len() || commit.file_indexs.len() != commit.roots.len() {
        return false;
    }

    for (row, row_proofs) in rows.iter().zip(proofs) {
        let Some((&file_index, chunks)) = row.split_first() else {
            return false;
        };
        let Some(pos) = commit.file_indexs.iter().position(|i| *i == file_index) else {
            return false;
        };
        let root = &commit.roots[pos];
        if chunks.len() != row_proofs.len() {
            return false;
        }

        for (&chunk, proof) in chunks.iter().zip(row_proofs) {
            if chunk < 0 || chunk as usize >= params.chunks || !opens(&proof.node, chunk, root) {
                return false;
            }
            let expected = if chunk == 0 {
                if !proof.parents.is_empty() || !proof.elders.is_empty() {
                    return false;
                }
                derive_label(&params.seed, file_index, 0, None, None, params.chunk_size)
            } else {
                let (Some(parent), Some(elder)) = (proof.parents.first(), proof.elders.first())
                else {
                    return false;
                };
                if !opens(parent, chunk - 1, root) || !opens(elder, chunk / 2, root) {
                    return false;
                }
                derive_label(
                    &params.seed,
                    file_index,
                    chunk as usize,
                    Some(&parent.label),
                    Some(&elder.label),
                    params.chunk_size,
                )
            };
            if proof.node.label != expected {
                return false;
            }
        }
    }
    true
}

/// Verify that a commit batch folds into the accumulator, returning the new accumulator.
pub fn verify_acc_proof(
    key: &AccKey,
    elems_num: i64,
    commit: &IdleCommit,
    proof: &AccProof,
    current_acc: &[u8],
) -> Option<Vec<u8>> {
    if proof.acc_path.len() != 2 || !same_acc(&proof.acc_path[0], current_acc) {
        return None;
    }
    if proof.indexs != commit.file_indexs
        || proof.elements.len() != commit.roots.len()
        || proof.indexs.is_empty()
    {
        return None;
    }
    for ((index, root), elem) in proof.indexs.iter().zip(&commit.roots).zip(&proof.elements) {
        if element(*index, root).as_slice() != elem.as_slice() {
            return None;
        }
    }

    let exps: Vec<BigUint> = proof.elements.iter().map(|e| exponent(e)).collect();
    let group_acc = accumulate(key, &key.g, &exps);
    if BigUint::from_bytes_be(&proof.wit_chain.elem) != group_acc {
        return None;
    }
    if proof.wit_chain.depth() != 2 || !proof.wit_chain.verify(key, &proof.acc_path[1]) {
        return None;
    }

    // A batch opening a fresh level-1 group leaves every older group untouched,
    // so its top-level witness is exactly the previous accumulator.
    let g0 = (proof.indexs[0] - 1) / elems_num.max(1);
    if g0 % elems_num.max(1) == 0 {
        let upper = proof.wit_chain.acc.as_ref()?;
        if !same_acc(&upper.wit, current_acc) {
            return None;
        }
    }
    Some(proof.acc_path[1].clone())
}

/// Verify the space proof of one challenge range.
pub fn verify_space_proof(
    key: &AccKey,
    params: &IdleFileParams,
    seeds: &[i64],
    acc: &[u8],
    proof: &SpaceProof,
) -> bool {
    let count = proof.right - proof.left;
    if count <= 0
        || proof.roots.len() as i64 != count
        || proof.proofs.len() as i64 != count
        || proof.wit_chains.len() as i64 != count
    {
        return false;
    }

    for (k, index) in (proof.left..proof.right).enumerate() {
        let root = &proof.roots[k];
        let chain = &proof.wit_chains[k];
        if chain.elem.as_slice() != element(index, root).as_slice()
            || chain.depth() != 3
            || !chain.verify(key, acc)
        {
            return false;
        }
        let openings = &proof.proofs[k];
        if openings.len() != seeds.len() {
            return false;
        }
        for (seed, opening) in seeds.iter().zip(openings) {
            let chunk = challenged_chunk(*seed, index, params.chunks) as i64;
            if !opens(opening, chunk, root) {
                return false;
            }
        }
    }
    true
}

/// Verify a deletion of the oldest elements after `front`, returning the new accumulator.
pub fn verify_deletion_proof(
    key: &AccKey,
    front: i64,
    current_acc: &[u8],
    proof: &DeletionProof,
) -> Option<Vec<u8>> {
    if !proof.is_complete() || proof.wit_chain.depth() != 2 {
        return None;
    }
    let exps: Vec<BigUint> = proof
        .roots
        .iter()
        .enumerate()
        .map(|(k, root)| exponent(&element(front + 1 + k as i64, root)))
        .collect();
    let remaining = BigUint::from_bytes_be(&proof.acc_path[0]);
    if accumulate(key, &remaining, &exps) != BigUint::from_bytes_be(&proof.wit_chain.elem) {
        return None;
    }
    if !proof.wit_chain.verify(key, current_acc) {
        return None;
    }
    Some(proof.acc_path[1].clone())
}

/// Replay a challenge handle with the miner's range hashes.
///
/// Returns the ranges the hashes must correspond to, or `None` when the
/// number of hashes does not match the number of ranges.
pub fn replay_ranges<H: AsRef<[u8]>>(
    tee_id: &[u8],
    seeds: &[i64],
    front: i64,
    rear: i64,
    elems_num: i64,
    hashes: &[H],
) -> Option<Vec<(i64, i64)>> {
    let mut handle = ChallengeHandle::new(tee_id, seeds, front, rear, elems_num);
    let mut ranges = Vec::with_capacity(hashes.len());
    let mut prev: Option<&[u8]> = None;
    loop {
        let (left, right) = handle.next_range(prev).ok()?;
        if left == right {
            break;
        }
        let hash = hashes.get(ranges.len())?;
        ranges.push((left, right));
        prev = Some(hash.as_ref());
    }
    (ranges.len() == hashes.len()).then_some(ranges)
}
