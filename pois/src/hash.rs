//! Hash primitives behind idle labels, accumulator elements and challenges.
//!
//! Labels use keyed BLAKE3 in XOF mode so any label size can be produced
//! from one hasher; everything the TEE recomputes (Merkle nodes, elements,
//! chunk selection) uses SHA-256.

use sha2::{Digest as _, Sha256};

/// A SHA-256 digest.
pub type Digest = [u8; 32];

const LABEL_CONTEXT: &str = "cess-miner pois idle labels v1";

/// SHA-256 over the concatenation of `parts`.
pub fn sha256_concat(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Label key for a miner. Public: the TEE derives it from the miner id.
pub fn label_seed(miner_id: &[u8]) -> [u8; 32] {
    blake3::derive_key(LABEL_CONTEXT, miner_id)
}

/// Compute label `chunk` of idle file `file_index`.
///
/// Every label after the first depends on its predecessor (`parent`) and on
/// the label at half its position (`elder`), so a label cannot be produced
/// without holding the earlier ones.
pub fn derive_label(
    seed: &[u8; 32],
    file_index: i64,
    chunk: usize,
    parent: Option<&[u8]>,
    elder: Option<&[u8]>,
    len: usize,
) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new_keyed(seed);
    hasher.update(&file_index.to_be_bytes());
    hasher.update(&(chunk as u64).to_be_bytes());
    if let Some(parent) = parent {
        hasher.update(parent);
    }
    if let Some(elder) = elder {
        hasher.update(elder);
    }
    let mut out = vec![0u8; len];
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Accumulator element of an idle file.
pub fn element(file_index: i64, root: &[u8]) -> Digest {
    sha256_concat(&[&file_index.to_be_bytes(), root])
}

/// Chunk of file `file_index` opened for challenge seed `seed`.
pub fn challenged_chunk(seed: i64, file_index: i64, chunks: usize) -> usize {
    let digest = sha256_concat(&[&seed.to_be_bytes(), &file_index.to_be_bytes()]);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(word) % chunks.max(1) as u64) as usize
}
