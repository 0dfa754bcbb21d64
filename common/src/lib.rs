//! Common types shared by the CESS storage miner crates.
//!
//! This crate holds the chain-facing data model the miner reads and writes:
//! - **Challenge snapshots**: the periodic idle/service challenge a miner must answer
//! - **Space proof snapshots**: the accumulator status the chain has certified
//! - **File metadata**: which fragments belong to this miner and when they were tagged
//! - **TEE workers**: the verifier registry as published on chain
//! - **Extrinsic payloads**: arguments of the transactions the miner submits
//!
//! Sizes of fixed-length chain values are exported as constants so every
//! component validates TEE responses against the same limits.

pub mod chain;

pub use chain::{
    AccountId, ChallengeElement, ChallengeInfo, FileMetadata, FragmentInfo, IdleProofResult,
    IdleSpaceCertificate, MinerSnapshot, MinerSpaceInfo, PoisKey, ProveInfo, ProveRecord,
    SegmentInfo, ServiceParam, ServiceProofResult, SpaceProofInfo, TagReport, TeeRole, TeeWorker,
    WorkerPublicKey,
};

use sha2::{Digest, Sha256};

/// Length of a TEE worker public key.
pub const WORKER_PUBLIC_KEY_LEN: usize = 32;

/// Length of a TEE signature accepted by the chain.
pub const TEE_SIG_LEN: usize = 64;

/// Length of a serialized accumulator (2048-bit RSA group element).
pub const ACCUMULATOR_LEN: usize = 256;

/// Number of u64 words in a service bloom filter.
pub const BLOOM_FILTER_LEN: usize = 256;

/// Number of pseudorandom seeds in an idle space challenge.
pub const SPACE_CHALLENGE_PARAM_LEN: usize = 8;

/// Target block time of the chain.
pub const BLOCK_INTERVAL_SECS: u64 = 6;

pub const SIZE_1KIB: u64 = 1024;
pub const SIZE_1MIB: u64 = 1024 * SIZE_1KIB;
pub const SIZE_1GIB: u64 = 1024 * SIZE_1MIB;

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Copy a slice into a worker public key, failing on any other length.
pub fn to_worker_public_key(bytes: &[u8]) -> Option<WorkerPublicKey> {
    bytes.try_into().ok()
}

/// Short hex form of a key for log fields.
pub fn short_hex(bytes: &[u8]) -> String {
    let full = hex::encode(bytes);
    match full.char_indices().nth(16) {
        Some((idx, _)) => full[..idx].to_string(),
        None => full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_to_worker_public_key_rejects_wrong_length() {
        assert!(to_worker_public_key(&[1u8; 31]).is_none());
        assert!(to_worker_public_key(&[1u8; 33]).is_none());
        assert_eq!(to_worker_public_key(&[7u8; 32]), Some([7u8; 32]));
    }

    #[test]
    fn test_short_hex() {
        assert_eq!(short_hex(&[0xab; 4]), "abababab");
        assert_eq!(short_hex(&[0xcd; 32]).len(), 16);
    }
}
