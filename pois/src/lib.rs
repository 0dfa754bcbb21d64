//! Proof of idle space for the CESS storage miner.
//!
//! The miner fills its declared idle capacity with deterministic idle files
//! and commits them, in groups, into a three level RSA accumulator. The TEE
//! verifiers only ever see Merkle openings and accumulator witnesses, never
//! the idle data itself.
//!
//! # Architecture
//!
//! ```text
//! GENERATE:
//!   miner id → keyed label chain per file → Merkle root → element = H(index ‖ root)
//!
//! COMMIT:
//!   group of E elements → TEE challenge rows → CommitProof + AccProof → new top accumulator
//!
//! CHALLENGE:
//!   seeds → ChallengeHandle ranges [left, right) → SpaceProof per range → TEE signatures
//!
//! REPLACE:
//!   oldest n elements → DeletionProof → TEE → chain certifies → files removed
//! ```
//!
//! The [`AccumulatorProver`] trait is the seam the miner's protocols drive;
//! [`LocalProver`] is the disk-backed implementation and [`verifier`] holds
//! the checks a TEE runs against every proof type.

pub mod acc;
pub mod challenge;
pub mod error;
pub mod hash;
pub mod idle;
pub mod merkle;
pub mod prover;
pub mod types;
pub mod verifier;

pub use acc::{AccKey, AccTree, AccWitnessNode};
pub use challenge::ChallengeHandle;
pub use error::{PoisError, Result};
pub use merkle::MerkleTree;
pub use prover::{AccumulatorProver, LocalProver, PoisParams};
pub use types::{
    AccProof, CommitProof, DeletionProof, IdleCommit, MhtProof, SpaceProof, proof_hash,
};

/// Elements per accumulator group, and per commit batch.
pub const DEFAULT_ELEMS_NUM: i64 = 256;

/// Bytes per idle file label.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Labels per idle file (8 MiB files with the default chunk size).
pub const DEFAULT_FILE_CHUNKS: usize = 1024;

/// Number of nested levels in an accumulator witness chain.
pub const ACC_LEVELS: usize = 3;
