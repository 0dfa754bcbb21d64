//! Error types for the pois crate.

use thiserror::Error;

/// Result type alias using PoisError
pub type Result<T> = std::result::Result<T, PoisError>;

/// Errors raised by the accumulator prover and its verifiers
#[derive(Error, Debug)]
pub enum PoisError {
    /// Invalid prover parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// No generated idle files are waiting to be committed
    #[error("No idle file set ready to commit (generated {generated}, rear {rear})")]
    NothingToCommit { generated: i64, rear: i64 },

    /// Element index outside the committed window
    #[error("Index {index} outside window ({front}, {rear}]")]
    IndexOutOfWindow { index: i64, front: i64, rear: i64 },

    /// Element is not part of the accumulator tree
    #[error("Element {0} is not accumulated")]
    ElementMissing(i64),

    /// Chunk index out of bounds for an idle file
    #[error("Chunk index {index} out of bounds (max: {max})")]
    ChunkIndexOutOfBounds { index: i64, max: i64 },

    /// Malformed challenge rows or seeds
    #[error("Invalid challenge: {0}")]
    InvalidChallenge(String),

    /// Deletion request the prover cannot satisfy
    #[error("Invalid deletion of {num} elements: {reason}")]
    InvalidDeletion { num: i64, reason: String },

    /// Chain reported a state the local prover cannot reach
    #[error("Cannot sync to chain status front={front} rear={rear}: {reason}")]
    SyncFailed {
        front: i64,
        rear: i64,
        reason: String,
    },

    /// Another operation holds the prover
    #[error("Prover busy with another operation")]
    Busy,

    /// Challenge state was not primed before proving space
    #[error("Challenge state not set")]
    ChallengeStateMissing,

    /// The chained handle was asked to advance without the previous proof hash
    #[error("Challenge handle needs the previous range's proof hash")]
    MissingPreviousHash,

    /// Idle file content does not match its committed root
    #[error("Idle file {index} is corrupt")]
    CorruptIdleFile { index: i64 },

    /// Merkle tree construction error
    #[error("Merkle tree error: {0}")]
    MerkleTreeError(String),

    /// Empty data
    #[error("Cannot process empty data")]
    EmptyData,

    /// I/O error on the idle directory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<bincode::Error> for PoisError {
    fn from(err: bincode::Error) -> Self {
        PoisError::SerializationError(err.to_string())
    }
}
