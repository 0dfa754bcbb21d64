//! Error types for the podr2 crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Podr2Error>;

#[derive(Error, Debug)]
pub enum Podr2Error {
    /// Public key could not be parsed
    #[error("Invalid RSA public key: {0}")]
    InvalidKey(String),

    /// A decimal big integer failed to parse
    #[error("Malformed number in {field}: {value:?}")]
    MalformedNumber { field: &'static str, value: String },

    /// A hex field failed to decode
    #[error("Invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    /// Challenge names a block the fragment does not have
    #[error("Block index {index} out of range ({blocks} blocks)")]
    BlockOutOfRange { index: i64, blocks: usize },

    /// Data length is not a multiple of the block count
    #[error("Cannot split {len} bytes into {n} blocks")]
    Indivisible { len: usize, n: usize },

    /// Parallel lists of different lengths
    #[error("Length mismatch: {0}")]
    LengthMismatch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
