//! Failure classes of the proof protocols.
//!
//! Every protocol step returns [`ProtocolResult`]; the supervisor picks the
//! relaunch backoff from the variant.

use pois::PoisError;
use podr2::Podr2Error;

use crate::tee::TeeError;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Network or chain hiccup, retried on the next run
    #[error("transient failure: {0}")]
    Transient(String),

    /// Another operation holds the accumulator prover
    #[error("accumulator prover is busy")]
    Busy,

    /// The cycle was aborted and any staged prover update rolled back
    #[error("protocol failed: {0}")]
    Fatal(String),

    #[error("challenge {recorded} superseded by challenge {current}")]
    Stale { recorded: u32, current: u32 },

    #[error("deadline block {deadline} passed (latest block {block})")]
    Expired { deadline: u32, block: u32 },

    /// Stops the process
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    pub fn transient(e: impl std::fmt::Display) -> Self {
        ProtocolError::Transient(e.to_string())
    }

    pub fn fatal(e: impl std::fmt::Display) -> Self {
        ProtocolError::Fatal(e.to_string())
    }
}

impl From<PoisError> for ProtocolError {
    fn from(e: PoisError) -> Self {
        match e {
            PoisError::Busy => ProtocolError::Busy,
            other => ProtocolError::Fatal(other.to_string()),
        }
    }
}

impl From<Podr2Error> for ProtocolError {
    fn from(e: Podr2Error) -> Self {
        ProtocolError::Fatal(e.to_string())
    }
}

impl From<TeeError> for ProtocolError {
    fn from(e: TeeError) -> Self {
        match e {
            TeeError::Rejected(reason) => ProtocolError::Fatal(format!("TEE rejected: {reason}")),
            other => ProtocolError::Transient(other.to_string()),
        }
    }
}

/// What a worker run achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Made progress; run again right away
    Worked,
    /// Nothing to do until the next poll
    Idle,
}
