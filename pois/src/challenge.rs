//! Chained partition of the idle log into space-challenge ranges.
//!
//! The handle hands out `[left, right)` ranges covering `(front, rear]`,
//! each ending at the next level-0 group boundary. Every range after the
//! first is released only once the proof hash of the previous range has
//! been folded into the transcript, so the resulting sequence of proofs is
//! linked and a verifier replaying the handle detects reordering or gaps.

use serde::{Deserialize, Serialize};

use crate::hash::{Digest, sha256_concat};
use crate::{PoisError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeHandle {
    elems_num: i64,
    next_left: i64,
    rear: i64,
    transcript: Digest,
    started: bool,
}

impl ChallengeHandle {
    /// Start a handle over `(front, rear]` for one TEE and seed set.
    pub fn new(tee_id: &[u8], seeds: &[i64], front: i64, rear: i64, elems_num: i64) -> Self {
        let seed_bytes: Vec<u8> = seeds.iter().flat_map(|s| s.to_be_bytes()).collect();
        Self {
            elems_num: elems_num.max(1),
            next_left: front + 1,
            rear,
            transcript: sha256_concat(&[tee_id, &seed_bytes]),
            started: false,
        }
    }

    /// Next range to prove. `left == right` once the log is exhausted.
    ///
    /// `prev_hash` is the proof hash of the range returned by the previous
    /// call and is required on every call after the first.
    pub fn next_range(&mut self, prev_hash: Option<&[u8]>) -> Result<(i64, i64)> {
        match (self.started, prev_hash) {
            (true, None) => return Err(PoisError::MissingPreviousHash),
            (_, Some(hash)) => self.transcript = sha256_concat(&[&self.transcript, hash]),
            (false, None) => {}
        }
        self.started = true;

        let left = self.next_left;
        if left > self.rear {
            return Ok((left, left));
        }
        let boundary = ((left - 1) / self.elems_num + 1) * self.elems_num + 1;
        let right = boundary.min(self.rear + 1);
        self.next_left = right;
        Ok((left, right))
    }

    /// Running hash over the seeds and every proof hash folded so far.
    pub fn transcript(&self) -> Digest {
        self.transcript
    }
}

/// Aggregate idle proof: hash of all range proof hashes in range order.
pub fn aggregate_proof_hash<H: AsRef<[u8]>>(hashes: &[H]) -> Digest {
    let parts: Vec<&[u8]> = hashes.iter().map(|h| h.as_ref()).collect();
    sha256_concat(&parts)
}

/// Every range a handle yields over `(front, rear]`, in order.
pub fn ranges(front: i64, rear: i64, elems_num: i64) -> Vec<(i64, i64)> {
    let mut handle = ChallengeHandle::new(&[], &[], front, rear, elems_num);
    let mut out = Vec::new();
    let mut prev: Option<Digest> = None;
    while let Ok((left, right)) = handle.next_range(prev.as_ref().map(|h| h.as_slice())) {
        if left == right {
            break;
        }
        out.push((left, right));
        prev = Some(sha256_concat(&[&left.to_be_bytes()]));
    }
    out
}
