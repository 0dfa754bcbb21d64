//! Escalating timeouts for TEE calls.
//!
//! Large proofs can legitimately take many minutes to verify, so a call
//! that hits its deadline is retried with a longer one instead of failing.
//! A busy TEE is retried after a fixed sleep.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::tee::TeeError;

/// Attempt `k` (0-based) waits `min(base + k * step, max)` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutLadder {
    pub base_secs: u64,
    pub step_secs: u64,
    pub max_secs: u64,
    pub attempts: u32,
}

impl TimeoutLadder {
    pub const fn new(base_secs: u64, step_secs: u64, max_secs: u64, attempts: u32) -> Self {
        Self {
            base_secs,
            step_secs,
            max_secs,
            attempts,
        }
    }

    pub fn timeout(&self, attempt: u32) -> Duration {
        let secs = self
            .base_secs
            .saturating_add(self.step_secs.saturating_mul(u64::from(attempt)))
            .min(self.max_secs);
        Duration::from_secs(secs)
    }

    pub fn timeouts(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.attempts.max(1)).map(|attempt| self.timeout(attempt))
    }
}

/// Drive one TEE call through a ladder.
///
/// Deadline and busy answers are retried; any other error ends the ladder
/// at once. When every attempt is used up the last retryable error is
/// returned.
pub async fn call_with_ladder<T, F, Fut>(
    ladder: &TimeoutLadder,
    busy_sleep: Duration,
    endpoint: &str,
    what: &'static str,
    mut call: F,
) -> Result<T, TeeError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, TeeError>>,
{
    let mut last = TeeError::DeadlineExceeded;
    let final_attempt = ladder.attempts.max(1) as usize - 1;
    for (attempt, timeout) in ladder.timeouts().enumerate() {
        match call(timeout).await {
            Ok(value) => return Ok(value),
            Err(TeeError::DeadlineExceeded) => {
                warn!(
                    tee = %endpoint,
                    call = what,
                    attempt,
                    timeout_secs = timeout.as_secs(),
                    "TEE call deadline exceeded, escalating timeout"
                );
                last = TeeError::DeadlineExceeded;
            }
            Err(TeeError::Busy) => {
                last = TeeError::Busy;
                if attempt == final_attempt {
                    break;
                }
                debug!(tee = %endpoint, call = what, attempt, "TEE busy, sleeping");
                tokio::time::sleep(busy_sleep).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}
