//! The miner's proof protocols.
//!
//! Each module exposes `run(&MinerContext)`, one pass of a long-running
//! worker. A pass either finishes its cycle, reports there was nothing to
//! do, or fails with a [`ProtocolError`] after rolling back whatever it
//! staged on the prover. Passes that talk to the chain re-read it on every
//! run, so a restart simply resumes from chain state and the proof records.

pub mod commit;
pub mod idle_challenge;
pub mod idle_gen;
pub mod registry_sync;
pub mod replace;
pub mod service_challenge;
pub mod tag;

use std::future::Future;

use common::{ACCUMULATOR_LEN, TEE_SIG_LEN, TeeWorker, short_hex};
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::context::MinerContext;
use crate::error::{ProtocolError, ProtocolResult};
use crate::retry::{TimeoutLadder, call_with_ladder};
use crate::tee::TeeError;

/// Run blocking prover or file work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> ProtocolResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProtocolError::Fatal(format!("blocking task failed: {e}")))
}

/// Fail with `Expired` once `deadline` is behind the chain.
pub(crate) fn ensure_before(deadline: u32, block: u32) -> ProtocolResult<()> {
    if block > deadline {
        return Err(ProtocolError::Expired { deadline, block });
    }
    Ok(())
}

pub(crate) fn check_signature(what: &str, signature: &[u8]) -> ProtocolResult<()> {
    if signature.len() != TEE_SIG_LEN {
        return Err(ProtocolError::Fatal(format!(
            "{what}: TEE signature of {} bytes, expected {TEE_SIG_LEN}",
            signature.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_accumulator(acc: &[u8]) -> ProtocolResult<()> {
    if acc.len() != ACCUMULATOR_LEN {
        return Err(ProtocolError::Fatal(format!(
            "TEE accumulator of {} bytes, expected {ACCUMULATOR_LEN}",
            acc.len()
        )));
    }
    Ok(())
}

/// The TEE must certify exactly the accumulator the prover staged, the last
/// entry of the proof's accumulator path.
pub(crate) fn check_staged_accumulator(certified: &[u8], acc_path: &[Vec<u8>]) -> ProtocolResult<()> {
    let staged = acc_path
        .last()
        .ok_or_else(|| ProtocolError::Fatal("proof carries no accumulator path".to_string()))?;
    if !pois::acc::same_acc(certified, staged) {
        return Err(ProtocolError::Fatal(format!(
            "TEE certified accumulator {}, staged {}",
            short_hex(certified),
            short_hex(staged)
        )));
    }
    Ok(())
}

/// Marker TEEs in the order they are tried: the configured priority
/// endpoints for `priority_rounds` rounds, then every other marker once in
/// random order.
pub(crate) fn marker_candidates(ctx: &MinerContext) -> Vec<TeeWorker> {
    let priority: Vec<TeeWorker> = ctx
        .config
        .tee
        .priority_endpoints
        .iter()
        .filter_map(|endpoint| match ctx.registry.by_endpoint(endpoint) {
            Some(worker) if worker.role.can_mark() => Some(worker),
            Some(_) => {
                warn!(tee = %endpoint, "Priority TEE cannot mark, skipping");
                None
            }
            None => {
                warn!(tee = %endpoint, "Priority TEE not registered, skipping");
                None
            }
        })
        .collect();

    let mut others: Vec<TeeWorker> = ctx
        .registry
        .markers()
        .into_iter()
        .filter(|w| !priority.iter().any(|p| p.pubkey == w.pubkey))
        .collect();
    others.shuffle(&mut rand::rng());

    let rounds = ctx.config.timing.priority_rounds.max(1) as usize;
    let mut candidates = Vec::with_capacity(priority.len() * rounds + others.len());
    for _ in 0..rounds {
        candidates.extend(priority.iter().cloned());
    }
    candidates.extend(others);
    candidates
}

/// Try `call` against each candidate TEE until one answers.
///
/// Each candidate gets the full ladder. Returns the answering worker with
/// its response, or `None` when every candidate failed.
pub(crate) async fn first_answer<T, F, Fut>(
    ctx: &MinerContext,
    candidates: &[TeeWorker],
    ladder: &TimeoutLadder,
    what: &'static str,
    mut call: F,
) -> Option<(TeeWorker, T)>
where
    F: FnMut(String, std::time::Duration) -> Fut,
    Fut: Future<Output = Result<T, TeeError>>,
{
    for worker in candidates {
        let result = call_with_ladder(ladder, ctx.busy_sleep(), &worker.endpoint, what, |timeout| {
            call(worker.endpoint.clone(), timeout)
        })
        .await;
        match result {
            Ok(value) => {
                info!(tee = %worker.endpoint, call = what, "TEE answered");
                return Some((worker.clone(), value));
            }
            Err(e) => warn!(tee = %worker.endpoint, call = what, error = %e, "TEE call failed"),
        }
    }
    None
}

/// Resolve the TEE the chain allocated to verify a proof.
pub(crate) fn allocated_tee(
    ctx: &MinerContext,
    pubkey: &common::WorkerPublicKey,
) -> ProtocolResult<TeeWorker> {
    ctx.registry.by_pubkey(pubkey).ok_or_else(|| {
        ProtocolError::Transient(format!(
            "allocated TEE {} is not in the registry",
            short_hex(pubkey)
        ))
    })
}

/// Submit a transaction, checking the chain after every failure.
///
/// `landed` reports whether the chain already reflects the submission
/// (from an earlier attempt or a racing process); that counts as success.
pub(crate) async fn submit_with_retry<S, SFut, L, LFut>(
    ctx: &MinerContext,
    what: &'static str,
    mut submit: S,
    mut landed: L,
) -> ProtocolResult<()>
where
    S: FnMut() -> SFut,
    SFut: Future<Output = anyhow::Result<String>>,
    L: FnMut() -> LFut,
    LFut: Future<Output = anyhow::Result<bool>>,
{
    let attempts = ctx.config.timing.chain_submit_attempts.max(1);
    for attempt in 1..=attempts {
        match submit().await {
            Ok(tx) => {
                info!(extrinsic = what, tx = %tx, attempt, "Transaction submitted");
                return Ok(());
            }
            Err(e) => {
                warn!(extrinsic = what, attempt, error = %e, "Transaction failed");
                ctx.sleep_blocks(1).await;
                match landed().await {
                    Ok(true) => {
                        info!(extrinsic = what, "Chain already reflects the submission");
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => warn!(extrinsic = what, error = %e, "Chain re-query failed"),
                }
            }
        }
    }
    Err(ProtocolError::Transient(format!(
        "{what} not accepted after {attempts} attempts"
    )))
}
