//! Idle space challenge: prove the challenged accumulator window range by
//! range, then drive the allocated TEE through per-range and total
//! verification and submit its verdict.
//!
//! The [`IdleProofRecord`] is saved after every step; a restarted run picks
//! up at the first step the record does not mark as done.

use common::{ChallengeInfo, IdleProofResult, TeeWorker, short_hex};
use parity_scale_codec::Encode;
use pois::challenge::aggregate_proof_hash;
use pois::{AccKey, proof_hash};
use tracing::{debug, info, warn};

use super::{allocated_tee, blocking, check_signature, ensure_before, submit_with_retry};
use crate::context::MinerContext;
use crate::error::{Progress, ProtocolError, ProtocolResult};
use crate::retry::call_with_ladder;
use crate::state::{IdleProofRecord, IdleRangeProof, IdleVerdict};
use crate::tee::{BlocksProof, PoisStatus, SpaceTotalRequest, SpaceVerifyRequest};

pub async fn run(ctx: &MinerContext) -> ProtocolResult<Progress> {
    let Some(snapshot) = query_snapshot(ctx).await? else {
        return Ok(Progress::Idle);
    };
    let start = snapshot.challenge_element.start;
    let chain_prove = snapshot.prove_info.idle_prove.clone();

    let existing = ctx.records.current_idle(start).map_err(ProtocolError::fatal)?;
    if existing.as_ref().is_some_and(|r| r.result_submitted)
        || chain_prove.as_ref().is_some_and(|p| p.verify_result.is_some())
    {
        return Ok(Progress::Idle);
    }

    let mut record = match existing {
        Some(record) => {
            debug!(start, ranges = record.ranges.len(), "Resuming idle challenge");
            record
        }
        None => {
            ensure_before(snapshot.challenge_element.idle_slip, ctx.latest_block().await?)?;
            let record = prove(ctx, &snapshot).await?;
            ctx.records.save_idle(&record).map_err(ProtocolError::fatal)?;
            record
        }
    };

    if !record.proof_submitted {
        if chain_prove.is_none() {
            ensure_before(snapshot.challenge_element.idle_slip, ctx.latest_block().await?)?;
            submit_proof(ctx, &record).await?;
        }
        record.proof_submitted = true;
        ctx.records.save_idle(&record).map_err(ProtocolError::fatal)?;
    }

    // An empty window has nothing for a TEE to verify
    if record.front >= record.rear {
        record.result_submitted = true;
        ctx.records.save_idle(&record).map_err(ProtocolError::fatal)?;
        info!(start, front = record.front, "Empty idle window answered");
        return Ok(Progress::Worked);
    }

    let verify_slip = snapshot.challenge_element.verify_slip;
    ensure_before(verify_slip, ctx.latest_block().await?)?;
    let worker = allocated_verifier(ctx, &mut record).await?;

    verify_ranges(ctx, &worker, &mut record).await?;
    if record.verdict.is_none() {
        verify_total(ctx, &worker, &mut record).await?;
    }

    ensure_before(verify_slip, ctx.latest_block().await?)?;
    submit_result(ctx, &worker, &record).await?;
    record.result_submitted = true;
    ctx.records.save_idle(&record).map_err(ProtocolError::fatal)?;

    info!(
        start,
        front = record.front,
        rear = record.rear,
        ranges = record.ranges.len(),
        "Idle challenge completed"
    );
    Ok(Progress::Worked)
}

async fn query_snapshot(ctx: &MinerContext) -> ProtocolResult<Option<ChallengeInfo>> {
    ctx.chain
        .query_challenge_snapshot()
        .await
        .map_err(ProtocolError::transient)
}

/// Re-read the challenge and make sure it is still the one `record` answers.
async fn current_snapshot(ctx: &MinerContext, record: &IdleProofRecord) -> ProtocolResult<ChallengeInfo> {
    let snapshot = query_snapshot(ctx)
        .await?
        .ok_or_else(|| ProtocolError::Transient("challenge snapshot disappeared".to_string()))?;
    let current = snapshot.challenge_element.start;
    if current != record.start {
        ctx.records.clear_idle().map_err(ProtocolError::fatal)?;
        return Err(ProtocolError::Stale {
            recorded: record.start,
            current,
        });
    }
    Ok(snapshot)
}

/// Prove every range of the challenged window.
async fn prove(ctx: &MinerContext, snapshot: &ChallengeInfo) -> ProtocolResult<IdleProofRecord> {
    let info = &snapshot.miner_snapshot.space_proof_info;
    let (front, rear) = (info.front as i64, info.rear as i64);
    let seeds: Vec<i64> = snapshot
        .challenge_element
        .space_param
        .iter()
        .map(|s| *s as i64)
        .collect();
    let account = ctx.account();

    let mut ranges = Vec::new();
    if front < rear {
        let key = AccKey::from_chain(&info.pois_key)?;
        let prover = ctx.prover.clone();
        let accumulator = info.accumulator.clone();
        blocking(move || prover.set_challenge_state(key, &accumulator, front, rear)).await??;

        let mut handle = ctx.prover.new_challenge_handle(&account, &seeds)?;
        let mut prev: Option<Vec<u8>> = None;
        loop {
            let (left, right) = handle.next_range(prev.as_deref())?;
            if left == right {
                break;
            }
            let prover = ctx.prover.clone();
            let range_seeds = seeds.clone();
            let proof = blocking(move || prover.prove_space(&range_seeds, left, right)).await??;
            let hash = proof_hash(&proof)?.to_vec();
            debug!(left, right, hash = %short_hex(&hash), "Range proved");
            ranges.push(IdleRangeProof {
                left,
                right,
                proof,
                miner_sign: ctx.sign(&(account, &hash).encode()),
                proof_hash: hash.clone(),
                tee_sign: None,
            });
            prev = Some(hash);
        }
    }

    let idle_prove = if ranges.is_empty() {
        Vec::new()
    } else {
        let hashes: Vec<&[u8]> = ranges.iter().map(|r| r.proof_hash.as_slice()).collect();
        aggregate_proof_hash(&hashes).to_vec()
    };
    info!(
        start = snapshot.challenge_element.start,
        front,
        rear,
        ranges = ranges.len(),
        "Idle space proof generated"
    );

    Ok(IdleProofRecord {
        start: snapshot.challenge_element.start,
        seeds,
        front,
        rear,
        accumulator: info.accumulator.clone(),
        ranges,
        idle_prove,
        tee_pubkey: None,
        verdict: None,
        proof_submitted: false,
        result_submitted: false,
    })
}

async fn submit_proof(ctx: &MinerContext, record: &IdleProofRecord) -> ProtocolResult<()> {
    let chain = &*ctx.chain;
    let start = record.start;
    let idle_prove = record.idle_prove.as_slice();
    submit_with_retry(
        ctx,
        "submit_idle_proof",
        move || chain.submit_idle_proof(idle_prove),
        move || async move {
            let snapshot = chain.query_challenge_snapshot().await?;
            Ok(snapshot.is_some_and(|s| {
                s.challenge_element.start == start && s.prove_info.idle_prove.is_some()
            }))
        },
    )
    .await
}

/// The TEE the chain allocated to verify this proof, waiting for the allocation once.
async fn allocated_verifier(ctx: &MinerContext, record: &mut IdleProofRecord) -> ProtocolResult<TeeWorker> {
    if let Some(pubkey) = record.tee_pubkey {
        return allocated_tee(ctx, &pubkey);
    }

    ctx.sleep_blocks(ctx.config.timing.allocation_wait_blocks).await;
    let snapshot = current_snapshot(ctx, record).await?;
    let pubkey = snapshot
        .prove_info
        .idle_prove
        .map(|p| p.tee_pubkey)
        .ok_or_else(|| ProtocolError::Transient("no TEE allocated to the idle proof yet".to_string()))?;
    let worker = allocated_tee(ctx, &pubkey)?;

    record.tee_pubkey = Some(pubkey);
    ctx.records.save_idle(record).map_err(ProtocolError::fatal)?;
    info!(tee = %worker.endpoint, "Idle proof verifier allocated");
    Ok(worker)
}

fn status_of(record: &IdleProofRecord) -> PoisStatus {
    PoisStatus {
        front: record.front,
        rear: record.rear,
        acc: record.accumulator.clone(),
    }
}

async fn verify_ranges(
    ctx: &MinerContext,
    worker: &TeeWorker,
    record: &mut IdleProofRecord,
) -> ProtocolResult<()> {
    let account = ctx.account();
    let tee = &*ctx.tee;
    for i in 0..record.ranges.len() {
        if record.ranges[i].tee_sign.is_some() {
            continue;
        }
        let range = &record.ranges[i];
        let request = SpaceVerifyRequest {
            miner_id: account,
            space_chals: record.seeds.clone(),
            status: status_of(record),
            proof: range.proof.clone(),
            proof_hash: range.proof_hash.clone(),
            miner_sign: range.miner_sign.clone(),
        };
        let request = &request;
        let response = call_with_ladder(
            &ctx.config.timing.space_single_verify,
            ctx.busy_sleep(),
            &worker.endpoint,
            "space_verify_single_block",
            |timeout| tee.space_verify_single_block(&worker.endpoint, timeout, request),
        )
        .await?;
        check_signature("space range", &response.signature)?;

        let range = &mut record.ranges[i];
        debug!(left = range.left, right = range.right, "Range verified");
        range.tee_sign = Some(response.signature);
        ctx.records.save_idle(record).map_err(ProtocolError::fatal)?;
    }
    Ok(())
}

async fn verify_total(
    ctx: &MinerContext,
    worker: &TeeWorker,
    record: &mut IdleProofRecord,
) -> ProtocolResult<()> {
    let proof_list = record
        .ranges
        .iter()
        .map(|r| {
            Ok(BlocksProof {
                left: r.left,
                right: r.right,
                proof_hash: r.proof_hash.clone(),
                signature: r.tee_sign.clone().ok_or_else(|| {
                    ProtocolError::Fatal(format!("range [{}, {}) not verified", r.left, r.right))
                })?,
            })
        })
        .collect::<ProtocolResult<Vec<_>>>()?;

    let request = SpaceTotalRequest {
        miner_id: ctx.account(),
        space_chals: record.seeds.clone(),
        status: status_of(record),
        idle_prove: record.idle_prove.clone(),
        proof_list,
    };
    let tee = &*ctx.tee;
    let request = &request;
    let response = call_with_ladder(
        &ctx.config.timing.space_total_verify,
        ctx.busy_sleep(),
        &worker.endpoint,
        "space_verify_total",
        |timeout| tee.space_verify_total(&worker.endpoint, timeout, request),
    )
    .await?;
    check_signature("space total", &response.signature)?;
    if !response.idle_result {
        warn!(start = record.start, "TEE rejected the idle space proof");
    }

    record.verdict = Some(IdleVerdict {
        result: response.idle_result,
        signature: response.signature,
    });
    ctx.records.save_idle(record).map_err(ProtocolError::fatal)
}

async fn submit_result(
    ctx: &MinerContext,
    worker: &TeeWorker,
    record: &IdleProofRecord,
) -> ProtocolResult<()> {
    let verdict = record
        .verdict
        .as_ref()
        .ok_or_else(|| ProtocolError::Fatal("no idle verdict to submit".to_string()))?;
    let result = IdleProofResult {
        idle_prove: record.idle_prove.clone(),
        front: record.front as u64,
        rear: record.rear as u64,
        accumulator: record.accumulator.clone(),
        result: verdict.result,
        signature: verdict.signature.clone(),
        tee_puk: worker.pubkey,
    };

    let chain = &*ctx.chain;
    let start = record.start;
    let result = &result;
    submit_with_retry(
        ctx,
        "submit_idle_proof_result",
        move || chain.submit_idle_proof_result(result),
        move || async move {
            let snapshot = chain.query_challenge_snapshot().await?;
            Ok(snapshot.is_some_and(|s| {
                s.challenge_element.start == start
                    && s.prove_info.idle_prove.is_some_and(|p| p.verify_result.is_some())
            }))
        },
    )
    .await
}
