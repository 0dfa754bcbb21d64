//! Idle replacement: shrink the idle accumulator to free space for user files.
//!
//! Order matters here. The chain certifies the smaller accumulator before
//! a single idle file is removed from disk, so a crash at any point leaves
//! every certified element provable.

use common::{IdleSpaceCertificate, SpaceProofInfo, TeeWorker};
use parity_scale_codec::Encode;
use pois::{AccKey, PoisError, proof_hash};
use tracing::{debug, info, warn};

use super::{
    blocking, check_accumulator, check_signature, check_staged_accumulator, first_answer,
    marker_candidates, submit_with_retry,
};
use crate::context::MinerContext;
use crate::error::{Progress, ProtocolError, ProtocolResult};
use crate::tee::{PoisStatus, StatusVerdict, VerifyDeletionRequest};

/// Idle files that can be replaced in one deletion.
///
/// Never crosses a level-0 group boundary and never exceeds what is committed.
pub fn replaceable_files(pending_bytes: u128, file_size: u64, elems_num: i64, front: i64, rear: i64) -> i64 {
    if file_size == 0 || elems_num <= 0 {
        return 0;
    }
    let whole = (pending_bytes / file_size as u128).min(i64::MAX as u128) as i64;
    let to_boundary = elems_num - front.rem_euclid(elems_num);
    whole.min(to_boundary).min((rear - front).max(0))
}

pub async fn run(ctx: &MinerContext) -> ProtocolResult<Progress> {
    let pending = ctx
        .chain
        .query_pending_replacements()
        .await
        .map_err(ProtocolError::transient)?;
    if pending == 0 {
        return Ok(Progress::Idle);
    }

    if let Some(info) = ctx
        .chain
        .query_space_proof_info()
        .await
        .map_err(ProtocolError::transient)?
    {
        let (front, rear) = (info.front as i64, info.rear as i64);
        if front > ctx.prover.front() || rear > ctx.prover.rear() {
            let prover = ctx.prover.clone();
            blocking(move || prover.sync_chain_pois_status(front, rear)).await??;
        }
    }

    let (front, rear) = (ctx.prover.front(), ctx.prover.rear());
    let num = replaceable_files(pending, ctx.idle_file_size(), ctx.prover.elems_num(), front, rear);
    if num == 0 {
        debug!(pending, front, rear, "Pending replacement smaller than one idle file");
        return Ok(Progress::Idle);
    }
    info!(pending, num, front, "Replacing idle files");

    let status = PoisStatus {
        front,
        rear,
        acc: ctx.prover.accumulator(),
    };
    let prover = ctx.prover.clone();
    let proof = match blocking(move || prover.prove_deletion(num)).await? {
        Ok(proof) => proof,
        Err(PoisError::Busy) => return Err(ProtocolError::Busy),
        Err(e) => {
            ctx.prover.acc_rollback(true);
            return Err(e.into());
        }
    };
    if !proof.is_complete() {
        return Err(rollback(ctx, "deletion proof is incomplete"));
    }

    let account = ctx.account();
    let digest = proof_hash(&proof).map_err(|e| rollback(ctx, e))?;
    let request = VerifyDeletionRequest {
        miner_id: account,
        status,
        proof,
        miner_sign: ctx.sign(&(account, num, digest).encode()),
    };

    let candidates = marker_candidates(ctx);
    let tee = &*ctx.tee;
    let request = &request;
    let Some((worker, verdict)) = first_answer(
        ctx,
        &candidates,
        &ctx.config.timing.deletion_verify,
        "verify_deletion",
        move |endpoint, timeout| async move { tee.verify_deletion(&endpoint, timeout, request).await },
    )
    .await
    else {
        return Err(rollback(ctx, "no TEE verified the deletion proof"));
    };

    validate(front + num, rear, &request.proof.acc_path, &verdict).map_err(|e| rollback(ctx, e))?;
    certify(ctx, &worker, &verdict).await?;

    let prover = ctx.prover.clone();
    blocking(move || prover.update_status(num, true)).await??;
    info!(front = front + num, rear, tee = %worker.endpoint, "Idle space replaced");

    reprime_challenge(ctx).await;

    let prover = ctx.prover.clone();
    let removed = blocking(move || prover.delete_files()).await??;
    debug!(removed, "Replaced idle files removed from disk");
    Ok(Progress::Worked)
}

fn rollback(ctx: &MinerContext, e: impl std::fmt::Display) -> ProtocolError {
    if ctx.prover.acc_rollback(true) {
        warn!(error = %e, "Deletion rolled back");
    }
    ProtocolError::fatal(e)
}

fn validate(front: i64, rear: i64, acc_path: &[Vec<u8>], verdict: &StatusVerdict) -> ProtocolResult<()> {
    check_signature("deletion status", &verdict.status_tee_sign)?;
    check_signature("deletion controller", &verdict.signature_with_tee_controller)?;
    check_accumulator(&verdict.status.acc)?;
    check_staged_accumulator(&verdict.status.acc, acc_path)?;
    if verdict.status.front != front || verdict.status.rear != rear {
        return Err(ProtocolError::Fatal(format!(
            "TEE certified front={} rear={}, expected front={front} rear={rear}",
            verdict.status.front, verdict.status.rear
        )));
    }
    Ok(())
}

async fn certify(ctx: &MinerContext, worker: &TeeWorker, verdict: &StatusVerdict) -> ProtocolResult<()> {
    let cert = IdleSpaceCertificate {
        space_proof_info: SpaceProofInfo {
            front: verdict.status.front as u64,
            rear: verdict.status.rear as u64,
            pois_key: ctx.prover.key().to_chain(),
            accumulator: verdict.status.acc.clone(),
        },
        tee_sig_need_verify: verdict.status_tee_sign.clone(),
        tee_sig: verdict.signature_with_tee_controller.clone(),
        tee_puk: worker.pubkey,
    };

    let chain = &*ctx.chain;
    let cert = &cert;
    let target_front = cert.space_proof_info.front;
    submit_with_retry(
        ctx,
        "replace_idle_space",
        move || chain.replace_idle_space(cert),
        move || async move {
            let info = chain.query_space_proof_info().await?;
            Ok(info.is_some_and(|info| info.front >= target_front))
        },
    )
    .await
    .map_err(|e| rollback(ctx, e))
}

/// Point the challenge snapshot back at the chain's open challenge, if any,
/// so the files it still covers survive the cleanup.
async fn reprime_challenge(ctx: &MinerContext) {
    let snapshot = match ctx.chain.query_challenge_snapshot().await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Challenge snapshot query failed, skipping re-prime");
            return;
        }
    };
    let info = snapshot.miner_snapshot.space_proof_info;
    let key = match AccKey::from_chain(&info.pois_key) {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "Challenge snapshot carries an invalid accumulator key");
            return;
        }
    };
    let prover = ctx.prover.clone();
    let result = blocking(move || {
        prover.set_challenge_state(key, &info.accumulator, info.front as i64, info.rear as i64)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to re-prime challenge state"),
        Err(e) => warn!(error = %e, "Failed to re-prime challenge state"),
    }
}
