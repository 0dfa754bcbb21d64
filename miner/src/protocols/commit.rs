//! Idle commitment: certify a freshly generated batch of idle files.
//!
//! ```text
//! WaitCommitReady → SyncStatus → RequestChallenge → ProveCommit
//!   → VerifyWithTEE → CertifyOnChain → UpdateLocalStatus
//! ```
//!
//! The grown accumulator stays staged on the prover until the chain has
//! certified it; every failure after staging rolls it back.

use common::{IdleSpaceCertificate, SpaceProofInfo, TeeWorker};
use parity_scale_codec::Encode;
use pois::proof_hash;
use tracing::{debug, info, warn};

use super::{
    blocking, check_accumulator, check_signature, check_staged_accumulator, first_answer,
    marker_candidates, submit_with_retry,
};
use crate::context::MinerContext;
use crate::error::{Progress, ProtocolError, ProtocolResult};
use crate::retry::call_with_ladder;
use crate::tee::{CommitChallengeRequest, PoisStatus, StatusVerdict, VerifyCommitRequest};

pub async fn run(ctx: &MinerContext) -> ProtocolResult<Progress> {
    if !ctx.prover.commit_ready() {
        return Ok(Progress::Idle);
    }

    sync_with_chain(ctx).await?;
    if !ctx.prover.commit_ready() {
        return Ok(Progress::Idle);
    }

    let commit = ctx.prover.get_idle_file_set_commits()?;
    let (first, last) = match (commit.file_indexs.first(), commit.file_indexs.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Ok(Progress::Idle),
    };
    info!(from = first, to = last, "Committing idle file set");

    let account = ctx.account();
    let request = CommitChallengeRequest {
        miner_id: account,
        file_indexs: commit.file_indexs.clone(),
        roots: commit.roots.clone(),
        miner_sign: ctx.sign(&(account, &commit.file_indexs, &commit.roots).encode()),
    };

    let candidates = marker_candidates(ctx);
    let tee = &*ctx.tee;
    let request = &request;
    let Some((worker, challenge)) = first_answer(
        ctx,
        &candidates,
        &ctx.config.timing.commit_challenge,
        "commit_challenge",
        move |endpoint, timeout| async move { tee.gen_challenge(&endpoint, timeout, request).await },
    )
    .await
    else {
        ctx.prover.commit_rollback();
        return Err(ProtocolError::Fatal(format!(
            "no TEE issued a commit challenge ({} tried)",
            candidates.len()
        )));
    };
    debug!(tee = %worker.endpoint, rows = challenge.rows.len(), "Commit challenge received");

    let status = PoisStatus {
        front: ctx.prover.front(),
        rear: ctx.prover.rear(),
        acc: ctx.prover.accumulator(),
    };
    let rows = challenge.rows.clone();
    let prover = ctx.prover.clone();
    let proved = blocking(move || prover.prove_commit_and_acc(&rows)).await?;
    let (commit_proofs, acc_proof) = match proved {
        Ok(Some(proofs)) => proofs,
        Ok(None) => {
            ctx.prover.commit_rollback();
            return Err(ProtocolError::Busy);
        }
        Err(e) => {
            ctx.prover.commit_rollback();
            return Err(e.into());
        }
    };

    let digest = proof_hash(&(&commit_proofs, &acc_proof)).map_err(|e| rollback(ctx, e))?;
    let request = VerifyCommitRequest {
        miner_id: account,
        status,
        rows: challenge.rows,
        commit_proofs,
        acc_proof,
        miner_sign: ctx.sign(&(account, digest).encode()),
    };

    let verdict = verify(ctx, &worker, &request).await?;
    certify(ctx, &worker, &verdict).await?;

    let prover = ctx.prover.clone();
    let elems_num = ctx.prover.elems_num();
    // The chain holds the new status now; a failed local update is repaired
    // by the sync at the start of the next run.
    blocking(move || prover.update_status(elems_num, false)).await??;

    info!(
        front = verdict.status.front,
        rear = verdict.status.rear,
        tee = %worker.endpoint,
        "Idle space certified"
    );
    Ok(Progress::Worked)
}

/// Drop the staged commit and classify `e` as fatal.
fn rollback(ctx: &MinerContext, e: impl std::fmt::Display) -> ProtocolError {
    if ctx.prover.commit_rollback() {
        warn!(error = %e, "Commit rolled back");
    }
    ProtocolError::fatal(e)
}

/// Move the local watermarks forward when the chain certified more than we know of.
async fn sync_with_chain(ctx: &MinerContext) -> ProtocolResult<()> {
    let Some(info) = ctx
        .chain
        .query_space_proof_info()
        .await
        .map_err(ProtocolError::transient)?
    else {
        return Ok(());
    };
    let (front, rear) = (info.front as i64, info.rear as i64);
    if rear > ctx.prover.rear() || front > ctx.prover.front() {
        warn!(
            chain_front = front,
            chain_rear = rear,
            local_front = ctx.prover.front(),
            local_rear = ctx.prover.rear(),
            "Chain accumulator status ahead of local, syncing"
        );
        let prover = ctx.prover.clone();
        blocking(move || prover.sync_chain_pois_status(front, rear)).await??;
    }
    Ok(())
}

async fn verify(
    ctx: &MinerContext,
    worker: &TeeWorker,
    request: &VerifyCommitRequest,
) -> ProtocolResult<StatusVerdict> {
    let tee = &*ctx.tee;
    let result = call_with_ladder(
        &ctx.config.timing.commit_verify,
        ctx.busy_sleep(),
        &worker.endpoint,
        "verify_commit",
        |timeout| tee.verify_commit(&worker.endpoint, timeout, request),
    )
    .await;

    let verdict = match result {
        Ok(verdict) => verdict,
        Err(e) => return Err(rollback(ctx, format!("commit verification failed: {e}"))),
    };

    let expected_rear = ctx.prover.rear() + ctx.prover.elems_num();
    let checked = check_signature("commit status", &verdict.status_tee_sign)
        .and_then(|_| {
            check_signature("commit controller", &verdict.signature_with_tee_controller)
        })
        .and_then(|_| check_accumulator(&verdict.status.acc))
        .and_then(|_| check_staged_accumulator(&verdict.status.acc, &request.acc_proof.acc_path))
        .and_then(|_| {
            if verdict.status.rear != expected_rear || verdict.status.front != ctx.prover.front() {
                return Err(ProtocolError::Fatal(format!(
                    "TEE certified front={} rear={}, expected front={} rear={expected_rear}",
                    verdict.status.front,
                    verdict.status.rear,
                    ctx.prover.front()
                )));
            }
            Ok(())
        });
    if let Err(e) = checked {
        return Err(rollback(ctx, e));
    }
    Ok(verdict)
}

async fn certify(
    ctx: &MinerContext,
    worker: &TeeWorker,
    verdict: &StatusVerdict,
) -> ProtocolResult<()> {
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
    let target_rear = cert.space_proof_info.rear;
    let result = submit_with_retry(
        ctx,
        "cert_idle_space",
        move || chain.cert_idle_space(cert),
        move || async move {
            let info = chain.query_space_proof_info().await?;
            Ok(info.is_some_and(|info| info.rear >= target_rear))
        },
    )
    .await;

    result.map_err(|e| rollback(ctx, e))
}
