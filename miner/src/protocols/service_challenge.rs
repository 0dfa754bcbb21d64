//! Service file challenge: answer the chain's PoDR2 challenge over every
//! challengeable fragment with one aggregate σ, then have the allocated TEE
//! verify it batch by batch and submit the countersigned verdict.
//!
//! A fragment that cannot be proven fails the whole cycle; proving a
//! subset would only produce a σ the TEE rejects.

use std::path::PathBuf;

use common::{BLOOM_FILTER_LEN, ChallengeInfo, ServiceProofResult, TeeWorker};
use parity_scale_codec::Encode;
use podr2::{QElement, TagFile, challenge_elements, split_file_by_n};
use tracing::{debug, info, warn};

use super::tag::{calc_fragment_tag, load_valid_tag};
use super::{allocated_tee, blocking, check_signature, ensure_before, submit_with_retry};
use crate::constants::MAX_SINGLE_VERIFICATION;
use crate::context::MinerContext;
use crate::error::{Progress, ProtocolError, ProtocolResult};
use crate::retry::call_with_ladder;
use crate::state::{ChallengeRandom, ServiceBatch, ServiceProofRecord, ServiceVerdict};
use crate::tee::{
    AggregateProof, AggregateSignatureRequest, BatchVerifyRequest, BatchVerifyResponse,
    parse_tee_account,
};

/// Fragments per batch-verify request for `total` challenged fragments.
pub fn calc_batch_quantity(total: usize, max_single: usize) -> usize {
    total / (total / max_single.max(1) + 1) + 1
}

/// A fragment the challenge covers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChallengedFragment {
    fid: String,
    hash: String,
    index: u16,
}

pub async fn run(ctx: &MinerContext) -> ProtocolResult<Progress> {
    run_with_limit(ctx, MAX_SINGLE_VERIFICATION).await
}

async fn run_with_limit(ctx: &MinerContext, max_single: usize) -> ProtocolResult<Progress> {
    let Some(snapshot) = query_snapshot(ctx).await? else {
        return Ok(Progress::Idle);
    };
    let element = &snapshot.challenge_element;
    let start = element.start;
    let chain_prove = snapshot.prove_info.service_prove.clone();

    let existing = ctx.records.current_service(start).map_err(ProtocolError::fatal)?;
    if existing.as_ref().is_some_and(|r| r.result_submitted)
        || chain_prove.as_ref().is_some_and(|p| p.verify_result.is_some())
    {
        return Ok(Progress::Idle);
    }

    if ctx.records.load_challenge_random(start).is_none() {
        ctx.records
            .save_challenge_random(&ChallengeRandom {
                start,
                random_index_list: element.service_param.random_index_list.clone(),
                random_list: element.service_param.random_list.clone(),
            })
            .map_err(ProtocolError::fatal)?;
    }
    let qslices = challenge_elements(
        &element.service_param.random_index_list,
        &element.service_param.random_list,
    )?;

    let mut record = match existing {
        Some(record) => {
            debug!(start, batches = record.batches.len(), "Resuming service challenge");
            record
        }
        None => {
            ensure_before(element.service_slip, ctx.latest_block().await?)?;
            let record = prove(ctx, start, &qslices, max_single).await?;
            ctx.records.save_service(&record).map_err(ProtocolError::fatal)?;
            record
        }
    };

    if !record.proof_submitted {
        if chain_prove.is_none() {
            ensure_before(element.service_slip, ctx.latest_block().await?)?;
            submit_proof(ctx, &record).await?;
        }
        record.proof_submitted = true;
        ctx.records.save_service(&record).map_err(ProtocolError::fatal)?;
    }

    ensure_before(element.verify_slip, ctx.latest_block().await?)?;
    let worker = allocated_verifier(ctx, &mut record).await?;
    verify_batches(ctx, &worker, &mut record, &qslices).await?;
    if record.verdict.is_none() {
        conclude(ctx, &worker, &mut record, &qslices).await?;
    }

    ensure_before(element.verify_slip, ctx.latest_block().await?)?;
    submit_result(ctx, &record).await?;
    record.result_submitted = true;
    ctx.records.save_service(&record).map_err(ProtocolError::fatal)?;

    info!(
        start,
        batches = record.batches.len(),
        fragments = record.batches.iter().map(ServiceBatch::len).sum::<usize>(),
        "Service challenge completed"
    );
    Ok(Progress::Worked)
}

async fn query_snapshot(ctx: &MinerContext) -> ProtocolResult<Option<ChallengeInfo>> {
    ctx.chain
        .query_challenge_snapshot()
        .await
        .map_err(ProtocolError::transient)
}

/// Fragments of locally held files whose tag predates the challenge.
async fn challengeable_fragments(ctx: &MinerContext, start: u32) -> ProtocolResult<Vec<ChallengedFragment>> {
    let account = ctx.account();
    let mut out = Vec::new();
    for fid in ctx.workspace.list_files().map_err(ProtocolError::fatal)? {
        let Some(meta) = ctx
            .chain
            .query_file_metadata(&fid)
            .await
            .map_err(ProtocolError::transient)?
        else {
            debug!(fid, "File not on chain, skipping");
            continue;
        };
        out.extend(
            meta.fragments_of(&account)
                .filter(|(_, f)| f.tag.is_some_and(|tagged| tagged <= start))
                .map(|(index, f)| ChallengedFragment {
                    fid: fid.clone(),
                    hash: f.hash.clone(),
                    index,
                }),
        );
    }
    Ok(out)
}

async fn restoral_order(ctx: &MinerContext, fragment: &ChallengedFragment) {
    match ctx
        .chain
        .generate_restoral_order(&fragment.fid, &fragment.hash)
        .await
    {
        Ok(tx) => info!(fid = %fragment.fid, fragment = %fragment.hash, tx, "Restoral order generated"),
        Err(e) => warn!(fid = %fragment.fid, fragment = %fragment.hash, error = %e, "Restoral order failed"),
    }
}

/// The fragment's tag, recomputed through a TEE when missing or corrupt.
async fn fragment_tag(ctx: &MinerContext, fragment: &ChallengedFragment) -> ProtocolResult<TagFile> {
    if !ctx.workspace.fragment_path(&fragment.fid, &fragment.hash).exists() {
        restoral_order(ctx, fragment).await;
        return Err(ProtocolError::Fatal(format!(
            "challenged fragment {} is missing",
            fragment.hash
        )));
    }
    if let Some(tag) = load_valid_tag(ctx, &fragment.fid, &fragment.hash).await {
        return Ok(tag);
    }

    let path = ctx.workspace.tag_path(&fragment.fid, &fragment.hash);
    if let Err(e) = tokio::fs::remove_file(&path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove stale tag");
    }
    info!(fid = %fragment.fid, fragment = %fragment.hash, "Regenerating tag");
    match calc_fragment_tag(ctx, &fragment.fid, &fragment.hash, fragment.index).await {
        Ok(tag) => Ok(tag),
        Err(e) => {
            restoral_order(ctx, fragment).await;
            Err(ProtocolError::Fatal(format!(
                "tag of challenged fragment {} unavailable: {e}",
                fragment.hash
            )))
        }
    }
}

async fn prove(
    ctx: &MinerContext,
    start: u32,
    qslices: &[QElement],
    max_single: usize,
) -> ProtocolResult<ServiceProofRecord> {
    let fragments = challengeable_fragments(ctx, start).await?;
    let batch_size = calc_batch_quantity(fragments.len(), max_single);
    info!(start, fragments = fragments.len(), batch_size, "Proving service fragments");

    let mut batches = Vec::new();
    let mut batch = ServiceBatch::default();
    let mut sigma = String::new();
    for fragment in &fragments {
        let tag = fragment_tag(ctx, fragment).await?;

        let key = ctx.podr2_key.clone();
        let path: PathBuf = ctx.workspace.fragment_path(&fragment.fid, &fragment.hash);
        let phi = tag.tag.t.phi.clone();
        let challenge = qslices.to_vec();
        let proof = blocking(move || {
            let matrix = split_file_by_n(&path, phi.len())?;
            key.gen_proof(&challenge, &phi, &matrix)
        })
        .await??;

        batch.sigma = ctx.podr2_key.aggr_append_proof(&batch.sigma, &proof.sigma)?;
        sigma = ctx.podr2_key.aggr_append_proof(&sigma, &proof.sigma)?;
        batch.names.push(tag.tag.t.name);
        batch.us.push(tag.tag.t.u);
        batch.mus.push(proof.mu);
        batch.u_sigs.push(tag.u_sig);

        if batch.len() >= batch_size {
            batches.push(std::mem::take(&mut batch));
        }
    }
    if !batch.is_empty() || batches.is_empty() {
        batches.push(batch);
    }

    Ok(ServiceProofRecord {
        start,
        sigma,
        batches,
        tee_pubkey: None,
        verdict: None,
        proof_submitted: false,
        result_submitted: false,
    })
}

async fn submit_proof(ctx: &MinerContext, record: &ServiceProofRecord) -> ProtocolResult<()> {
    let chain = &*ctx.chain;
    let start = record.start;
    let sigma = record.sigma.as_bytes();
    submit_with_retry(
        ctx,
        "submit_service_proof",
        move || chain.submit_service_proof(sigma),
        move || async move {
            let snapshot = chain.query_challenge_snapshot().await?;
            Ok(snapshot.is_some_and(|s| {
                s.challenge_element.start == start && s.prove_info.service_prove.is_some()
            }))
        },
    )
    .await
}

async fn allocated_verifier(ctx: &MinerContext, record: &mut ServiceProofRecord) -> ProtocolResult<TeeWorker> {
    if let Some(pubkey) = record.tee_pubkey {
        return allocated_tee(ctx, &pubkey);
    }

    ctx.sleep_blocks(ctx.config.timing.allocation_wait_blocks).await;
    let snapshot = query_snapshot(ctx)
        .await?
        .ok_or_else(|| ProtocolError::Transient("challenge snapshot disappeared".to_string()))?;
    let current = snapshot.challenge_element.start;
    if current != record.start {
        ctx.records.clear_service().map_err(ProtocolError::fatal)?;
        return Err(ProtocolError::Stale {
            recorded: record.start,
            current,
        });
    }
    let pubkey = snapshot
        .prove_info
        .service_prove
        .map(|p| p.tee_pubkey)
        .ok_or_else(|| ProtocolError::Transient("no TEE allocated to the service proof yet".to_string()))?;
    let worker = allocated_tee(ctx, &pubkey)?;

    record.tee_pubkey = Some(pubkey);
    ctx.records.save_service(record).map_err(ProtocolError::fatal)?;
    info!(tee = %worker.endpoint, "Service proof verifier allocated");
    Ok(worker)
}

fn check_batch_response(response: &BatchVerifyResponse) -> ProtocolResult<()> {
    if parse_tee_account(&response.tee_account_id).is_none() {
        return Err(ProtocolError::Fatal(format!(
            "TEE account id of {} bytes",
            response.tee_account_id.len()
        )));
    }
    check_signature("batch verify", &response.signature)?;
    if response.service_bloom_filter.len() > BLOOM_FILTER_LEN {
        return Err(ProtocolError::Fatal(format!(
            "bloom filter of {} words, at most {BLOOM_FILTER_LEN}",
            response.service_bloom_filter.len()
        )));
    }
    Ok(())
}

async fn verify_batches(
    ctx: &MinerContext,
    worker: &TeeWorker,
    record: &mut ServiceProofRecord,
    qslices: &[QElement],
) -> ProtocolResult<()> {
    let account = ctx.account();
    let tee = &*ctx.tee;
    for i in 0..record.batches.len() {
        if record.batches[i].verdict.is_some() {
            continue;
        }
        let batch = &record.batches[i];
        let request = BatchVerifyRequest {
            miner_id: account,
            agg_proof: AggregateProof {
                names: batch.names.clone(),
                us: batch.us.clone(),
                mus: batch.mus.clone(),
                sigma: batch.sigma.clone(),
            },
            qslices: qslices.to_vec(),
            u_sigs: batch.u_sigs.clone(),
            miner_sign: ctx.sign(&(account, record.start, i as u32, &batch.sigma).encode()),
        };
        let request = &request;
        let response = call_with_ladder(
            &ctx.config.timing.batch_verify,
            ctx.busy_sleep(),
            &worker.endpoint,
            "batch_verify",
            |timeout| tee.batch_verify(&worker.endpoint, timeout, request),
        )
        .await?;
        check_batch_response(&response)?;
        if !response.batch_verify_result {
            warn!(batch = i, "TEE rejected a service proof batch");
        }

        record.batches[i].verdict = Some(response);
        ctx.records.save_service(record).map_err(ProtocolError::fatal)?;
        debug!(batch = i, of = record.batches.len(), "Service batch verified");
    }
    Ok(())
}

/// Word-wise OR of the batch bloom filters.
fn merge_bloom_filters<'a>(filters: impl Iterator<Item = &'a [u64]>) -> Vec<u64> {
    let mut merged: Vec<u64> = Vec::new();
    for filter in filters {
        if filter.len() > merged.len() {
            merged.resize(filter.len(), 0);
        }
        for (word, bits) in merged.iter_mut().zip(filter) {
            *word |= bits;
        }
    }
    merged
}

/// Fold the batch verdicts into the final one.
async fn conclude(
    ctx: &MinerContext,
    worker: &TeeWorker,
    record: &mut ServiceProofRecord,
    qslices: &[QElement],
) -> ProtocolResult<()> {
    let history = record
        .batches
        .iter()
        .enumerate()
        .map(|(i, b)| {
            b.verdict
                .clone()
                .ok_or_else(|| ProtocolError::Fatal(format!("service batch {i} not verified")))
        })
        .collect::<ProtocolResult<Vec<_>>>()?;

    let result = history.iter().all(|v| v.batch_verify_result);
    let bloom_filter = merge_bloom_filters(history.iter().map(|v| v.service_bloom_filter.as_slice()));

    let (tee_account_id, signature) = match history.as_slice() {
        [single] => (single.tee_account_id.clone(), single.signature.clone()),
        _ => {
            let request = AggregateSignatureRequest {
                miner_id: ctx.account(),
                verify_history: history,
                qslices: qslices.to_vec(),
            };
            let tee = &*ctx.tee;
            let request = &request;
            let response = call_with_ladder(
                &ctx.config.timing.batch_verify,
                ctx.busy_sleep(),
                &worker.endpoint,
                "aggregate_signature",
                |timeout| tee.aggregate_signature(&worker.endpoint, timeout, request),
            )
            .await?;
            check_signature("aggregate signature", &response.signature)?;
            (response.tee_account_id, response.signature)
        }
    };
    let tee_puk = parse_tee_account(&tee_account_id).ok_or_else(|| {
        ProtocolError::Fatal(format!("TEE account id of {} bytes", tee_account_id.len()))
    })?;

    record.verdict = Some(ServiceVerdict {
        result,
        signature,
        bloom_filter,
        tee_puk,
    });
    ctx.records.save_service(record).map_err(ProtocolError::fatal)
}

async fn submit_result(ctx: &MinerContext, record: &ServiceProofRecord) -> ProtocolResult<()> {
    let verdict = record
        .verdict
        .as_ref()
        .ok_or_else(|| ProtocolError::Fatal("no service verdict to submit".to_string()))?;
    let result = ServiceProofResult {
        result: verdict.result,
        signature: verdict.signature.clone(),
        bloom_filter: verdict.bloom_filter.clone(),
        tee_puk: verdict.tee_puk,
    };

    let chain = &*ctx.chain;
    let start = record.start;
    let result = &result;
    submit_with_retry(
        ctx,
        "submit_service_proof_result",
        move || chain.submit_service_proof_result(result),
        move || async move {
            let snapshot = chain.query_challenge_snapshot().await?;
            Ok(snapshot.is_some_and(|s| {
                s.challenge_element.start == start
                    && s.prove_info.service_prove.is_some_and(|p| p.verify_result.is_some())
            }))
        },
    )
    .await
}
