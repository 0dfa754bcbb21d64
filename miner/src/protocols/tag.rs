//! Tag calculation: get a PoDR2 tag from a marker TEE for every stored
//! fragment that lacks one, then report the file's tags on chain.

use std::collections::BTreeMap;

use common::{FileMetadata, TagReport, WorkerPublicKey};
use podr2::TagFile;
use tracing::{debug, info, warn};

use super::{blocking, check_signature, first_answer, marker_candidates, submit_with_retry};
use crate::constants::TAG_PROGRESS_EVERY;
use crate::context::MinerContext;
use crate::error::{Progress, ProtocolError, ProtocolResult};
use crate::tee::{GenTagRequest, parse_tee_account};

/// Check a cached or freshly returned tag against the TEE tag key.
pub(crate) fn check_tag(ctx: &MinerContext, tag: &TagFile) -> Result<(), String> {
    let t = &tag.tag.t;
    if t.phi.is_empty() {
        return Err("tag has no block authenticators".to_string());
    }
    if !tag.tag.phi_hash_matches() {
        return Err("phi hash does not match the authenticators".to_string());
    }
    match ctx
        .podr2_key
        .verify_attest(&t.name, &t.u, &tag.tag.phi_hash, &tag.tag.attest, "")
    {
        Ok(true) => Ok(()),
        Ok(false) => Err("attestation does not verify".to_string()),
        Err(e) => Err(format!("attestation unreadable: {e}")),
    }
}

/// Load the cached tag of a fragment, if present and valid.
pub(crate) async fn load_valid_tag(ctx: &MinerContext, fid: &str, fragment: &str) -> Option<TagFile> {
    let path = ctx.workspace.tag_path(fid, fragment);
    let loaded = blocking(move || TagFile::load(&path)).await.ok()?;
    match loaded {
        Ok(tag) => match check_tag(ctx, &tag) {
            Ok(()) => Some(tag),
            Err(reason) => {
                warn!(fid, fragment, reason, "Cached tag is invalid");
                None
            }
        },
        Err(podr2::Podr2Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(fid, fragment, error = %e, "Cached tag is corrupt");
            None
        }
    }
}

/// Compute the tag of one fragment through a marker TEE and cache it.
///
/// Any stale tag file is replaced.
pub async fn calc_fragment_tag(
    ctx: &MinerContext,
    fid: &str,
    fragment: &str,
    index: u16,
) -> ProtocolResult<TagFile> {
    let data = tokio::fs::read(ctx.workspace.fragment_path(fid, fragment))
        .await
        .map_err(|e| ProtocolError::Fatal(format!("fragment {fragment} unreadable: {e}")))?;
    let data_len = data.len();

    let request = GenTagRequest {
        miner_id: ctx.account(),
        file_id: fid.to_string(),
        fragment_name: fragment.to_string(),
        fragment_data: data,
    };
    let candidates = marker_candidates(ctx);
    let tee = &*ctx.tee;
    let request = &request;
    let (worker, response) = first_answer(
        ctx,
        &candidates,
        &ctx.config.timing.gen_tag,
        "gen_tag",
        move |endpoint, timeout| async move { tee.gen_tag(&endpoint, timeout, request).await },
    )
    .await
    .ok_or_else(|| ProtocolError::Fatal(format!("no TEE tagged fragment {fragment}")))?;

    check_signature("gen tag", &response.signature)?;
    let tag = TagFile {
        tag: response.tag,
        u_sig: response.u_sig,
        signature: response.signature,
        fragment_name: fragment.to_string(),
        tee_account_id: worker.pubkey.to_vec(),
        index,
    };
    check_tag(ctx, &tag).map_err(|reason| ProtocolError::Fatal(format!("tag of {fragment}: {reason}")))?;
    let blocks = tag.tag.t.phi.len();
    if data_len % blocks != 0 {
        return Err(ProtocolError::Fatal(format!(
            "fragment {fragment} of {data_len} bytes does not split into {blocks} blocks"
        )));
    }

    let path = ctx.workspace.tag_path(fid, fragment);
    let saved = tag.clone();
    blocking(move || saved.save(&path)).await??;
    debug!(fid, fragment, tee = %worker.endpoint, blocks, "Fragment tagged");
    Ok(tag)
}

pub async fn run(ctx: &MinerContext) -> ProtocolResult<Progress> {
    let fids = ctx.workspace.list_files().map_err(ProtocolError::fatal)?;
    let mut progress = Progress::Idle;
    for fid in fids {
        let Some(meta) = ctx
            .chain
            .query_file_metadata(&fid)
            .await
            .map_err(ProtocolError::transient)?
        else {
            debug!(fid, "File not on chain, skipping");
            continue;
        };
        if tag_file(ctx, &fid, &meta).await? {
            progress = Progress::Worked;
        }
    }
    Ok(progress)
}

/// Tag every fragment of one file and report the untagged ones on chain.
/// Returns whether anything was tagged or reported.
async fn tag_file(ctx: &MinerContext, fid: &str, meta: &FileMetadata) -> ProtocolResult<bool> {
    let account = ctx.account();
    let mut reports: BTreeMap<WorkerPublicKey, TagReport> = BTreeMap::new();
    let mut tagged = 0usize;

    for (index, fragment) in meta.fragments_of(&account) {
        if !ctx.workspace.fragment_path(fid, &fragment.hash).exists() {
            debug!(fid, fragment = %fragment.hash, "Fragment not stored locally");
            continue;
        }
        let tag = match load_valid_tag(ctx, fid, &fragment.hash).await {
            Some(tag) => tag,
            None => match calc_fragment_tag(ctx, fid, &fragment.hash, index).await {
                Ok(tag) => {
                    tagged += 1;
                    if tagged % TAG_PROGRESS_EVERY == 0 {
                        info!(fid, tagged, "Tagging in progress");
                    }
                    tag
                }
                Err(e) => {
                    warn!(fid, fragment = %fragment.hash, error = %e, "Tag calculation failed");
                    continue;
                }
            },
        };

        if fragment.tag.is_some() {
            continue;
        }
        let Some(tee_puk) = parse_tee_account(&tag.tee_account_id) else {
            warn!(fid, fragment = %fragment.hash, "Tag carries an invalid TEE account");
            continue;
        };
        let report = reports.entry(tee_puk).or_insert_with(|| TagReport {
            fid: fid.to_string(),
            fragments: Vec::new(),
            tee_puk,
            signatures: Vec::new(),
        });
        report.fragments.push(fragment.hash.clone());
        report.signatures.push(tag.signature.clone());
    }

    let reported = !reports.is_empty();
    for report in reports.values() {
        report_tags(ctx, report).await?;
    }
    if tagged > 0 || reported {
        info!(fid, tagged, reports = reports.len(), "File tags processed");
    }
    Ok(tagged > 0 || reported)
}

async fn report_tags(ctx: &MinerContext, report: &TagReport) -> ProtocolResult<()> {
    let chain = &*ctx.chain;
    let account = ctx.account();
    let account = &account;
    submit_with_retry(
        ctx,
        "report_file_tag",
        move || chain.report_file_tag(report),
        move || async move {
            let Some(meta) = chain.query_file_metadata(&report.fid).await? else {
                return Ok(false);
            };
            Ok(meta
                .fragments_of(account)
                .filter(|(_, f)| report.fragments.contains(&f.hash))
                .all(|(_, f)| f.tag.is_some()))
        },
    )
    .await
}
