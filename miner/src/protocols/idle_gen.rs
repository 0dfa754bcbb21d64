//! Idle file generation: keep one batch of idle files ready for the commit
//! worker while the miner has declared space left to fill.

use common::{MinerSpaceInfo, SIZE_1GIB};
use tracing::{debug, info};

use super::blocking;
use crate::context::MinerContext;
use crate::error::{Progress, ProtocolError, ProtocolResult};

/// Whether another batch of `batch_bytes` fits both the configured limit
/// and the space declared on chain.
pub fn has_room(space: &MinerSpaceInfo, pending: u128, batch_bytes: u128, use_space: u128) -> bool {
    let occupied = space.occupied() + pending;
    occupied + batch_bytes <= use_space && space.declared_space > occupied
}

pub async fn run(ctx: &MinerContext) -> ProtocolResult<Progress> {
    if ctx.prover.commit_ready() {
        return Ok(Progress::Idle);
    }

    let space = ctx
        .chain
        .query_miner_space_info()
        .await
        .map_err(ProtocolError::transient)?;
    let pending = ctx
        .chain
        .query_pending_replacements()
        .await
        .map_err(ProtocolError::transient)?;
    let batch_bytes = ctx.idle_file_size() as u128 * ctx.prover.elems_num() as u128;
    let use_space = ctx.config.node.use_space_gib as u128 * SIZE_1GIB as u128;
    if !has_room(&space, pending, batch_bytes, use_space) {
        debug!(
            occupied = space.occupied(),
            pending,
            declared = space.declared_space,
            "No room for another idle file set"
        );
        return Ok(Progress::Idle);
    }

    let prover = ctx.prover.clone();
    let generated = blocking(move || prover.generate_idle_file_set()).await??;
    info!(generated, "Idle files ready for commit");
    Ok(Progress::Worked)
}
