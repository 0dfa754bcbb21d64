//! Keep the TEE registry in line with the chain's worker list.

use tracing::{debug, info};

use crate::context::MinerContext;
use crate::error::{Progress, ProtocolError, ProtocolResult};

pub async fn run(ctx: &MinerContext) -> ProtocolResult<Progress> {
    let workers = ctx
        .chain
        .query_tee_workers()
        .await
        .map_err(ProtocolError::transient)?;
    let (upserted, removed) = ctx.registry.replace_all(workers);
    if removed > 0 {
        info!(upserted, removed, total = ctx.registry.len(), "TEE registry refreshed");
    } else {
        debug!(total = ctx.registry.len(), "TEE registry refreshed");
    }
    Ok(Progress::Idle)
}
