//! Shared handles every protocol runs against.

use std::sync::Arc;
use std::time::Duration;

use common::AccountId;
use ed25519_dalek::{Signer, SigningKey};
use pois::AccumulatorProver;
use podr2::RsaKey;

use crate::chain::ChainClient;
use crate::config::MinerConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::registry::TeeRegistry;
use crate::state::ProofRecordStore;
use crate::tee::TeeClient;
use crate::workspace::Workspace;

pub struct MinerContext {
    pub config: Arc<MinerConfig>,
    pub signer: SigningKey,
    pub chain: Arc<dyn ChainClient>,
    pub tee: Arc<dyn TeeClient>,
    pub prover: Arc<dyn AccumulatorProver>,
    /// TEE tag key, for checking tag attestations
    pub podr2_key: RsaKey,
    pub registry: Arc<TeeRegistry>,
    pub records: Arc<ProofRecordStore>,
    pub workspace: Workspace,
}

impl MinerContext {
    pub fn account(&self) -> AccountId {
        self.signer.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signer.sign(message).to_bytes().to_vec()
    }

    /// Bytes of one idle file.
    pub fn idle_file_size(&self) -> u64 {
        self.config.pois.params().file_size()
    }

    pub async fn sleep_blocks(&self, blocks: u32) {
        let interval = self.config.timing.block_interval();
        tokio::time::sleep(interval * blocks).await;
    }

    pub fn busy_sleep(&self) -> Duration {
        self.config.timing.busy_sleep()
    }

    pub async fn latest_block(&self) -> ProtocolResult<u32> {
        self.chain
            .latest_block()
            .await
            .map_err(ProtocolError::transient)
    }
}
