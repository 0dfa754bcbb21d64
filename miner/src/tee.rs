//! TEE verifier requests and the client that sends them.
//!
//! The protocols only see [`TeeClient`]; [`HttpTeeClient`] posts the
//! messages as JSON to `<endpoint>/<method>`. Each call carries its own
//! timeout so the caller can escalate it between attempts.

use std::time::Duration;

use async_trait::async_trait;
use common::{AccountId, WorkerPublicKey};
use pois::{AccProof, CommitProof, DeletionProof, SpaceProof};
use podr2::{QElement, Tag};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TeeError {
    #[error("TEE is busy")]
    Busy,
    #[error("TEE call deadline exceeded")]
    DeadlineExceeded,
    #[error("TEE transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Rejected(String),
}

/// Accumulator status as the TEE reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisStatus {
    pub front: i64,
    pub rear: i64,
    pub acc: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitChallengeRequest {
    pub miner_id: AccountId,
    pub file_indexs: Vec<i64>,
    pub roots: Vec<Vec<u8>>,
    pub miner_sign: Vec<u8>,
}

/// Challenged chunks per file: `[file_index, chunk, chunk, ...]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitChallenge {
    pub rows: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyCommitRequest {
    pub miner_id: AccountId,
    pub status: PoisStatus,
    pub rows: Vec<Vec<i64>>,
    pub commit_proofs: Vec<Vec<CommitProof>>,
    pub acc_proof: AccProof,
    pub miner_sign: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyDeletionRequest {
    pub miner_id: AccountId,
    pub status: PoisStatus,
    pub proof: DeletionProof,
    pub miner_sign: Vec<u8>,
}

/// Answer to a commit or deletion verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusVerdict {
    pub status: PoisStatus,
    /// Signature over the new status
    pub status_tee_sign: Vec<u8>,
    pub signature_with_tee_controller: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceVerifyRequest {
    pub miner_id: AccountId,
    pub space_chals: Vec<i64>,
    pub status: PoisStatus,
    pub proof: SpaceProof,
    pub proof_hash: Vec<u8>,
    pub miner_sign: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceVerifyResponse {
    pub signature: Vec<u8>,
}

/// A verified range as sent back in the total verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksProof {
    pub left: i64,
    pub right: i64,
    pub proof_hash: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceTotalRequest {
    pub miner_id: AccountId,
    pub space_chals: Vec<i64>,
    pub status: PoisStatus,
    pub idle_prove: Vec<u8>,
    pub proof_list: Vec<BlocksProof>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceTotalResponse {
    pub idle_result: bool,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenTagRequest {
    pub miner_id: AccountId,
    pub file_id: String,
    pub fragment_name: String,
    pub fragment_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenTagResponse {
    pub tag: Tag,
    pub u_sig: Vec<u8>,
    /// Signature the chain checks when the tag is reported
    pub signature: Vec<u8>,
}

/// Fragment proofs folded into one σ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateProof {
    pub names: Vec<String>,
    pub us: Vec<String>,
    pub mus: Vec<String>,
    pub sigma: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchVerifyRequest {
    pub miner_id: AccountId,
    pub agg_proof: AggregateProof,
    pub qslices: Vec<QElement>,
    pub u_sigs: Vec<Vec<u8>>,
    pub miner_sign: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchVerifyResponse {
    pub batch_verify_result: bool,
    pub tee_account_id: Vec<u8>,
    pub service_bloom_filter: Vec<u64>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSignatureRequest {
    pub miner_id: AccountId,
    pub verify_history: Vec<BatchVerifyResponse>,
    pub qslices: Vec<QElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSignatureResponse {
    pub tee_account_id: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Calls a TEE verifier makes available to miners.
#[async_trait]
pub trait TeeClient: Send + Sync {
    async fn gen_challenge(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &CommitChallengeRequest,
    ) -> Result<CommitChallenge, TeeError>;

    async fn verify_commit(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &VerifyCommitRequest,
    ) -> Result<StatusVerdict, TeeError>;

    async fn verify_deletion(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &VerifyDeletionRequest,
    ) -> Result<StatusVerdict, TeeError>;

    async fn space_verify_single_block(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &SpaceVerifyRequest,
    ) -> Result<SpaceVerifyResponse, TeeError>;

    async fn space_verify_total(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &SpaceTotalRequest,
    ) -> Result<SpaceTotalResponse, TeeError>;

    async fn gen_tag(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &GenTagRequest,
    ) -> Result<GenTagResponse, TeeError>;

    async fn batch_verify(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &BatchVerifyRequest,
    ) -> Result<BatchVerifyResponse, TeeError>;

    async fn aggregate_signature(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &AggregateSignatureRequest,
    ) -> Result<AggregateSignatureResponse, TeeError>;
}

/// JSON over HTTP client for TEE endpoints.
#[derive(Clone)]
pub struct HttpTeeClient {
    scheme: String,
    client: reqwest::Client,
}

impl HttpTeeClient {
    /// # Arguments
    /// * `scheme` - Scheme used for endpoints registered as bare `host:port`
    /// * `insecure_tls` - If true, skip TLS certificate verification (dev only)
    pub fn new(scheme: &str, insecure_tls: bool) -> Self {
        let mut builder = reqwest::Client::builder();

        if insecure_tls {
            warn!(
                "TLS certificate verification disabled for TEE endpoints. \
                 This is insecure and should only be used in development."
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().unwrap_or_else(|_| reqwest::Client::new());

        Self {
            scheme: scheme.trim_end_matches("://").to_string(),
            client,
        }
    }

    fn url(&self, endpoint: &str, method: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        if endpoint.contains("://") {
            format!("{endpoint}/{method}")
        } else {
            format!("{}://{endpoint}/{method}", self.scheme)
        }
    }

    async fn call<Req, Resp>(
        &self,
        endpoint: &str,
        method: &str,
        timeout: Duration,
        req: &Req,
    ) -> Result<Resp, TeeError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(endpoint, method);
        debug!(url = %url, timeout_secs = timeout.as_secs(), "Calling TEE");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(req)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => resp.json::<Resp>().await.map_err(|e| {
                if e.is_timeout() {
                    TeeError::DeadlineExceeded
                } else {
                    TeeError::Transport(format!("undecodable {method} response: {e}"))
                }
            }),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(classify_status(status, &body))
            }
            Err(e) if e.is_timeout() => Err(TeeError::DeadlineExceeded),
            Err(e) => Err(TeeError::Transport(e.to_string())),
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> TeeError {
    if status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::TOO_MANY_REQUESTS
        || body.to_lowercase().contains("busy")
    {
        TeeError::Busy
    } else if status == StatusCode::GATEWAY_TIMEOUT || body.contains("context deadline exceeded") {
        TeeError::DeadlineExceeded
    } else {
        TeeError::Rejected(format!("{status}: {body}"))
    }
}

#[async_trait]
impl TeeClient for HttpTeeClient {
    async fn gen_challenge(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &CommitChallengeRequest,
    ) -> Result<CommitChallenge, TeeError> {
        self.call(endpoint, "pois/commit-challenge", timeout, req)
            .await
    }

    async fn verify_commit(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &VerifyCommitRequest,
    ) -> Result<StatusVerdict, TeeError> {
        self.call(endpoint, "pois/verify-commit", timeout, req).await
    }

    async fn verify_deletion(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &VerifyDeletionRequest,
    ) -> Result<StatusVerdict, TeeError> {
        self.call(endpoint, "pois/verify-deletion", timeout, req)
            .await
    }

    async fn space_verify_single_block(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &SpaceVerifyRequest,
    ) -> Result<SpaceVerifyResponse, TeeError> {
        self.call(endpoint, "pois/verify-space", timeout, req).await
    }

    async fn space_verify_total(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &SpaceTotalRequest,
    ) -> Result<SpaceTotalResponse, TeeError> {
        self.call(endpoint, "pois/verify-space-total", timeout, req)
            .await
    }

    async fn gen_tag(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &GenTagRequest,
    ) -> Result<GenTagResponse, TeeError> {
        self.call(endpoint, "podr2/gen-tag", timeout, req).await
    }

    async fn batch_verify(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &BatchVerifyRequest,
    ) -> Result<BatchVerifyResponse, TeeError> {
        self.call(endpoint, "podr2/batch-verify", timeout, req).await
    }

    async fn aggregate_signature(
        &self,
        endpoint: &str,
        timeout: Duration,
        req: &AggregateSignatureRequest,
    ) -> Result<AggregateSignatureResponse, TeeError> {
        self.call(endpoint, "podr2/aggregate-signature", timeout, req)
            .await
    }
}

/// TEE account ids in responses must be worker public keys.
pub fn parse_tee_account(bytes: &[u8]) -> Option<WorkerPublicKey> {
    common::to_worker_public_key(bytes)
}
