//! Chain access for the miner.
//!
//! [`ChainClient`] is the narrow surface the protocols need: a handful of
//! storage queries and the extrinsics the miner signs. [`HttpChainClient`]
//! talks to a chain gateway that holds the miner's signing session and
//! relays extrinsics; it returns the transaction hash of each submission.

use anyhow::Result;
use async_trait::async_trait;
use common::{
    AccountId, ChallengeInfo, FileMetadata, IdleProofResult, IdleSpaceCertificate,
    MinerSpaceInfo, ServiceProofResult, SpaceProofInfo, TagReport, TeeWorker,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block(&self) -> Result<u32>;

    /// Certified accumulator status, `None` before the first certification.
    async fn query_space_proof_info(&self) -> Result<Option<SpaceProofInfo>>;

    /// The miner's current challenge, if one is open.
    async fn query_challenge_snapshot(&self) -> Result<Option<ChallengeInfo>>;

    /// Bytes of idle space the chain asks the miner to replace.
    async fn query_pending_replacements(&self) -> Result<u128>;

    async fn query_miner_space_info(&self) -> Result<MinerSpaceInfo>;

    async fn query_file_metadata(&self, fid: &str) -> Result<Option<FileMetadata>>;

    async fn query_tee_workers(&self) -> Result<Vec<TeeWorker>>;

    /// PKCS#1 DER public key the TEEs sign tags with.
    async fn query_podr2_public_key(&self) -> Result<Vec<u8>>;

    async fn cert_idle_space(&self, cert: &IdleSpaceCertificate) -> Result<String>;

    async fn replace_idle_space(&self, cert: &IdleSpaceCertificate) -> Result<String>;

    async fn submit_idle_proof(&self, idle_prove: &[u8]) -> Result<String>;

    async fn submit_idle_proof_result(&self, result: &IdleProofResult) -> Result<String>;

    async fn submit_service_proof(&self, service_prove: &[u8]) -> Result<String>;

    async fn submit_service_proof_result(&self, result: &ServiceProofResult) -> Result<String>;

    async fn generate_restoral_order(&self, fid: &str, fragment: &str) -> Result<String>;

    async fn report_file_tag(&self, report: &TagReport) -> Result<String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TxReceipt {
    tx_hash: String,
}

#[derive(Serialize)]
struct ProofBody<'a> {
    #[serde(with = "hex_bytes")]
    proof: &'a [u8],
}

#[derive(Serialize)]
struct RestoralBody<'a> {
    fid: &'a str,
    fragment: &'a str,
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &&[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }
}

/// Client for a chain gateway.
#[derive(Clone)]
pub struct HttpChainClient {
    base_url: String,
    account: String,
    client: reqwest::Client,
}

impl HttpChainClient {
    /// # Arguments
    /// * `base_url` - Gateway endpoint URL
    /// * `account` - Miner account the gateway signs for
    /// * `insecure_tls` - If true, skip TLS certificate verification (dev only)
    pub fn new(base_url: &str, account: &AccountId, insecure_tls: bool) -> Self {
        let mut builder = reqwest::Client::builder();

        if insecure_tls {
            warn!(
                "TLS certificate verification disabled for chain gateway. \
                 This is insecure and should only be used in development."
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            account: hex::encode(account),
            client,
        }
    }

    fn miner_url(&self, path: &str) -> String {
        format!("{}/miners/{}/{}", self.base_url, self.account, path)
    }

    /// GET a JSON value; 404 maps to `None`.
    async fn get_opt<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let resp = self.client.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("gateway query {url} failed: {status}: {body}");
        }
        Ok(Some(resp.json().await?))
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.get_opt(url)
            .await?
            .ok_or_else(|| anyhow::anyhow!("gateway query {url} returned nothing"))
    }

    async fn submit<B: Serialize + Sync + ?Sized>(&self, extrinsic: &str, body: &B) -> Result<String> {
        let url = format!("{}/extrinsics/{}", self.base_url, extrinsic);
        debug!(extrinsic, "Submitting extrinsic");

        let resp = self
            .client
            .post(&url)
            .header("X-Miner-Account", &self.account)
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("extrinsic {extrinsic} failed: {status}: {body}");
        }
        let receipt: TxReceipt = resp.json().await?;
        info!(extrinsic, tx = %receipt.tx_hash, "Extrinsic included");
        Ok(receipt.tx_hash)
    }
}

#[derive(Deserialize)]
struct BlockNumber {
    number: u32,
}

#[derive(Deserialize)]
struct PendingReplacements {
    bytes: u128,
}

#[derive(Deserialize)]
struct PublicKey {
    #[serde(deserialize_with = "hex_vec")]
    der: Vec<u8>,
}

fn hex_vec<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
    let s = String::deserialize(d)?;
    hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn latest_block(&self) -> Result<u32> {
        let block: BlockNumber = self
            .get(&format!("{}/blocks/latest", self.base_url))
            .await?;
        Ok(block.number)
    }

    async fn query_space_proof_info(&self) -> Result<Option<SpaceProofInfo>> {
        self.get_opt(&self.miner_url("space-proof")).await
    }

    async fn query_challenge_snapshot(&self) -> Result<Option<ChallengeInfo>> {
        self.get_opt(&self.miner_url("challenge")).await
    }

    async fn query_pending_replacements(&self) -> Result<u128> {
        let pending: Option<PendingReplacements> =
            self.get_opt(&self.miner_url("pending-replacements")).await?;
        Ok(pending.map(|p| p.bytes).unwrap_or(0))
    }

    async fn query_miner_space_info(&self) -> Result<MinerSpaceInfo> {
        self.get(&self.miner_url("space")).await
    }

    async fn query_file_metadata(&self, fid: &str) -> Result<Option<FileMetadata>> {
        self.get_opt(&format!("{}/files/{}", self.base_url, fid))
            .await
    }

    async fn query_tee_workers(&self) -> Result<Vec<TeeWorker>> {
        self.get(&format!("{}/tee-workers", self.base_url)).await
    }

    async fn query_podr2_public_key(&self) -> Result<Vec<u8>> {
        let key: PublicKey = self
            .get(&format!("{}/tee-workers/podr2-key", self.base_url))
            .await?;
        Ok(key.der)
    }

    async fn cert_idle_space(&self, cert: &IdleSpaceCertificate) -> Result<String> {
        self.submit("cert-idle-space", cert).await
    }

    async fn replace_idle_space(&self, cert: &IdleSpaceCertificate) -> Result<String> {
        self.submit("replace-idle-space", cert).await
    }

    async fn submit_idle_proof(&self, idle_prove: &[u8]) -> Result<String> {
        self.submit("submit-idle-proof", &ProofBody { proof: idle_prove })
            .await
    }

    async fn submit_idle_proof_result(&self, result: &IdleProofResult) -> Result<String> {
        self.submit("submit-idle-proof-result", result).await
    }

    async fn submit_service_proof(&self, service_prove: &[u8]) -> Result<String> {
        self.submit("submit-service-proof", &ProofBody { proof: service_prove })
            .await
    }

    async fn submit_service_proof_result(&self, result: &ServiceProofResult) -> Result<String> {
        self.submit("submit-verify-service-result", result).await
    }

    async fn generate_restoral_order(&self, fid: &str, fragment: &str) -> Result<String> {
        self.submit("generate-restoral-order", &RestoralBody { fid, fragment })
            .await
    }

    async fn report_file_tag(&self, report: &TagReport) -> Result<String> {
        self.submit("report-file-tag", report).await
    }
}
