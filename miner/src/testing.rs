//! In-memory chain and TEE doubles, and a harness wiring them into a
//! [`MinerContext`] over a temporary workspace.
//!
//! The TEE double really verifies what it is sent, with the pois verifier
//! and the podr2 test key, so protocol tests fail on malformed proofs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use common::{
    ChallengeElement, ChallengeInfo, FileMetadata, FragmentInfo, IdleProofResult,
    IdleSpaceCertificate, MinerSnapshot, MinerSpaceInfo, ProveRecord, SegmentInfo, ServiceParam,
    ServiceProofResult, SpaceProofInfo, TagReport, TeeRole, TeeWorker, WorkerPublicKey,
};
use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, MutexGuard};
use pois::challenge::aggregate_proof_hash;
use pois::verifier::{
    IdleFileParams, replay_ranges, verify_acc_proof, verify_commit_proofs, verify_deletion_proof,
    verify_space_proof,
};
use pois::{AccKey, AccumulatorProver, IdleCommit, LocalProver, proof_hash};
use podr2::testing::TestTee;
use podr2::{TagFile, split_by_n};
use tempfile::TempDir;

use crate::chain::ChainClient;
use crate::config::MinerConfig;
use crate::context::MinerContext;
use crate::registry::TeeRegistry;
use crate::state::ProofRecordStore;
use crate::tee::{
    AggregateSignatureRequest, AggregateSignatureResponse, BatchVerifyRequest,
    BatchVerifyResponse, CommitChallenge, CommitChallengeRequest, GenTagRequest, GenTagResponse,
    PoisStatus, SpaceTotalRequest, SpaceTotalResponse, SpaceVerifyRequest, SpaceVerifyResponse,
    StatusVerdict, TeeClient, TeeError, VerifyCommitRequest, VerifyDeletionRequest,
};
use crate::workspace::Workspace;

/// Blocks per fragment when the TEE double tags it.
pub const TAG_BLOCKS: usize = 4;

/// Public key of the harness's only registered TEE.
pub const TEE_PUBKEY: WorkerPublicKey = [1; 32];

pub fn tee_worker(id: u8, endpoint: &str, role: TeeRole) -> TeeWorker {
    TeeWorker {
        pubkey: [id; 32],
        endpoint: endpoint.to_string(),
        role,
    }
}

#[derive(Default)]
pub struct ChainState {
    pub block: u32,
    pub space_info: Option<SpaceProofInfo>,
    pub snapshot: Option<ChallengeInfo>,
    pub pending_replace: u128,
    pub miner_space: MinerSpaceInfo,
    pub files: HashMap<String, FileMetadata>,
    pub tee_workers: Vec<TeeWorker>,
    pub podr2_der: Vec<u8>,
    /// TEE the chain assigns to every submitted proof
    pub allocated_tee: WorkerPublicKey,

    pub certs: Vec<IdleSpaceCertificate>,
    pub replaced: Vec<IdleSpaceCertificate>,
    pub idle_proofs: Vec<Vec<u8>>,
    pub idle_results: Vec<IdleProofResult>,
    pub service_proofs: Vec<Vec<u8>>,
    pub service_results: Vec<ServiceProofResult>,
    pub restorals: Vec<(String, String)>,
    pub tag_reports: Vec<TagReport>,

    /// Remaining failures per extrinsic
    pub fail_submits: HashMap<&'static str, u32>,
    /// Failed submissions still take effect, as if only the response was lost
    pub apply_failed_submits: bool,
    pub fail_queries: bool,
}

#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock()
    }

    fn query(&self) -> Result<MutexGuard<'_, ChainState>> {
        let state = self.state.lock();
        if state.fail_queries {
            bail!("gateway unavailable");
        }
        Ok(state)
    }

    fn submit(&self, name: &'static str, apply: impl FnOnce(&mut ChainState)) -> Result<String> {
        let mut state = self.state.lock();
        let failing = match state.fail_submits.get_mut(name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        if failing {
            if state.apply_failed_submits {
                apply(&mut state);
            }
            bail!("{name} dropped from the pool");
        }
        apply(&mut state);
        Ok(format!("0x{name}"))
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn latest_block(&self) -> Result<u32> {
        Ok(self.query()?.block)
    }

    async fn query_space_proof_info(&self) -> Result<Option<SpaceProofInfo>> {
        Ok(self.query()?.space_info.clone())
    }

    async fn query_challenge_snapshot(&self) -> Result<Option<ChallengeInfo>> {
        Ok(self.query()?.snapshot.clone())
    }

    async fn query_pending_replacements(&self) -> Result<u128> {
        Ok(self.query()?.pending_replace)
    }

    async fn query_miner_space_info(&self) -> Result<MinerSpaceInfo> {
        Ok(self.query()?.miner_space)
    }

    async fn query_file_metadata(&self, fid: &str) -> Result<Option<FileMetadata>> {
        Ok(self.query()?.files.get(fid).cloned())
    }

    async fn query_tee_workers(&self) -> Result<Vec<TeeWorker>> {
        Ok(self.query()?.tee_workers.clone())
    }

    async fn query_podr2_public_key(&self) -> Result<Vec<u8>> {
        Ok(self.query()?.podr2_der.clone())
    }

    async fn cert_idle_space(&self, cert: &IdleSpaceCertificate) -> Result<String> {
        self.submit("cert_idle_space", |state| {
            state.space_info = Some(cert.space_proof_info.clone());
            state.certs.push(cert.clone());
        })
    }

    async fn replace_idle_space(&self, cert: &IdleSpaceCertificate) -> Result<String> {
        self.submit("replace_idle_space", |state| {
            state.space_info = Some(cert.space_proof_info.clone());
            state.pending_replace = 0;
            state.replaced.push(cert.clone());
        })
    }

    async fn submit_idle_proof(&self, idle_prove: &[u8]) -> Result<String> {
        self.submit("submit_idle_proof", |state| {
            let tee_pubkey = state.allocated_tee;
            if let Some(snapshot) = state.snapshot.as_mut() {
                snapshot.prove_info.idle_prove = Some(ProveRecord {
                    tee_pubkey,
                    proof: idle_prove.to_vec(),
                    verify_result: None,
                });
            }
            state.idle_proofs.push(idle_prove.to_vec());
        })
    }

    async fn submit_idle_proof_result(&self, result: &IdleProofResult) -> Result<String> {
        self.submit("submit_idle_proof_result", |state| {
            if let Some(prove) = state
                .snapshot
                .as_mut()
                .and_then(|s| s.prove_info.idle_prove.as_mut())
            {
                prove.verify_result = Some(result.result);
            }
            state.idle_results.push(result.clone());
        })
    }

    async fn submit_service_proof(&self, service_prove: &[u8]) -> Result<String> {
        self.submit("submit_service_proof", |state| {
            let tee_pubkey = state.allocated_tee;
            if let Some(snapshot) = state.snapshot.as_mut() {
                snapshot.prove_info.service_prove = Some(ProveRecord {
                    tee_pubkey,
                    proof: service_prove.to_vec(),
                    verify_result: None,
                });
            }
            state.service_proofs.push(service_prove.to_vec());
        })
    }

    async fn submit_service_proof_result(&self, result: &ServiceProofResult) -> Result<String> {
        self.submit("submit_service_proof_result", |state| {
            if let Some(prove) = state
                .snapshot
                .as_mut()
                .and_then(|s| s.prove_info.service_prove.as_mut())
            {
                prove.verify_result = Some(result.result);
            }
            state.service_results.push(result.clone());
        })
    }

    async fn generate_restoral_order(&self, fid: &str, fragment: &str) -> Result<String> {
        self.submit("generate_restoral_order", |state| {
            state.restorals.push((fid.to_string(), fragment.to_string()));
        })
    }

    async fn report_file_tag(&self, report: &TagReport) -> Result<String> {
        self.submit("report_file_tag", |state| {
            let block = state.block;
            if let Some(meta) = state.files.get_mut(&report.fid) {
                for fragment in meta.segments.iter_mut().flat_map(|s| s.fragments.iter_mut()) {
                    if report.fragments.contains(&fragment.hash) {
                        fragment.tag = Some(block);
                    }
                }
            }
            state.tag_reports.push(report.clone());
        })
    }
}

#[derive(Default)]
pub struct TeeState {
    pub calls: HashMap<&'static str, u32>,
    /// One-shot failure per method
    pub fail_next: HashMap<&'static str, TeeError>,
    /// `verify_commit` answers busy this many times
    pub busy_verifies: u32,
    pub short_signatures: bool,
    /// Single-block verifications left before the connection drops
    pub single_block_budget: Option<u32>,
    pub fail_gen_tag: bool,
    /// Certify a different accumulator than the one proved
    pub tamper_acc: bool,
    pub verified_commits: Vec<bool>,
    challenged: Option<IdleCommit>,
    batches_seen: u32,
}

impl TeeState {
    fn signature(&self) -> Vec<u8> {
        if self.short_signatures {
            vec![6; common::TEE_SIG_LEN - 1]
        } else {
            vec![6; common::TEE_SIG_LEN]
        }
    }

    fn certified(&self, mut acc: Vec<u8>) -> Vec<u8> {
        if self.tamper_acc {
            if let Some(byte) = acc.first_mut() {
                *byte ^= 0x80;
            }
        }
        acc
    }
}

pub struct MockTee {
    state: Mutex<TeeState>,
    key: AccKey,
    params: IdleFileParams,
    podr2: TestTee,
}

impl MockTee {
    pub fn new(params: IdleFileParams) -> Self {
        Self {
            state: Mutex::new(TeeState::default()),
            key: AccKey::test_key(),
            params,
            podr2: TestTee::new(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, TeeState> {
        self.state.lock()
    }

    pub fn calls(&self, method: &str) -> u32 {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn podr2(&self) -> &TestTee {
        &self.podr2
    }

    /// Count the call and apply any one-shot failure.
    fn begin(&self, method: &'static str) -> Result<MutexGuard<'_, TeeState>, TeeError> {
        let mut state = self.state.lock();
        *state.calls.entry(method).or_default() += 1;
        if let Some(e) = state.fail_next.remove(method) {
            return Err(e);
        }
        Ok(state)
    }
}

#[async_trait]
impl TeeClient for MockTee {
    async fn gen_challenge(
        &self,
        _endpoint: &str,
        _timeout: Duration,
        req: &CommitChallengeRequest,
    ) -> Result<CommitChallenge, TeeError> {
        let mut state = self.begin("gen_challenge")?;
        let last = self.params.chunks as i64 - 1;
        let rows = req.file_indexs.iter().map(|i| vec![*i, 0, 1, last]).collect();
        state.challenged = Some(IdleCommit {
            file_indexs: req.file_indexs.clone(),
            roots: req.roots.clone(),
        });
        Ok(CommitChallenge { rows })
    }

    async fn verify_commit(
        &self,
        _endpoint: &str,
        _timeout: Duration,
        req: &VerifyCommitRequest,
    ) -> Result<StatusVerdict, TeeError> {
        let mut state = self.begin("verify_commit")?;
        if state.busy_verifies > 0 {
            state.busy_verifies -= 1;
            return Err(TeeError::Busy);
        }
        let commit = state
            .challenged
            .clone()
            .ok_or_else(|| TeeError::Rejected("no challenge issued".into()))?;
        let acc = verify_commit_proofs(&self.params, &commit, &req.rows, &req.commit_proofs)
            .then(|| {
                verify_acc_proof(
                    &self.key,
                    self.params.elems_num,
                    &commit,
                    &req.acc_proof,
                    &req.status.acc,
                )
            })
            .flatten();
        state.verified_commits.push(acc.is_some());
        let acc = acc.ok_or_else(|| TeeError::Rejected("commit proof invalid".into()))?;
        Ok(StatusVerdict {
            status: PoisStatus {
                front: req.status.front,
                rear: req.status.rear + commit.len() as i64,
                acc: state.certified(acc),
            },
            status_tee_sign: state.signature(),
            signature_with_tee_controller: state.signature(),
        })
    }

    async fn verify_deletion(
        &self,
        _endpoint: &str,
        _timeout: Duration,
        req: &VerifyDeletionRequest,
    ) -> Result<StatusVerdict, TeeError> {
        let state = self.begin("verify_deletion")?;
        let acc = verify_deletion_proof(&self.key, req.status.front, &req.status.acc, &req.proof)
            .ok_or_else(|| TeeError::Rejected("deletion proof invalid".into()))?;
        Ok(StatusVerdict {
            status: PoisStatus {
                front: req.status.front + req.proof.roots.len() as i64,
                rear: req.status.rear,
                acc: state.certified(acc),
            },
            status_tee_sign: state.signature(),
            signature_with_tee_controller: state.signature(),
        })
    }

    async fn space_verify_single_block(
        &self,
        _endpoint: &str,
        _timeout: Duration,
        req: &SpaceVerifyRequest,
    ) -> Result<SpaceVerifyResponse, TeeError> {
        let mut state = self.begin("space_verify_single_block")?;
        match state.single_block_budget {
            Some(0) => return Err(TeeError::Transport("connection reset".into())),
            Some(left) => state.single_block_budget = Some(left - 1),
            None => {}
        }
        let hash_ok = proof_hash(&req.proof).is_ok_and(|h| h.as_slice() == req.proof_hash);
        if !hash_ok
            || !verify_space_proof(&self.key, &self.params, &req.space_chals, &req.status.acc, &req.proof)
        {
            return Err(TeeError::Rejected("space proof invalid".into()));
        }
        Ok(SpaceVerifyResponse {
            signature: state.signature(),
        })
    }

    async fn space_verify_total(
        &self,
        _endpoint: &str,
        _timeout: Duration,
        req: &SpaceTotalRequest,
    ) -> Result<SpaceTotalResponse, TeeError> {
        let state = self.begin("space_verify_total")?;
        let hashes: Vec<&[u8]> = req.proof_list.iter().map(|p| p.proof_hash.as_slice()).collect();
        let claimed: Vec<(i64, i64)> = req.proof_list.iter().map(|p| (p.left, p.right)).collect();
        let replayed = replay_ranges(
            &req.miner_id,
            &req.space_chals,
            req.status.front,
            req.status.rear,
            self.params.elems_num,
            &hashes,
        );
        let idle_result = replayed.as_ref() == Some(&claimed)
            && aggregate_proof_hash(&hashes).as_slice() == req.idle_prove;
        Ok(SpaceTotalResponse {
            idle_result,
            signature: state.signature(),
        })
    }

    async fn gen_tag(
        &self,
        _endpoint: &str,
        _timeout: Duration,
        req: &GenTagRequest,
    ) -> Result<GenTagResponse, TeeError> {
        let state = self.begin("gen_tag")?;
        if state.fail_gen_tag {
            return Err(TeeError::Rejected("tagging failed".into()));
        }
        let blocks = split_by_n(&req.fragment_data, TAG_BLOCKS)
            .map_err(|e| TeeError::Rejected(e.to_string()))?;
        Ok(GenTagResponse {
            tag: self.podr2.gen_tag(&req.fragment_name, &blocks),
            u_sig: vec![4; 64],
            signature: state.signature(),
        })
    }

    async fn batch_verify(
        &self,
        _endpoint: &str,
        _timeout: Duration,
        req: &BatchVerifyRequest,
    ) -> Result<BatchVerifyResponse, TeeError> {
        let mut state = self.begin("batch_verify")?;
        let proof = &req.agg_proof;
        let result = proof.names.is_empty()
            || self
                .podr2
                .verify_aggregate(&req.qslices, &proof.names, &proof.us, &proof.mus, &proof.sigma);
        let bloom = vec![1u64 << (state.batches_seen % 64)];
        state.batches_seen += 1;
        Ok(BatchVerifyResponse {
            batch_verify_result: result,
            tee_account_id: TEE_PUBKEY.to_vec(),
            service_bloom_filter: bloom,
            signature: state.signature(),
        })
    }

    async fn aggregate_signature(
        &self,
        _endpoint: &str,
        _timeout: Duration,
        req: &AggregateSignatureRequest,
    ) -> Result<AggregateSignatureResponse, TeeError> {
        let _state = self.begin("aggregate_signature")?;
        if req.verify_history.is_empty() {
            return Err(TeeError::Rejected("empty verify history".into()));
        }
        Ok(AggregateSignatureResponse {
            tee_account_id: TEE_PUBKEY.to_vec(),
            signature: vec![8; common::TEE_SIG_LEN],
        })
    }
}

pub struct Harness {
    pub ctx: Arc<MinerContext>,
    pub chain: Arc<MockChain>,
    pub tee: Arc<MockTee>,
    pub prover: Arc<LocalProver>,
    _dir: TempDir,
}

impl Harness {
    pub fn new(elems_num: i64) -> Self {
        Self::with_config(elems_num, |_| {})
    }

    /// Harness with idle groups of `elems_num` small files and no sleeps.
    pub fn with_config(elems_num: i64, adjust: impl FnOnce(&mut MinerConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = MinerConfig::default();
        config.node.data_dir = dir.path().display().to_string();
        config.pois.elems_num = elems_num;
        config.pois.chunk_size = 32;
        config.pois.chunks = 8;
        config.timing.block_interval_secs = 0;
        config.timing.busy_sleep_secs = 0;
        config.timing.poll_interval_secs = 0;
        config.timing.busy_backoff_secs = 0;
        config.timing.error_backoff_secs = 0;
        adjust(&mut config);

        let workspace = Workspace::create(dir.path()).unwrap();
        let signer = SigningKey::from_bytes(&[11; 32]);
        let account = signer.verifying_key().to_bytes();
        let prover = Arc::new(
            LocalProver::open(
                &workspace.idle_dir(),
                &account,
                AccKey::test_key(),
                config.pois.params(),
            )
            .unwrap(),
        );
        let tee = Arc::new(MockTee::new(prover.file_params()));
        let chain = Arc::new(MockChain::default());
        {
            let mut state = chain.state();
            state.block = 1;
            state.allocated_tee = TEE_PUBKEY;
            state.podr2_der = tee.podr2().public_key_der();
        }

        let registry = Arc::new(TeeRegistry::new());
        registry.upsert(tee_worker(1, "tee-1", TeeRole::Full));
        let records = Arc::new(ProofRecordStore::open(&workspace.record_db()).unwrap());

        let ctx = Arc::new(MinerContext {
            config: Arc::new(config),
            signer,
            chain: chain.clone(),
            tee: tee.clone(),
            prover: prover.clone(),
            podr2_key: tee.podr2().public_key(),
            registry,
            records,
            workspace,
        });

        Self {
            ctx,
            chain,
            tee,
            prover,
            _dir: dir,
        }
    }

    /// Generate and commit one idle set directly, and certify it on the chain double.
    pub fn commit_set(&self) {
        let prover = &self.prover;
        prover.generate_idle_file_set().unwrap();
        let commit = prover.get_idle_file_set_commits().unwrap();
        let rows: Vec<Vec<i64>> = commit.file_indexs.iter().map(|i| vec![*i, 0]).collect();
        prover.prove_commit_and_acc(&rows).unwrap().unwrap();
        prover.update_status(prover.elems_num(), false).unwrap();

        self.chain.state().space_info = Some(SpaceProofInfo {
            front: prover.front() as u64,
            rear: prover.rear() as u64,
            pois_key: prover.key().to_chain(),
            accumulator: prover.accumulator(),
        });
    }

    pub fn idle_file_exists(&self, index: i64) -> bool {
        self.ctx
            .workspace
            .idle_dir()
            .join("files")
            .join(format!("{index}.idle"))
            .exists()
    }

    /// Open a challenge at block `start` over the current accumulator.
    ///
    /// Proofs are due within `window` blocks, verification results within `2 * window`.
    pub fn open_challenge(&self, start: u32, window: u32) {
        let info = SpaceProofInfo {
            front: self.prover.front() as u64,
            rear: self.prover.rear() as u64,
            pois_key: self.prover.key().to_chain(),
            accumulator: self.prover.accumulator(),
        };
        let mut state = self.chain.state();
        state.block = start;
        state.snapshot = Some(ChallengeInfo {
            miner_snapshot: MinerSnapshot {
                space_proof_info: info,
                ..Default::default()
            },
            challenge_element: ChallengeElement {
                start,
                idle_slip: start + window,
                service_slip: start + window,
                verify_slip: start + 2 * window,
                space_param: vec![3, 11],
                service_param: ServiceParam {
                    random_index_list: vec![0, 2],
                    random_list: vec![vec![3], vec![5]],
                },
            },
            prove_info: Default::default(),
        });
    }

    /// Store a fragment of `fid` locally and assign it to this miner on chain.
    pub fn store_fragment(&self, fid: &str, fragment: &str, data: &[u8], tagged_at: Option<u32>) {
        let path = self.ctx.workspace.fragment_path(fid, fragment);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();

        let mut state = self.chain.state();
        let meta = state.files.entry(fid.to_string()).or_default();
        if meta.segments.is_empty() {
            meta.segments.push(SegmentInfo {
                hash: format!("{fid}-segment"),
                fragments: Vec::new(),
            });
        }
        meta.segments[0].fragments.push(FragmentInfo {
            hash: fragment.to_string(),
            miner: self.ctx.account(),
            tag: tagged_at,
        });
    }

    /// Write a valid tag file for a stored fragment.
    pub fn write_tag(&self, fid: &str, fragment: &str) {
        let data = std::fs::read(self.ctx.workspace.fragment_path(fid, fragment)).unwrap();
        let blocks = split_by_n(&data, TAG_BLOCKS).unwrap();
        let index = self.chain.state().files[fid].segments[0]
            .fragments
            .iter()
            .position(|f| f.hash == fragment)
            .unwrap() as u16;
        let tag = TagFile {
            tag: self.tee.podr2().gen_tag(fragment, &blocks),
            u_sig: vec![4; 64],
            signature: vec![6; common::TEE_SIG_LEN],
            fragment_name: fragment.to_string(),
            tee_account_id: TEE_PUBKEY.to_vec(),
            index,
        };
        tag.save(&self.ctx.workspace.tag_path(fid, fragment)).unwrap();
    }
}
