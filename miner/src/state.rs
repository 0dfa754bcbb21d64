//! Persistent proof records (sled).
//!
//! One active record per challenge side, keyed by the challenge start
//! block it belongs to. Every externally visible step of a protocol
//! overwrites the record wholesale, so a restarted miner resumes at the
//! next step instead of recomputing proofs a TEE or the chain already
//! accepted. A record whose start differs from the chain's current
//! challenge is discarded, never resumed.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use common::WorkerPublicKey;
use pois::SpaceProof;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::tee::BatchVerifyResponse;

/// Sled tree names
const IDLE_PROOF_TREE: &str = "idle_proof";
const SERVICE_PROOF_TREE: &str = "service_proof";
const CHALLENGE_RANDOM_TREE: &str = "challenge_random";
const ACTIVE_KEY: &[u8] = b"active";

/// One proved range of the idle log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IdleRangeProof {
    pub left: i64,
    pub right: i64,
    pub proof: SpaceProof,
    pub proof_hash: Vec<u8>,
    pub miner_sign: Vec<u8>,
    /// TEE signature once the range is verified
    pub tee_sign: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IdleVerdict {
    pub result: bool,
    pub signature: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IdleProofRecord {
    /// Challenge start block
    pub start: u32,
    pub seeds: Vec<i64>,
    pub front: i64,
    pub rear: i64,
    pub accumulator: Vec<u8>,
    pub ranges: Vec<IdleRangeProof>,
    /// Hash over every range proof hash, in range order
    pub idle_prove: Vec<u8>,
    pub tee_pubkey: Option<WorkerPublicKey>,
    pub verdict: Option<IdleVerdict>,
    pub proof_submitted: bool,
    pub result_submitted: bool,
}

impl IdleProofRecord {
    pub fn unverified_ranges(&self) -> usize {
        self.ranges.iter().filter(|r| r.tee_sign.is_none()).count()
    }
}

/// Fragments verified together in one TEE request.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceBatch {
    pub names: Vec<String>,
    pub us: Vec<String>,
    pub mus: Vec<String>,
    pub u_sigs: Vec<Vec<u8>>,
    pub sigma: String,
    pub verdict: Option<BatchVerifyResponse>,
}

impl ServiceBatch {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServiceVerdict {
    pub result: bool,
    pub signature: Vec<u8>,
    pub bloom_filter: Vec<u64>,
    pub tee_puk: WorkerPublicKey,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServiceProofRecord {
    pub start: u32,
    /// σ over every challenged fragment
    pub sigma: String,
    pub batches: Vec<ServiceBatch>,
    pub tee_pubkey: Option<WorkerPublicKey>,
    pub verdict: Option<ServiceVerdict>,
    pub proof_submitted: bool,
    pub result_submitted: bool,
}

/// Service challenge randomness kept per epoch for audit and replay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChallengeRandom {
    pub start: u32,
    pub random_index_list: Vec<u32>,
    pub random_list: Vec<Vec<u8>>,
}

pub struct ProofRecordStore {
    db: sled::Db,
    idle_tree: sled::Tree,
    service_tree: sled::Tree,
    random_tree: sled::Tree,
}

impl ProofRecordStore {
    /// Open sled database and the record trees.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = open_db(db_path)?;
        let idle_tree = db.open_tree(IDLE_PROOF_TREE)?;
        let service_tree = db.open_tree(SERVICE_PROOF_TREE)?;
        let random_tree = db.open_tree(CHALLENGE_RANDOM_TREE)?;

        info!(
            path = %db_path.display(),
            idle_record = idle_tree.contains_key(ACTIVE_KEY)?,
            service_record = service_tree.contains_key(ACTIVE_KEY)?,
            randoms = random_tree.len(),
            "Proof record store opened"
        );

        Ok(Self {
            db,
            idle_tree,
            service_tree,
            random_tree,
        })
    }

    fn load<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8], what: &str) -> Option<T> {
        match tree.get(key) {
            Ok(Some(bytes)) => match bincode::deserialize::<T>(&bytes) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(record = what, error = %e, "Skipping corrupted record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(record = what, error = %e, "Error reading record from database");
                None
            }
        }
    }

    fn store<T: Serialize>(&self, tree: &sled::Tree, key: &[u8], value: &T) -> anyhow::Result<()> {
        let bytes = bincode::serialize(value)?;
        tree.insert(key, bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_idle(&self) -> Option<IdleProofRecord> {
        Self::load(&self.idle_tree, ACTIVE_KEY, "idle_proof")
    }

    pub fn save_idle(&self, record: &IdleProofRecord) -> anyhow::Result<()> {
        self.store(&self.idle_tree, ACTIVE_KEY, record)?;
        debug!(start = record.start, "Idle proof record saved");
        Ok(())
    }

    pub fn clear_idle(&self) -> anyhow::Result<()> {
        self.idle_tree.remove(ACTIVE_KEY)?;
        self.db.flush()?;
        Ok(())
    }

    /// The idle record of challenge `start`, discarding one left from another challenge.
    pub fn current_idle(&self, start: u32) -> anyhow::Result<Option<IdleProofRecord>> {
        match self.load_idle() {
            Some(record) if record.start == start => Ok(Some(record)),
            Some(record) => {
                info!(recorded = record.start, current = start, "Discarding stale idle proof record");
                self.clear_idle()?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn load_service(&self) -> Option<ServiceProofRecord> {
        Self::load(&self.service_tree, ACTIVE_KEY, "service_proof")
    }

    pub fn save_service(&self, record: &ServiceProofRecord) -> anyhow::Result<()> {
        self.store(&self.service_tree, ACTIVE_KEY, record)?;
        debug!(start = record.start, "Service proof record saved");
        Ok(())
    }

    pub fn clear_service(&self) -> anyhow::Result<()> {
        self.service_tree.remove(ACTIVE_KEY)?;
        self.db.flush()?;
        Ok(())
    }

    /// The service record of challenge `start`, discarding one left from another challenge.
    pub fn current_service(&self, start: u32) -> anyhow::Result<Option<ServiceProofRecord>> {
        match self.load_service() {
            Some(record) if record.start == start => Ok(Some(record)),
            Some(record) => {
                info!(recorded = record.start, current = start, "Discarding stale service proof record");
                self.clear_service()?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn save_challenge_random(&self, random: &ChallengeRandom) -> anyhow::Result<()> {
        self.store(&self.random_tree, &random.start.to_be_bytes(), random)
    }

    pub fn load_challenge_random(&self, start: u32) -> Option<ChallengeRandom> {
        Self::load(&self.random_tree, &start.to_be_bytes(), "challenge_random")
    }
}

/// Attempts to take the database lock before giving up.
const LOCK_ATTEMPTS: u32 = 40;
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Open the database, waiting out a lock still held by a store that is
/// being dropped. Sled releases its file lock only once its background
/// flusher has exited.
fn open_db(db_path: &Path) -> sled::Result<sled::Db> {
    let mut attempt = 1;
    loop {
        match sled::open(db_path) {
            Err(sled::Error::Io(e)) if is_lock_contention(&e) && attempt < LOCK_ATTEMPTS => {
                debug!(path = %db_path.display(), attempt, "Proof record store locked, retrying");
                attempt += 1;
                std::thread::sleep(LOCK_RETRY);
            }
            result => return result,
        }
    }
}

// Sled reports a held lock as a plain I/O error naming the lock.
fn is_lock_contention(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.to_string().contains("could not acquire lock")
}

impl Drop for ProofRecordStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            warn!(error = %e, "Failed to flush proof records on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn idle_record(start: u32) -> IdleProofRecord {
        IdleProofRecord {
            start,
            seeds: vec![1, 2, 3],
            front: 0,
            rear: 8,
            accumulator: vec![9; 4],
            ranges: Vec::new(),
            idle_prove: vec![7; 32],
            tee_pubkey: None,
            verdict: None,
            proof_submitted: true,
            result_submitted: false,
        }
    }

    fn service_record(start: u32) -> ServiceProofRecord {
        ServiceProofRecord {
            start,
            sigma: "12345".to_string(),
            batches: vec![ServiceBatch {
                names: vec!["frag".to_string()],
                us: vec!["2".to_string()],
                mus: vec!["3".to_string()],
                u_sigs: vec![vec![1; 64]],
                sigma: "12345".to_string(),
                verdict: None,
            }],
            tee_pubkey: Some([4; 32]),
            verdict: None,
            proof_submitted: false,
            result_submitted: false,
        }
    }

    #[test]
    fn test_idle_record_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records");
        {
            let store = ProofRecordStore::open(&path).unwrap();
            store.save_idle(&idle_record(1000)).unwrap();
        }
        let store = ProofRecordStore::open(&path).unwrap();
        assert_eq!(store.load_idle(), Some(idle_record(1000)));
    }

    #[test]
    fn test_reopen_waits_for_released_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records");
        let first = ProofRecordStore::open(&path).unwrap();
        first.save_idle(&idle_record(7)).unwrap();

        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            drop(first);
        });
        let second = ProofRecordStore::open(&path).unwrap();
        closer.join().unwrap();

        assert_eq!(second.load_idle(), Some(idle_record(7)));
    }

    #[test]
    fn test_stale_idle_record_discarded() {
        let dir = TempDir::new().unwrap();
        let store = ProofRecordStore::open(&dir.path().join("records")).unwrap();
        store.save_idle(&idle_record(900)).unwrap();

        assert!(store.current_idle(1000).unwrap().is_none());
        assert!(store.load_idle().is_none());
    }

    #[test]
    fn test_current_record_kept() {
        let dir = TempDir::new().unwrap();
        let store = ProofRecordStore::open(&dir.path().join("records")).unwrap();
        store.save_service(&service_record(1000)).unwrap();

        assert_eq!(store.current_service(1000).unwrap(), Some(service_record(1000)));
        assert!(store.current_service(1001).unwrap().is_none());
        assert!(store.load_service().is_none());
    }

    #[test]
    fn test_corrupted_record_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let store = ProofRecordStore::open(&dir.path().join("records")).unwrap();
        store.idle_tree.insert(ACTIVE_KEY, &b"not bincode"[..]).unwrap();
        assert!(store.load_idle().is_none());
        assert!(store.current_idle(5).unwrap().is_none());
    }

    #[test]
    fn test_challenge_randoms_kept_per_start() {
        let dir = TempDir::new().unwrap();
        let store = ProofRecordStore::open(&dir.path().join("records")).unwrap();
        for start in [10u32, 20] {
            store
                .save_challenge_random(&ChallengeRandom {
                    start,
                    random_index_list: vec![start, start + 1],
                    random_list: vec![vec![1; 20], vec![2; 20]],
                })
                .unwrap();
        }
        assert_eq!(store.load_challenge_random(10).unwrap().random_index_list, vec![10, 11]);
        assert_eq!(store.load_challenge_random(20).unwrap().random_index_list, vec![20, 21]);
        assert!(store.load_challenge_random(30).is_none());
    }
}
