//! Chain storage values and extrinsic payloads.
//!
//! These mirror what the chain gateway returns for the miner's account. They
//! are plain serde types so the HTTP chain adapter can pass them through and
//! tests can build them directly.

use serde::{Deserialize, Serialize};

use crate::WORKER_PUBLIC_KEY_LEN;

/// TEE worker public key as stored on chain.
pub type WorkerPublicKey = [u8; WORKER_PUBLIC_KEY_LEN];

/// Miner (or any) account identifier.
pub type AccountId = [u8; 32];

/// RSA accumulator public parameters registered for the miner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisKey {
    pub g: Vec<u8>,
    pub n: Vec<u8>,
}

/// Certified accumulator status of the miner's idle space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceProofInfo {
    pub front: u64,
    pub rear: u64,
    pub pois_key: PoisKey,
    pub accumulator: Vec<u8>,
}

/// Miner state frozen at the moment a challenge was issued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerSnapshot {
    pub idle_space: u128,
    pub service_space: u128,
    pub space_proof_info: SpaceProofInfo,
    /// TEE signature over `space_proof_info`
    pub tee_signature: Vec<u8>,
}

/// Service challenge parameters: block indices and their random coefficients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParam {
    pub random_index_list: Vec<u32>,
    pub random_list: Vec<Vec<u8>>,
}

/// Challenge element published on chain for one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeElement {
    /// Challenge epoch identifier (start block)
    pub start: u32,
    /// Last block at which the idle proof may be submitted
    pub idle_slip: u32,
    /// Last block at which the service proof may be submitted
    pub service_slip: u32,
    /// Last block at which verification results may be submitted
    pub verify_slip: u32,
    pub space_param: Vec<u64>,
    pub service_param: ServiceParam,
}

/// A proof the chain has already recorded for this challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProveRecord {
    /// TEE allocated by the chain to verify the proof
    pub tee_pubkey: WorkerPublicKey,
    pub proof: Vec<u8>,
    pub verify_result: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProveInfo {
    pub idle_prove: Option<ProveRecord>,
    pub service_prove: Option<ProveRecord>,
}

/// Full challenge snapshot for the miner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeInfo {
    pub miner_snapshot: MinerSnapshot,
    pub challenge_element: ChallengeElement,
    pub prove_info: ProveInfo,
}

/// Declared and certified space of the miner, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerSpaceInfo {
    pub declared_space: u128,
    pub idle_space: u128,
    pub service_space: u128,
    pub lock_space: u128,
}

impl MinerSpaceInfo {
    /// Space already certified or reserved.
    pub fn occupied(&self) -> u128 {
        self.idle_space + self.service_space + self.lock_space
    }
}

/// One fragment of a user file segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentInfo {
    pub hash: String,
    pub miner: AccountId,
    /// Block at which the fragment's tag was reported, if any
    pub tag: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub hash: String,
    pub fragments: Vec<FragmentInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub segments: Vec<SegmentInfo>,
}

impl FileMetadata {
    /// Fragments assigned to `miner` with their position in the segment.
    pub fn fragments_of<'a>(
        &'a self,
        miner: &'a AccountId,
    ) -> impl Iterator<Item = (u16, &'a FragmentInfo)> + 'a {
        self.segments
            .iter()
            .flat_map(|segment| segment.fragments.iter().enumerate())
            .filter(move |(_, fragment)| &fragment.miner == miner)
            .map(|(index, fragment)| (index as u16, fragment))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeeRole {
    /// Verifies and marks
    Full,
    Verifier,
    Marker,
}

impl TeeRole {
    pub fn can_mark(&self) -> bool {
        matches!(self, TeeRole::Full | TeeRole::Marker)
    }

    pub fn can_verify(&self) -> bool {
        matches!(self, TeeRole::Full | TeeRole::Verifier)
    }
}

/// A registered TEE worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeeWorker {
    pub pubkey: WorkerPublicKey,
    pub endpoint: String,
    pub role: TeeRole,
}

/// Payload of `CertIdleSpace` and `ReplaceIdleSpace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleSpaceCertificate {
    pub space_proof_info: SpaceProofInfo,
    /// TEE signature over the new status
    pub tee_sig_need_verify: Vec<u8>,
    /// TEE controller signature
    pub tee_sig: Vec<u8>,
    pub tee_puk: WorkerPublicKey,
}

/// Payload of `SubmitIdleProofResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleProofResult {
    pub idle_prove: Vec<u8>,
    pub front: u64,
    pub rear: u64,
    pub accumulator: Vec<u8>,
    pub result: bool,
    pub signature: Vec<u8>,
    pub tee_puk: WorkerPublicKey,
}

/// Payload of `SubmitVerifyServiceResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProofResult {
    pub result: bool,
    pub signature: Vec<u8>,
    pub bloom_filter: Vec<u64>,
    pub tee_puk: WorkerPublicKey,
}

/// Payload of `ReportFileTag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagReport {
    pub fid: String,
    pub fragments: Vec<String>,
    pub tee_puk: WorkerPublicKey,
    pub signatures: Vec<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(hash: &str, miner: u8, tag: Option<u32>) -> FragmentInfo {
        FragmentInfo {
            hash: hash.to_string(),
            miner: [miner; 32],
            tag,
        }
    }

    #[test]
    fn test_fragments_of_filters_by_miner() {
        let meta = FileMetadata {
            segments: vec![
                SegmentInfo {
                    hash: "s0".to_string(),
                    fragments: vec![fragment("a", 1, Some(5)), fragment("b", 2, None)],
                },
                SegmentInfo {
                    hash: "s1".to_string(),
                    fragments: vec![fragment("c", 1, None)],
                },
            ],
        };

        let mine: Vec<_> = meta
            .fragments_of(&[1u8; 32])
            .map(|(index, f)| (index, f.hash.as_str()))
            .collect();
        assert_eq!(mine, vec![(0, "a"), (0, "c")]);
    }

    #[test]
    fn test_tee_roles() {
        assert!(TeeRole::Full.can_mark() && TeeRole::Full.can_verify());
        assert!(TeeRole::Marker.can_mark() && !TeeRole::Marker.can_verify());
        assert!(!TeeRole::Verifier.can_mark() && TeeRole::Verifier.can_verify());
    }

    #[test]
    fn test_challenge_info_json_shape() {
        let info = ChallengeInfo::default();
        let json = serde_json::to_string(&info).unwrap();
        let back: ChallengeInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_occupied_space() {
        let info = MinerSpaceInfo {
            declared_space: 100,
            idle_space: 10,
            service_space: 20,
            lock_space: 5,
        };
        assert_eq!(info.occupied(), 35);
    }
}
