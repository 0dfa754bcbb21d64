//! Property-based tests for proof record resumption.
//!
//! Tests the following invariants:
//! - A record is resumed only by the challenge that wrote it
//! - A record from any other challenge is discarded outright
//! - Checkpoints survive reopening the store unchanged

use miner::state::{IdleProofRecord, ProofRecordStore, ServiceProofRecord};
use proptest::prelude::*;
use tempfile::TempDir;

fn idle_record(start: u32, proof_submitted: bool) -> IdleProofRecord {
    IdleProofRecord {
        start,
        seeds: vec![3, 11],
        front: 0,
        rear: 512,
        accumulator: vec![7; common::ACCUMULATOR_LEN],
        ranges: Vec::new(),
        idle_prove: vec![1; 32],
        tee_pubkey: Some([1; 32]),
        verdict: None,
        proof_submitted,
        result_submitted: false,
    }
}

fn service_record(start: u32) -> ServiceProofRecord {
    ServiceProofRecord {
        start,
        sigma: "42".to_string(),
        batches: Vec::new(),
        tee_pubkey: None,
        verdict: None,
        proof_submitted: true,
        result_submitted: false,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_stale_records_discarded(
        recorded in any::<u32>(),
        current in any::<u32>(),
        proof_submitted in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let store = ProofRecordStore::open(&dir.path().join("records")).unwrap();
        let idle = idle_record(recorded, proof_submitted);
        store.save_idle(&idle).unwrap();
        store.save_service(&service_record(recorded)).unwrap();

        let resumed_idle = store.current_idle(current).unwrap();
        let resumed_service = store.current_service(current).unwrap();

        if recorded == current {
            prop_assert_eq!(resumed_idle, Some(idle));
            prop_assert_eq!(resumed_service, Some(service_record(recorded)));
        } else {
            prop_assert_eq!(resumed_idle, None);
            prop_assert_eq!(resumed_service, None);
            // Discarded for good, not just hidden from this challenge
            prop_assert!(store.load_idle().is_none());
            prop_assert!(store.current_idle(recorded).unwrap().is_none());
        }
    }

    #[test]
    fn prop_checkpoint_survives_reopen(start in any::<u32>(), proof_submitted in any::<bool>()) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records");
        let record = idle_record(start, proof_submitted);
        {
            let store = ProofRecordStore::open(&path).unwrap();
            store.save_idle(&record).unwrap();
        }

        let store = ProofRecordStore::open(&path).unwrap();
        prop_assert_eq!(store.current_idle(start).unwrap(), Some(record));
    }
}
