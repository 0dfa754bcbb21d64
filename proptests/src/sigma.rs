//! Property-based tests for service proof aggregation.
//!
//! Tests the following invariants:
//! - Folding σ values gives the same aggregate in any order
//! - Splitting a fold into batches and folding the batch results agrees
//!   with one flat fold

use crate::strategies::*;
use podr2::RsaKey;
use podr2::testing::TestTee;
use proptest::prelude::*;

fn fold(key: &RsaKey, sigmas: &[String]) -> String {
    sigmas
        .iter()
        .try_fold(String::new(), |agg, sigma| key.aggr_append_proof(&agg, sigma))
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_aggregation_is_order_independent(
        sigmas in prop::collection::vec(sigma_strategy(), 1..12),
        rotate in any::<prop::sample::Index>(),
    ) {
        let key = TestTee::new().public_key();

        let mut reversed = sigmas.clone();
        reversed.reverse();
        let mut rotated = sigmas.clone();
        rotated.rotate_left(rotate.index(sigmas.len()));

        let expected = fold(&key, &sigmas);
        prop_assert_eq!(fold(&key, &reversed), expected.clone());
        prop_assert_eq!(fold(&key, &rotated), expected);
    }

    #[test]
    fn prop_batched_aggregation_matches_flat(
        sigmas in prop::collection::vec(sigma_strategy(), 1..24),
        batch_size in 1usize..6,
    ) {
        let key = TestTee::new().public_key();

        let batch_sigmas: Vec<String> = sigmas.chunks(batch_size).map(|b| fold(&key, b)).collect();
        prop_assert_eq!(fold(&key, &batch_sigmas), fold(&key, &sigmas));
    }

    #[test]
    fn prop_malformed_sigma_rejected(garbage in "[a-z]{1,8}") {
        let key = TestTee::new().public_key();
        prop_assert!(key.aggr_append_proof("", &garbage).is_err());
    }
}
