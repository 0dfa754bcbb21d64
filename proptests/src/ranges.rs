//! Property-based tests for challenge range partitioning.
//!
//! Tests the following invariants:
//! - Ranges cover `[front+1, rear+1)` without gaps or overlaps
//! - No range crosses a level-0 group boundary
//! - The handle terminates and never depends on proof hash contents

use crate::strategies::*;
use pois::ChallengeHandle;
use pois::challenge::ranges;
use pois::verifier::replay_ranges;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Consecutive ranges tile the committed window exactly.
    #[test]
    fn prop_ranges_partition_window((front, rear, elems) in window_strategy()) {
        let ranges = ranges(front, rear, elems);

        let mut next = front + 1;
        for (left, right) in &ranges {
            prop_assert_eq!(*left, next, "gap or overlap before {}", left);
            prop_assert!(left < right, "empty range ({}, {})", left, right);
            next = *right;
        }
        prop_assert_eq!(next, rear + 1, "window not fully covered");
        prop_assert_eq!(ranges.is_empty(), front == rear);
    }

    /// Every range stays inside one level-0 group.
    #[test]
    fn prop_ranges_stay_in_group((front, rear, elems) in window_strategy()) {
        for (left, right) in ranges(front, rear, elems) {
            let first_group = (left - 1) / elems;
            let last_group = (right - 2) / elems;
            prop_assert_eq!(first_group, last_group, "range ({}, {}) crosses a group", left, right);
        }
    }

    /// A handle keyed by any miner and seeds yields the same ranges for any hashes.
    #[test]
    fn prop_handle_ranges_ignore_hash_contents(
        (front, rear, elems) in window_strategy(),
        tee_id in hash_strategy(),
        seeds in seeds_strategy(),
        fill in any::<u8>(),
    ) {
        let expected = ranges(front, rear, elems);
        let hashes = vec![[fill; 32]; expected.len()];

        let replayed = replay_ranges(&tee_id, &seeds, front, rear, elems, &hashes);
        prop_assert_eq!(replayed, Some(expected));
    }

    /// Once exhausted, a handle keeps returning an empty range.
    #[test]
    fn prop_handle_terminates(
        (front, rear, elems) in window_strategy(),
        seeds in seeds_strategy(),
    ) {
        let mut handle = ChallengeHandle::new(b"miner", &seeds, front, rear, elems);
        let mut prev: Option<[u8; 32]> = None;
        let mut steps = 0;
        loop {
            let (left, right) = handle.next_range(prev.as_ref().map(|h| h.as_slice())).unwrap();
            if left == right {
                break;
            }
            steps += 1;
            prop_assert!(steps <= rear - front, "handle did not terminate");
            prev = Some([steps as u8; 32]);
        }
        let (left, right) = handle.next_range(Some(&[0u8; 32])).unwrap();
        prop_assert_eq!(left, right);
    }
}
