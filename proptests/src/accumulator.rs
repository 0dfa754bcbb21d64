//! Property-based tests for accumulator status ordering.
//!
//! Tests the following invariants:
//! - `front <= rear` after every accepted commit or deletion
//! - `rear` strictly increases across accepted commits
//! - `front` strictly increases across accepted deletions
//! - A rolled back operation leaves the status untouched

use pois::{AccKey, AccumulatorProver, LocalProver, PoisParams};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Commit,
    /// Delete up to this many elements, capped to what is deletable
    Delete(i64),
    /// Stage a commit, then drop it
    AbortedCommit,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Commit),
        2 => (1i64..=8).prop_map(Op::Delete),
        1 => Just(Op::AbortedCommit),
    ]
}

fn open_prover(dir: &TempDir, elems_num: i64) -> LocalProver {
    let params = PoisParams {
        elems_num,
        chunk_size: 32,
        chunks: 8,
    };
    LocalProver::open(dir.path(), &[9u8; 32], AccKey::test_key(), params).unwrap()
}

fn stage_commit(prover: &LocalProver) {
    if !prover.commit_ready() {
        prover.generate_idle_file_set().unwrap();
    }
    let commit = prover.get_idle_file_set_commits().unwrap();
    let rows: Vec<Vec<i64>> = commit.file_indexs.iter().map(|i| vec![*i, 0]).collect();
    prover.prove_commit_and_acc(&rows).unwrap().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_status_stays_ordered(
        elems_num in 2i64..=4,
        ops in prop::collection::vec(op_strategy(), 1..6),
    ) {
        let dir = TempDir::new().unwrap();
        let prover = open_prover(&dir, elems_num);

        for op in ops {
            let (front, rear) = (prover.front(), prover.rear());
            match op {
                Op::Commit => {
                    stage_commit(&prover);
                    prover.update_status(elems_num, false).unwrap();
                    prop_assert!(prover.rear() > rear, "rear did not grow");
                    prop_assert_eq!(prover.front(), front);
                }
                Op::Delete(want) => {
                    let num = want.min(elems_num - front % elems_num).min(rear - front);
                    if num == 0 {
                        continue;
                    }
                    let proof = prover.prove_deletion(num).unwrap();
                    prop_assert!(proof.is_complete());
                    prover.update_status(num, true).unwrap();
                    prop_assert!(prover.front() > front, "front did not grow");
                    prop_assert_eq!(prover.rear(), rear);
                }
                Op::AbortedCommit => {
                    let acc = prover.accumulator();
                    stage_commit(&prover);
                    prop_assert!(prover.commit_rollback());
                    prop_assert_eq!((prover.front(), prover.rear()), (front, rear));
                    prop_assert_eq!(prover.accumulator(), acc);
                }
            }
            prop_assert!(prover.front() <= prover.rear());
        }
    }

    /// Status survives a reopen of the idle directory.
    #[test]
    fn prop_status_persists(commits in 1usize..3, deleted in 0i64..=2) {
        let dir = TempDir::new().unwrap();
        let elems_num = 2;
        let (front, rear, acc) = {
            let prover = open_prover(&dir, elems_num);
            for _ in 0..commits {
                stage_commit(&prover);
                prover.update_status(elems_num, false).unwrap();
            }
            if deleted > 0 {
                prover.prove_deletion(deleted).unwrap();
                prover.update_status(deleted, true).unwrap();
            }
            (prover.front(), prover.rear(), prover.accumulator())
        };

        let reopened = open_prover(&dir, elems_num);
        prop_assert_eq!((reopened.front(), reopened.rear()), (front, rear));
        prop_assert_eq!(reopened.accumulator(), acc);
    }
}
