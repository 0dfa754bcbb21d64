//! Disk-backed accumulator prover.
//!
//! `LocalProver` owns the idle-file log and the accumulator over its
//! committed window `(front, rear]`. Commits and deletions are two-phase:
//! a proof stages the new accumulator, and `update_status` adopts it once
//! the TEE and the chain have accepted it. Until then the prover reports
//! itself busy to any other proof that would mutate the accumulator.
//!
//! Space challenges run against a separate snapshot primed with
//! `set_challenge_state`, so a commit certified mid-challenge does not
//! change the accumulator being proven.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::acc::{AccKey, AccTree, same_acc};
use crate::challenge::ChallengeHandle;
use crate::hash::{Digest, challenged_chunk, element};
use crate::idle::IdleStore;
use crate::types::{AccProof, CommitProof, DeletionProof, IdleCommit, SpaceProof};
use crate::verifier::IdleFileParams;
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_ELEMS_NUM, DEFAULT_FILE_CHUNKS, PoisError, Result};

const STATUS_FILE: &str = "pois-status.bin";

/// Shape of the idle-file log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisParams {
    /// Elements per group and per commit
    pub elems_num: i64,
    pub chunk_size: usize,
    pub chunks: usize,
}

impl Default for PoisParams {
    fn default() -> Self {
        Self {
            elems_num: DEFAULT_ELEMS_NUM,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks: DEFAULT_FILE_CHUNKS,
        }
    }
}

impl PoisParams {
    /// Bytes of one idle file.
    pub fn file_size(&self) -> u64 {
        (self.chunk_size * self.chunks) as u64
    }
}

/// Operations the miner's protocols drive on the accumulator.
///
/// Proof generation is CPU and disk bound; async callers should run these
/// methods on a blocking thread.
pub trait AccumulatorProver: Send + Sync {
    fn elems_num(&self) -> i64;

    fn front(&self) -> i64;

    fn rear(&self) -> i64;

    /// Highest generated idle file index.
    fn generated(&self) -> i64;

    /// Serialized accumulator of the committed window.
    fn accumulator(&self) -> Vec<u8>;

    fn key(&self) -> AccKey;

    /// Whether a full batch of generated files awaits commitment.
    fn commit_ready(&self) -> bool;

    /// Generate the next batch of idle files, returning the new generated watermark.
    fn generate_idle_file_set(&self) -> Result<i64>;

    /// Move local watermarks forward to a chain-certified status.
    fn sync_chain_pois_status(&self, front: i64, rear: i64) -> Result<()>;

    /// Next uncommitted batch.
    fn get_idle_file_set_commits(&self) -> Result<IdleCommit>;

    /// Answer a TEE commit challenge and stage the grown accumulator.
    ///
    /// `Ok(None)` means another operation holds the prover.
    fn prove_commit_and_acc(
        &self,
        rows: &[Vec<i64>],
    ) -> Result<Option<(Vec<Vec<CommitProof>>, AccProof)>>;

    /// Drop a staged commit. Returns whether one was staged.
    fn commit_rollback(&self) -> bool;

    /// Adopt a verified commit or deletion of `num` elements.
    fn update_status(&self, num: i64, is_deletion: bool) -> Result<()>;

    /// Drop a staged commit or deletion. Returns whether one of that kind was staged.
    fn acc_rollback(&self, is_deletion: bool) -> bool;

    /// Prime space proofs against a challenged accumulator snapshot.
    fn set_challenge_state(&self, key: AccKey, acc: &[u8], front: i64, rear: i64) -> Result<()>;

    /// Range iterator over the primed challenge window.
    fn new_challenge_handle(&self, tee_id: &[u8], seeds: &[i64]) -> Result<ChallengeHandle>;

    fn prove_space(&self, seeds: &[i64], left: i64, right: i64) -> Result<SpaceProof>;

    /// Prove removal of the oldest `num` elements and stage the shrunk accumulator.
    fn prove_deletion(&self, num: i64) -> Result<DeletionProof>;

    /// Remove idle files that left the accumulator. Returns how many were removed.
    fn delete_files(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProverStatus {
    front: i64,
    rear: i64,
    generated: i64,
    acc: Vec<u8>,
    /// Merkle roots of idle files still on disk
    roots: BTreeMap<i64, Digest>,
}

enum Pending {
    Commit { rear: i64, tree: AccTree },
    Deletion { front: i64, tree: AccTree },
}

struct ChallengeState {
    front: i64,
    rear: i64,
    tree: AccTree,
    roots: BTreeMap<i64, Digest>,
}

struct ProverState {
    status: ProverStatus,
    tree: AccTree,
    pending: Option<Pending>,
    challenge: Option<Arc<ChallengeState>>,
}

pub struct LocalProver {
    params: PoisParams,
    key: AccKey,
    store: IdleStore,
    status_path: PathBuf,
    state: Mutex<ProverState>,
    /// Held while a proof is computed; contention means busy
    work: Mutex<()>,
    generating: Mutex<()>,
}

impl LocalProver {
    /// Open (or initialise) the prover in `dir`.
    pub fn open(dir: &Path, miner_id: &[u8], key: AccKey, params: PoisParams) -> Result<Self> {
        if params.elems_num <= 0 {
            return Err(PoisError::InvalidParams(format!(
                "elems_num must be positive, got {}",
                params.elems_num
            )));
        }
        let store = IdleStore::open(dir, miner_id, params.chunk_size, params.chunks)?;
        let status_path = dir.join(STATUS_FILE);

        let mut status = match fs::read(&status_path) {
            Ok(bytes) => bincode::deserialize::<ProverStatus>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProverStatus {
                acc: key.empty_acc(),
                ..Default::default()
            },
            Err(e) => return Err(e.into()),
        };

        let tree = build_tree(&key, params.elems_num, &status.roots, status.front, status.rear)?;
        if !same_acc(&tree.accumulator(), &status.acc) {
            warn!(
                front = status.front,
                rear = status.rear,
                "Persisted accumulator differs from rebuilt one, using rebuilt"
            );
        }
        status.acc = tree.accumulator();

        info!(
            front = status.front,
            rear = status.rear,
            generated = status.generated,
            "Accumulator prover opened"
        );

        Ok(Self {
            params,
            key,
            store,
            status_path,
            state: Mutex::new(ProverState {
                status,
                tree,
                pending: None,
                challenge: None,
            }),
            work: Mutex::new(()),
            generating: Mutex::new(()),
        })
    }

    pub fn params(&self) -> PoisParams {
        self.params
    }

    /// Public parameters a verifier needs to check this prover's proofs.
    pub fn file_params(&self) -> IdleFileParams {
        IdleFileParams {
            seed: *self.store.seed(),
            chunk_size: self.params.chunk_size,
            chunks: self.params.chunks,
            elems_num: self.params.elems_num,
        }
    }

    fn persist(&self, status: &ProverStatus) -> Result<()> {
        let bytes = bincode::serialize(status)?;
        let tmp = self.status_path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.status_path)?;
        Ok(())
    }

    fn next_commit(&self, status: &ProverStatus) -> Result<IdleCommit> {
        let elems_num = self.params.elems_num;
        if status.generated < status.rear + elems_num {
            return Err(PoisError::NothingToCommit {
                generated: status.generated,
                rear: status.rear,
            });
        }
        let mut commit = IdleCommit::default();
        for index in status.rear + 1..=status.rear + elems_num {
            let root = status
                .roots
                .get(&index)
                .ok_or(PoisError::ElementMissing(index))?;
            commit.file_indexs.push(index);
            commit.roots.push(root.to_vec());
        }
        Ok(commit)
    }

    fn check_chunk(&self, chunk: i64) -> Result<usize> {
        if chunk < 0 || chunk as usize >= self.params.chunks {
            return Err(PoisError::ChunkIndexOutOfBounds {
                index: chunk,
                max: self.params.chunks as i64 - 1,
            });
        }
        Ok(chunk as usize)
    }
}

fn build_tree(
    key: &AccKey,
    elems_num: i64,
    roots: &BTreeMap<i64, Digest>,
    front: i64,
    rear: i64,
) -> Result<AccTree> {
    let mut tree = AccTree::new(key.clone(), elems_num);
    extend_tree(&mut tree, roots, front + 1, rear)?;
    Ok(tree)
}

/// Accumulate elements `from..=to`, one level-0 group at a time.
fn extend_tree(
    tree: &mut AccTree,
    roots: &BTreeMap<i64, Digest>,
    from: i64,
    to: i64,
) -> Result<()> {
    let mut batch: Vec<(i64, Digest)> = Vec::new();
    for index in from..=to {
        let root = roots.get(&index).ok_or(PoisError::ElementMissing(index))?;
        if batch
            .last()
            .is_some_and(|(last, _)| tree.group_of(*last) != tree.group_of(index))
        {
            tree.insert_group(&batch)?;
            batch.clear();
        }
        batch.push((index, element(index, root)));
    }
    tree.insert_group(&batch)
}

impl AccumulatorProver for LocalProver {
    fn elems_num(&self) -> i64 {
        self.params.elems_num
    }

    fn front(&self) -> i64 {
        self.state.lock().status.front
    }

    fn rear(&self) -> i64 {
        self.state.lock().status.rear
    }

    fn generated(&self) -> i64 {
        self.state.lock().status.generated
    }

    fn accumulator(&self) -> Vec<u8> {
        self.state.lock().status.acc.clone()
    }

    fn key(&self) -> AccKey {
        self.key.clone()
    }

    fn commit_ready(&self) -> bool {
        let state = self.state.lock();
        state.status.generated >= state.status.rear + self.params.elems_num
    }

    fn generate_idle_file_set(&self) -> Result<i64> {
        let _generating = self.generating.lock();
        let start = self.state.lock().status.generated + 1;
        let end = start + self.params.elems_num - 1;

        let mut roots = Vec::with_capacity(self.params.elems_num as usize);
        for index in start..=end {
            roots.push((index, self.store.generate(index)?));
        }

        let mut state = self.state.lock();
        state.status.roots.extend(roots);
        state.status.generated = end;
        self.persist(&state.status)?;
        info!(from = start, to = end, "Idle file set generated");
        Ok(end)
    }

    fn sync_chain_pois_status(&self, front: i64, rear: i64) -> Result<()> {
        let mut state = self.state.lock();
        let (local_front, local_rear) = (state.status.front, state.status.rear);
        if front <= local_front && rear <= local_rear {
            if (front, rear) != (local_front, local_rear) {
                debug!(front, rear, local_front, local_rear, "Chain status behind local");
            }
            return Ok(());
        }

        let new_front = front.max(local_front);
        let new_rear = rear.max(local_rear);
        if new_front > new_rear || new_rear > state.status.generated {
            return Err(PoisError::SyncFailed {
                front,
                rear,
                reason: format!(
                    "local front={local_front} rear={local_rear} generated={}",
                    state.status.generated
                ),
            });
        }
        let tree = build_tree(
            &self.key,
            self.params.elems_num,
            &state.status.roots,
            new_front,
            new_rear,
        )
        .map_err(|e| PoisError::SyncFailed {
            front,
            rear,
            reason: e.to_string(),
        })?;

        state.pending = None;
        state.status.front = new_front;
        state.status.rear = new_rear;
        state.status.acc = tree.accumulator();
        state.tree = tree;
        self.persist(&state.status)?;
        warn!(
            local_front,
            local_rear,
            front = new_front,
            rear = new_rear,
            "Local accumulator synced to chain status"
        );
        Ok(())
    }

    fn get_idle_file_set_commits(&self) -> Result<IdleCommit> {
        let state = self.state.lock();
        self.next_commit(&state.status)
    }

    fn prove_commit_and_acc(
        &self,
        rows: &[Vec<i64>],
    ) -> Result<Option<(Vec<Vec<CommitProof>>, AccProof)>> {
        let Some(_work) = self.work.try_lock() else {
            debug!("Commit proof skipped, prover busy");
            return Ok(None);
        };
        let (commit, tree) = {
            let state = self.state.lock();
            if state.pending.is_some() {
                debug!("Commit proof skipped, another update is staged");
                return Ok(None);
            }
            (self.next_commit(&state.status)?, state.tree.clone())
        };
        if rows.len() != commit.len() {
            return Err(PoisError::InvalidChallenge(format!(
                "{} rows for a batch of {}",
                rows.len(),
                commit.len()
            )));
        }

        let mut proofs = Vec::with_capacity(rows.len());
        for row in rows {
            let (&file_index, chunks) = row
                .split_first()
                .ok_or_else(|| PoisError::InvalidChallenge("empty row".to_string()))?;
            let pos = commit
                .file_indexs
                .iter()
                .position(|i| *i == file_index)
                .ok_or_else(|| {
                    PoisError::InvalidChallenge(format!("file {file_index} not in batch"))
                })?;
            let (labels, mtree) = self.store.open_file(file_index, &commit.roots[pos])?;

            let mut row_proofs = Vec::with_capacity(chunks.len());
            for &chunk in chunks {
                let c = self.check_chunk(chunk)?;
                let node = mtree.proof(c, &labels[c])?;
                let (parents, elders) = if c == 0 {
                    (Vec::new(), Vec::new())
                } else {
                    (
                        vec![mtree.proof(c - 1, &labels[c - 1])?],
                        vec![mtree.proof(c / 2, &labels[c / 2])?],
                    )
                };
                row_proofs.push(CommitProof {
                    node,
                    parents,
                    elders,
                });
            }
            proofs.push(row_proofs);
        }

        let elements: Vec<(i64, Digest)> = commit
            .file_indexs
            .iter()
            .zip(&commit.roots)
            .map(|(i, root)| (*i, element(*i, root)))
            .collect();
        let mut staged = tree.clone();
        staged.insert_group(&elements)?;
        let first = commit.file_indexs[0];
        let new_rear = commit.file_indexs[commit.len() - 1];

        let acc_proof = AccProof {
            indexs: commit.file_indexs.clone(),
            elements: elements.iter().map(|(_, e)| e.to_vec()).collect(),
            wit_chain: staged.upper_chain(staged.group_of(first))?,
            acc_path: vec![tree.accumulator(), staged.accumulator()],
        };

        self.state.lock().pending = Some(Pending::Commit {
            rear: new_rear,
            tree: staged,
        });
        debug!(from = first, to = new_rear, "Commit proof staged");
        Ok(Some((proofs, acc_proof)))
    }

    fn commit_rollback(&self) -> bool {
        self.acc_rollback(false)
    }

    fn update_status(&self, num: i64, is_deletion: bool) -> Result<()> {
        if num <= 0 {
            return Err(PoisError::InvalidParams(format!(
                "status update of {num} elements"
            )));
        }
        let mut state = self.state.lock();
        let pending = state.pending.take();

        let tree = if is_deletion {
            let front = state.status.front + num;
            if front > state.status.rear {
                let committed = state.status.rear - state.status.front;
                state.pending = pending;
                return Err(PoisError::InvalidDeletion {
                    num,
                    reason: format!("only {committed} elements committed"),
                });
            }
            let tree = match pending {
                Some(Pending::Deletion { front: staged, tree }) if staged == front => tree,
                _ => {
                    let mut tree = state.tree.clone();
                    tree.remove_through(front);
                    tree
                }
            };
            state.status.front = front;
            tree
        } else {
            let rear = state.status.rear + num;
            if rear > state.status.generated {
                state.pending = pending;
                return Err(PoisError::NothingToCommit {
                    generated: state.status.generated,
                    rear: state.status.rear,
                });
            }
            let tree = match pending {
                Some(Pending::Commit { rear: staged, tree }) if staged == rear => tree,
                _ => {
                    let mut tree = state.tree.clone();
                    extend_tree(&mut tree, &state.status.roots, state.status.rear + 1, rear)?;
                    tree
                }
            };
            state.status.rear = rear;
            tree
        };

        state.status.acc = tree.accumulator();
        state.tree = tree;
        self.persist(&state.status)?;
        info!(
            front = state.status.front,
            rear = state.status.rear,
            num,
            is_deletion,
            "Accumulator status updated"
        );
        Ok(())
    }

    fn acc_rollback(&self, is_deletion: bool) -> bool {
        let mut state = self.state.lock();
        let matches = matches!(
            (&state.pending, is_deletion),
            (Some(Pending::Deletion { .. }), true) | (Some(Pending::Commit { .. }), false)
        );
        if matches {
            state.pending = None;
            info!(is_deletion, "Staged accumulator update rolled back");
        }
        matches
    }

    fn set_challenge_state(&self, key: AccKey, acc: &[u8], front: i64, rear: i64) -> Result<()> {
        if front > rear {
            return Err(PoisError::InvalidChallenge(format!(
                "front {front} beyond rear {rear}"
            )));
        }
        let (roots, cached) = {
            let state = self.state.lock();
            let mut roots = BTreeMap::new();
            for index in front + 1..=rear {
                let root = state.status.roots.get(&index).ok_or_else(|| {
                    PoisError::InvalidChallenge(format!("idle file {index} is no longer held"))
                })?;
                roots.insert(index, *root);
            }
            let cached = (state.status.front == front
                && state.status.rear == rear
                && key == self.key)
                .then(|| state.tree.clone());
            (roots, cached)
        };

        let tree = match cached {
            Some(tree) => tree,
            None => build_tree(&key, self.params.elems_num, &roots, front, rear)?,
        };
        if !same_acc(&tree.accumulator(), acc) {
            return Err(PoisError::InvalidChallenge(
                "local accumulator does not match the challenged snapshot".to_string(),
            ));
        }

        self.state.lock().challenge = Some(Arc::new(ChallengeState {
            front,
            rear,
            tree,
            roots,
        }));
        info!(front, rear, "Challenge state set");
        Ok(())
    }

    fn new_challenge_handle(&self, tee_id: &[u8], seeds: &[i64]) -> Result<ChallengeHandle> {
        let state = self.state.lock();
        let challenge = state
            .challenge
            .as_ref()
            .ok_or(PoisError::ChallengeStateMissing)?;
        Ok(ChallengeHandle::new(
            tee_id,
            seeds,
            challenge.front,
            challenge.rear,
            self.params.elems_num,
        ))
    }

    fn prove_space(&self, seeds: &[i64], left: i64, right: i64) -> Result<SpaceProof> {
        let _work = self.work.lock();
        let challenge = self
            .state
            .lock()
            .challenge
            .clone()
            .ok_or(PoisError::ChallengeStateMissing)?;
        if left >= right || left <= challenge.front || right > challenge.rear + 1 {
            return Err(PoisError::IndexOutOfWindow {
                index: if left <= challenge.front { left } else { right - 1 },
                front: challenge.front,
                rear: challenge.rear,
            });
        }
        if seeds.is_empty() {
            return Err(PoisError::InvalidChallenge("no seeds".to_string()));
        }

        let wit_chains = challenge.tree.group_chains(left, right)?;
        let mut roots = Vec::with_capacity((right - left) as usize);
        let mut proofs = Vec::with_capacity((right - left) as usize);
        for index in left..right {
            let root = challenge
                .roots
                .get(&index)
                .ok_or(PoisError::ElementMissing(index))?;
            let (labels, mtree) = self.store.open_file(index, root)?;
            let openings = seeds
                .iter()
                .map(|seed| {
                    let c = challenged_chunk(*seed, index, self.params.chunks);
                    mtree.proof(c, &labels[c])
                })
                .collect::<Result<Vec<_>>>()?;
            roots.push(root.to_vec());
            proofs.push(openings);
        }

        debug!(left, right, "Space proof generated");
        Ok(SpaceProof {
            left,
            right,
            roots,
            proofs,
            wit_chains,
        })
    }

    fn prove_deletion(&self, num: i64) -> Result<DeletionProof> {
        let Some(_work) = self.work.try_lock() else {
            return Err(PoisError::Busy);
        };
        let (front, tree, roots) = {
            let state = self.state.lock();
            if state.pending.is_some() {
                return Err(PoisError::Busy);
            }
            let (front, rear) = (state.status.front, state.status.rear);
            let elems_num = self.params.elems_num;
            let reason = if num <= 0 {
                Some("nothing to delete".to_string())
            } else if front + num > rear {
                Some(format!("only {} elements committed", rear - front))
            } else if num > elems_num - front % elems_num {
                Some(format!(
                    "crosses the group boundary at {}",
                    (front / elems_num + 1) * elems_num
                ))
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(PoisError::InvalidDeletion { num, reason });
            }

            let roots = (front + 1..=front + num)
                .map(|index| {
                    state
                        .status
                        .roots
                        .get(&index)
                        .map(|r| r.to_vec())
                        .ok_or(PoisError::ElementMissing(index))
                })
                .collect::<Result<Vec<_>>>()?;
            (front, state.tree.clone(), roots)
        };

        let g0 = tree.group_of(front + 1);
        let wit_chain = tree.upper_chain(g0)?;
        let mut staged = tree;
        staged.remove_through(front + num);
        let remaining = staged
            .group_acc(g0)
            .unwrap_or_else(|| self.key.empty_acc());

        let proof = DeletionProof {
            roots,
            wit_chain,
            acc_path: vec![remaining, staged.accumulator()],
        };
        self.state.lock().pending = Some(Pending::Deletion {
            front: front + num,
            tree: staged,
        });
        debug!(front, num, "Deletion proof staged");
        Ok(proof)
    }

    fn delete_files(&self) -> Result<usize> {
        let bound = {
            let state = self.state.lock();
            match &state.challenge {
                Some(challenge) => state.status.front.min(challenge.front),
                None => state.status.front,
            }
        };

        let mut removed = 0;
        for index in self.store.indices()? {
            if index > bound {
                break;
            }
            if self.store.remove(index)? {
                removed += 1;
            }
        }

        let mut state = self.state.lock();
        state.status.roots.retain(|index, _| *index > bound);
        self.persist(&state.status)?;
        info!(bound, removed, "Idle files reclaimed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::aggregate_proof_hash;
    use crate::types::proof_hash;
    use crate::verifier::{
        replay_ranges, verify_acc_proof, verify_commit_proofs, verify_deletion_proof,
        verify_space_proof,
    };
    use tempfile::TempDir;

    const E: i64 = 4;

    fn params() -> PoisParams {
        PoisParams {
            elems_num: E,
            chunk_size: 16,
            chunks: 8,
        }
    }

    fn open(dir: &TempDir) -> LocalProver {
        LocalProver::open(dir.path(), b"miner", AccKey::test_key(), params()).unwrap()
    }

    fn rows_for(commit: &IdleCommit) -> Vec<Vec<i64>> {
        commit
            .file_indexs
            .iter()
            .map(|i| vec![*i, 0, 1, 5, 7])
            .collect()
    }

    /// Generate, prove, verify and adopt one batch. Returns the new accumulator.
    fn commit_once(prover: &LocalProver) -> Vec<u8> {
        prover.generate_idle_file_set().unwrap();
        assert!(prover.commit_ready());
        let commit = prover.get_idle_file_set_commits().unwrap();
        let rows = rows_for(&commit);
        let (proofs, acc_proof) = prover.prove_commit_and_acc(&rows).unwrap().unwrap();

        assert!(verify_commit_proofs(&prover.file_params(), &commit, &rows, &proofs));
        let new_acc =
            verify_acc_proof(&prover.key(), E, &commit, &acc_proof, &prover.accumulator())
                .unwrap();

        prover.update_status(E, false).unwrap();
        assert_eq!(prover.accumulator(), new_acc);
        new_acc
    }

    #[test]
    fn test_commit_cycle_advances_rear() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        assert_eq!(prover.accumulator(), AccKey::test_key().empty_acc());

        let first = commit_once(&prover);
        assert_eq!((prover.front(), prover.rear()), (0, 4));
        let second = commit_once(&prover);
        assert_eq!((prover.front(), prover.rear()), (0, 8));
        assert_ne!(first, second);
        assert!(!prover.commit_ready());
    }

    #[test]
    fn test_nothing_to_commit() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        assert!(!prover.commit_ready());
        assert!(matches!(
            prover.get_idle_file_set_commits(),
            Err(PoisError::NothingToCommit { .. })
        ));
        assert!(prover.prove_commit_and_acc(&[]).is_err());
    }

    #[test]
    fn test_busy_while_update_staged() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        commit_once(&prover);
        prover.generate_idle_file_set().unwrap();

        let rows = rows_for(&prover.get_idle_file_set_commits().unwrap());
        assert!(prover.prove_commit_and_acc(&rows).unwrap().is_some());
        assert!(prover.prove_commit_and_acc(&rows).unwrap().is_none());
        assert!(matches!(prover.prove_deletion(1), Err(PoisError::Busy)));

        assert!(!prover.acc_rollback(true));
        assert!(prover.commit_rollback());
        assert!(!prover.commit_rollback());
        assert_eq!(prover.rear(), 4);
        assert!(prover.prove_commit_and_acc(&rows).unwrap().is_some());
    }

    #[test]
    fn test_rollback_keeps_accumulator() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        let acc = commit_once(&prover);
        prover.generate_idle_file_set().unwrap();

        let rows = rows_for(&prover.get_idle_file_set_commits().unwrap());
        prover.prove_commit_and_acc(&rows).unwrap().unwrap();
        assert!(prover.acc_rollback(false));
        assert_eq!(prover.accumulator(), acc);
        assert_eq!(prover.rear(), 4);
    }

    #[test]
    fn test_bad_challenge_rows() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        prover.generate_idle_file_set().unwrap();
        let commit = prover.get_idle_file_set_commits().unwrap();

        let mut rows = rows_for(&commit);
        rows[0] = vec![99, 1];
        assert!(prover.prove_commit_and_acc(&rows).is_err());

        let mut rows = rows_for(&commit);
        rows[1] = vec![commit.file_indexs[1], 8];
        assert!(prover.prove_commit_and_acc(&rows).is_err());

        assert!(prover.prove_commit_and_acc(&rows[..2]).is_err());
        // Failed attempts stage nothing
        assert!(!prover.commit_rollback());
    }

    #[test]
    fn test_deletion_cycle() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        commit_once(&prover);
        commit_once(&prover);

        assert!(matches!(
            prover.prove_deletion(5),
            Err(PoisError::InvalidDeletion { .. })
        ));
        assert!(prover.prove_deletion(0).is_err());

        let old_acc = prover.accumulator();
        let proof = prover.prove_deletion(3).unwrap();
        assert!(proof.is_complete());
        assert_eq!(proof.roots.len(), 3);
        let new_acc = verify_deletion_proof(&prover.key(), 0, &old_acc, &proof).unwrap();

        // Not adopted until the status update
        assert_eq!(prover.accumulator(), old_acc);
        prover.update_status(3, true).unwrap();
        assert_eq!((prover.front(), prover.rear()), (3, 8));
        assert_eq!(prover.accumulator(), new_acc);

        assert_eq!(prover.delete_files().unwrap(), 3);
        assert_eq!(prover.store.indices().unwrap(), (4..=8).collect::<Vec<_>>());

        // One element left in the first group
        assert!(prover.prove_deletion(2).is_err());
        assert!(prover.prove_deletion(1).is_ok());
        assert!(prover.acc_rollback(true));
    }

    #[test]
    fn test_deletion_proof_rejected_against_wrong_front() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        commit_once(&prover);
        let acc = prover.accumulator();
        let proof = prover.prove_deletion(2).unwrap();
        assert!(verify_deletion_proof(&prover.key(), 1, &acc, &proof).is_none());
        assert!(verify_deletion_proof(&prover.key(), 0, &acc, &proof).is_some());
    }

    #[test]
    fn test_update_without_staged_proof_matches() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        prover.generate_idle_file_set().unwrap();
        let rows = rows_for(&prover.get_idle_file_set_commits().unwrap());
        let (_, acc_proof) = prover.prove_commit_and_acc(&rows).unwrap().unwrap();
        prover.commit_rollback();

        prover.update_status(E, false).unwrap();
        assert_eq!(prover.accumulator(), acc_proof.acc_path[1]);
        assert!(prover.update_status(E, false).is_err());
        assert!(prover.update_status(5, true).is_err());
    }

    #[test]
    fn test_space_challenge_ranges_verify() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        commit_once(&prover);
        let acc = commit_once(&prover);
        let key = prover.key();
        let seeds = [11i64, -4, 90];

        prover.set_challenge_state(key.clone(), &acc, 0, 8).unwrap();
        let mut handle = prover.new_challenge_handle(b"tee", &seeds).unwrap();

        let mut ranges = Vec::new();
        let mut hashes = Vec::new();
        loop {
            let prev = hashes.last().map(|h: &Digest| h.as_slice());
            let (left, right) = handle.next_range(prev).unwrap();
            if left == right {
                break;
            }
            let proof = prover.prove_space(&seeds, left, right).unwrap();
            assert!(verify_space_proof(&key, &prover.file_params(), &seeds, &acc, &proof));
            ranges.push((left, right));
            hashes.push(proof_hash(&proof).unwrap());
        }

        assert_eq!(ranges, vec![(1, 5), (5, 9)]);
        assert_eq!(
            replay_ranges(b"tee", &seeds, 0, 8, E, &hashes),
            Some(ranges)
        );
        assert_ne!(aggregate_proof_hash(&hashes), hashes[0]);
    }

    #[test]
    fn test_space_proof_window_checks() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        let acc = commit_once(&prover);
        assert!(matches!(
            prover.prove_space(&[1], 1, 5),
            Err(PoisError::ChallengeStateMissing)
        ));
        assert!(prover.new_challenge_handle(b"tee", &[1]).is_err());

        prover.set_challenge_state(prover.key(), &acc, 0, 4).unwrap();
        assert!(prover.prove_space(&[1], 0, 4).is_err());
        assert!(prover.prove_space(&[1], 1, 6).is_err());
        assert!(prover.prove_space(&[], 1, 5).is_err());
        assert!(prover.prove_space(&[1], 1, 5).is_ok());
    }

    #[test]
    fn test_challenge_state_must_match_snapshot() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        let first = commit_once(&prover);
        commit_once(&prover);

        assert!(prover.set_challenge_state(prover.key(), &first, 0, 8).is_err());
        // An older snapshot still held locally is accepted
        assert!(prover.set_challenge_state(prover.key(), &first, 0, 4).is_ok());
    }

    #[test]
    fn test_challenge_survives_commit() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        let acc = commit_once(&prover);
        prover.set_challenge_state(prover.key(), &acc, 0, 4).unwrap();
        commit_once(&prover);

        let proof = prover.prove_space(&[3], 1, 5).unwrap();
        assert!(verify_space_proof(&prover.key(), &prover.file_params(), &[3], &acc, &proof));
    }

    #[test]
    fn test_files_kept_for_active_challenge() {
        let dir = TempDir::new().unwrap();
        let prover = open(&dir);
        commit_once(&prover);
        let acc = commit_once(&prover);
        prover.set_challenge_state(prover.key(), &acc, 0, 8).unwrap();

        prover.prove_deletion(4).unwrap();
        prover.update_status(4, true).unwrap();
        assert_eq!(prover.delete_files().unwrap(), 0);
        assert!(prover.prove_space(&[7], 1, 5).is_ok());

        let acc = prover.accumulator();
        prover.set_challenge_state(prover.key(), &acc, 4, 8).unwrap();
        assert_eq!(prover.delete_files().unwrap(), 4);
    }

    #[test]
    fn test_status_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let acc = {
            let prover = open(&dir);
            commit_once(&prover);
            let acc = commit_once(&prover);
            prover.prove_deletion(1).unwrap();
            prover.update_status(1, true).unwrap();
            assert_ne!(prover.accumulator(), acc);
            prover.accumulator()
        };

        let prover = open(&dir);
        assert_eq!((prover.front(), prover.rear()), (1, 8));
        assert_eq!(prover.generated(), 8);
        assert_eq!(prover.accumulator(), acc);
    }

    #[test]
    fn test_sync_after_crash_before_update() {
        let dir = TempDir::new().unwrap();
        let staged_acc = {
            let prover = open(&dir);
            prover.generate_idle_file_set().unwrap();
            let rows = rows_for(&prover.get_idle_file_set_commits().unwrap());
            let (_, acc_proof) = prover.prove_commit_and_acc(&rows).unwrap().unwrap();
            acc_proof.acc_path[1].clone()
        };

        let prover = open(&dir);
        assert_eq!(prover.rear(), 0);
        prover.sync_chain_pois_status(0, 4).unwrap();
        assert_eq!(prover.rear(), 4);
        assert_eq!(prover.accumulator(), staged_acc);

        // Chain behind or equal: no-op
        prover.sync_chain_pois_status(0, 0).unwrap();
        assert_eq!(prover.rear(), 4);

        assert!(matches!(
            prover.sync_chain_pois_status(0, 12),
            Err(PoisError::SyncFailed { .. })
        ));
    }

    #[test]
    fn test_invalid_params() {
        let dir = TempDir::new().unwrap();
        let bad = PoisParams {
            elems_num: 0,
            ..params()
        };
        assert!(LocalProver::open(dir.path(), b"m", AccKey::test_key(), bad).is_err());
        assert_eq!(params().file_size(), 128);
    }
}
