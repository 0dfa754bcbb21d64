//! Known TEE workers, shared by every protocol.
//!
//! Filled from the chain's worker list by the registry sync worker and
//! read by the protocols when they pick an endpoint or resolve the TEE the
//! chain allocated to a challenge.

use common::{TeeWorker, WorkerPublicKey, short_hex};
use dashmap::DashMap;
use tracing::debug;

#[derive(Default)]
pub struct TeeRegistry {
    by_pubkey: DashMap<WorkerPublicKey, TeeWorker>,
    by_endpoint: DashMap<String, WorkerPublicKey>,
}

impl TeeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a worker; a changed endpoint replaces the old one.
    pub fn upsert(&self, worker: TeeWorker) {
        if let Some(old) = self.by_pubkey.get(&worker.pubkey).map(|w| w.endpoint.clone())
            && old != worker.endpoint
        {
            self.by_endpoint.remove(&old);
        }
        self.by_endpoint
            .insert(worker.endpoint.clone(), worker.pubkey);
        debug!(tee = %short_hex(&worker.pubkey), endpoint = %worker.endpoint, "TEE registered");
        self.by_pubkey.insert(worker.pubkey, worker);
    }

    pub fn remove(&self, pubkey: &WorkerPublicKey) -> Option<TeeWorker> {
        let (_, worker) = self.by_pubkey.remove(pubkey)?;
        self.by_endpoint
            .remove_if(&worker.endpoint, |_, pk| pk == pubkey);
        Some(worker)
    }

    pub fn by_pubkey(&self, pubkey: &WorkerPublicKey) -> Option<TeeWorker> {
        self.by_pubkey.get(pubkey).map(|w| w.value().clone())
    }

    pub fn by_endpoint(&self, endpoint: &str) -> Option<TeeWorker> {
        let pubkey = *self.by_endpoint.get(endpoint)?;
        self.by_pubkey(&pubkey)
    }

    /// Workers allowed to issue commit challenges and tags.
    pub fn markers(&self) -> Vec<TeeWorker> {
        let mut markers: Vec<TeeWorker> = self
            .by_pubkey
            .iter()
            .filter(|w| w.role.can_mark())
            .map(|w| w.value().clone())
            .collect();
        markers.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        markers
    }

    pub fn len(&self) -> usize {
        self.by_pubkey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pubkey.is_empty()
    }

    /// Make the registry match `workers`. Returns `(upserted, removed)`.
    pub fn replace_all(&self, workers: Vec<TeeWorker>) -> (usize, usize) {
        let keep: Vec<WorkerPublicKey> = workers.iter().map(|w| w.pubkey).collect();
        let stale: Vec<WorkerPublicKey> = self
            .by_pubkey
            .iter()
            .map(|w| w.pubkey)
            .filter(|pk| !keep.contains(pk))
            .collect();
        for pubkey in &stale {
            self.remove(pubkey);
        }
        let upserted = workers.len();
        for worker in workers {
            self.upsert(worker);
        }
        debug!(upserted, removed = stale.len(), "TEE registry replaced");
        (upserted, stale.len())
    }
}
