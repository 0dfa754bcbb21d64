//! Long-lived protocol workers and their restart loop.
//!
//! Every worker runs one pass at a time in its own Tokio task. When the pass
//! ends, the outcome is reported on a completion channel and the supervisor
//! relaunches the worker after a backoff chosen from the outcome. A panic in
//! a pass is caught at the task boundary and treated like any other failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::context::MinerContext;
use crate::error::{Progress, ProtocolError, ProtocolResult};
use crate::protocols;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    IdleCommit,
    IdleReplace,
    IdleChallenge,
    ServiceChallenge,
    TagCalc,
    IdleGen,
    RegistrySync,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 7] = [
        WorkerKind::RegistrySync,
        WorkerKind::IdleGen,
        WorkerKind::IdleCommit,
        WorkerKind::IdleReplace,
        WorkerKind::IdleChallenge,
        WorkerKind::ServiceChallenge,
        WorkerKind::TagCalc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::IdleCommit => "idle_commit",
            WorkerKind::IdleReplace => "idle_replace",
            WorkerKind::IdleChallenge => "idle_challenge",
            WorkerKind::ServiceChallenge => "service_challenge",
            WorkerKind::TagCalc => "tag_calc",
            WorkerKind::IdleGen => "idle_gen",
            WorkerKind::RegistrySync => "registry_sync",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    async fn run_once(&self, ctx: &MinerContext) -> ProtocolResult<Progress>;
}

/// One of the built-in protocols.
pub struct ProtocolWorker(pub WorkerKind);

#[async_trait]
impl Worker for ProtocolWorker {
    fn kind(&self) -> WorkerKind {
        self.0
    }

    async fn run_once(&self, ctx: &MinerContext) -> ProtocolResult<Progress> {
        match self.0 {
            WorkerKind::IdleCommit => protocols::commit::run(ctx).await,
            WorkerKind::IdleReplace => protocols::replace::run(ctx).await,
            WorkerKind::IdleChallenge => protocols::idle_challenge::run(ctx).await,
            WorkerKind::ServiceChallenge => protocols::service_challenge::run(ctx).await,
            WorkerKind::TagCalc => protocols::tag::run(ctx).await,
            WorkerKind::IdleGen => protocols::idle_gen::run(ctx).await,
            WorkerKind::RegistrySync => protocols::registry_sync::run(ctx).await,
        }
    }
}

/// How long to wait before relaunching a worker, `None` to stop the node.
pub fn relaunch_delay(timing: &TimingConfig, outcome: &ProtocolResult<Progress>) -> Option<Duration> {
    match outcome {
        Ok(Progress::Worked) => Some(Duration::ZERO),
        Ok(Progress::Idle) => Some(timing.poll_interval()),
        Err(ProtocolError::Busy) => Some(timing.busy_backoff()),
        Err(ProtocolError::Unrecoverable(_)) => None,
        Err(_) => Some(timing.error_backoff()),
    }
}

struct Completion {
    slot: usize,
    outcome: ProtocolResult<Progress>,
}

pub struct Supervisor {
    ctx: Arc<MinerContext>,
    workers: Vec<Arc<dyn Worker>>,
}

impl Supervisor {
    pub fn new(ctx: Arc<MinerContext>, workers: Vec<Arc<dyn Worker>>) -> Self {
        Self { ctx, workers }
    }

    /// Supervisor over every built-in protocol.
    pub fn with_protocols(ctx: Arc<MinerContext>) -> Self {
        let workers = WorkerKind::ALL
            .into_iter()
            .map(|kind| Arc::new(ProtocolWorker(kind)) as Arc<dyn Worker>)
            .collect();
        Self::new(ctx, workers)
    }

    /// Run every worker until one fails unrecoverably.
    pub async fn run(self) -> Result<()> {
        if self.workers.is_empty() {
            bail!("no workers to supervise");
        }
        let (tx, mut rx) = mpsc::channel(self.workers.len());

        for slot in 0..self.workers.len() {
            self.launch(slot, Duration::ZERO, tx.clone());
        }
        info!(workers = self.workers.len(), "Supervisor started");

        while let Some(Completion { slot, outcome }) = rx.recv().await {
            let kind = self.workers[slot].kind();
            match &outcome {
                Ok(progress) => debug!(worker = %kind, ?progress, "Worker pass finished"),
                Err(ProtocolError::Busy) => debug!(worker = %kind, "Prover busy, backing off"),
                Err(e) => warn!(worker = %kind, error = %e, "Worker pass failed"),
            }

            let Some(delay) = relaunch_delay(&self.ctx.config.timing, &outcome) else {
                error!(worker = %kind, "Unrecoverable worker failure, stopping");
                return outcome.map(|_| ()).map_err(anyhow::Error::from);
            };
            self.launch(slot, delay, tx.clone());
        }
        bail!("completion channel closed")
    }

    fn launch(&self, slot: usize, delay: Duration, tx: mpsc::Sender<Completion>) {
        let worker = self.workers[slot].clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let kind = worker.kind();
            let pass = tokio::spawn(async move { worker.run_once(&ctx).await });
            let outcome = match pass.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(worker = %kind, error = %e, "Worker pass panicked");
                    Err(ProtocolError::Fatal(format!("worker panicked: {e}")))
                }
            };
            if tx.send(Completion { slot, outcome }).await.is_err() {
                debug!(worker = %kind, "Supervisor gone, dropping completion");
            }
        });
    }
}
