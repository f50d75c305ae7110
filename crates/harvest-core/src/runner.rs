//! AsyncRunner: replicate a list of nodes as one cancellable background task.
//!
//! Nodes are visited strictly one after another. Cancellation is checked
//! before each node and never during a pass, so every pass either completes
//! or fails on its own terms.

use crate::coordinator::{PassReport, ReplicationCoordinator};
use crate::endpoint::Endpoint;
use crate::store::{NodeStore, Result as StoreResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Active nodes, nearest first, ties broken by endpoint.
pub async fn select_nodes(store: &dyn NodeStore) -> StoreResult<Vec<Endpoint>> {
    let mut nodes: Vec<_> = store.list().await?.into_iter().filter(|n| n.active).collect();
    nodes.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.endpoint.cmp(&b.endpoint)));
    Ok(nodes.into_iter().map(|n| n.endpoint).collect())
}

/// Snapshot of a run in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub total: usize,
    /// Nodes whose pass has ended, successfully or not
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Node currently being replicated
    pub current: Option<Endpoint>,
    pub finished: bool,
}

/// How one node's pass ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum NodeOutcome {
    Completed { report: PassReport },
    Failed { reason: String },
}

/// Result of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub outcomes: Vec<(Endpoint, NodeOutcome)>,
    /// Nodes never started because the run was cancelled
    pub skipped: Vec<Endpoint>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, NodeOutcome::Failed { .. }))
            .count()
    }
}

/// Runs replication passes over many nodes.
#[derive(Clone)]
pub struct AsyncRunner {
    coordinator: Arc<ReplicationCoordinator>,
}

impl AsyncRunner {
    pub fn new(coordinator: Arc<ReplicationCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Start replicating `nodes` in a background task.
    pub fn spawn(&self, nodes: Vec<Endpoint>) -> RunHandle {
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(RunProgress {
            total: nodes.len(),
            ..RunProgress::default()
        });

        let runner = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { runner.run(nodes, &token, &progress_tx).await });

        RunHandle {
            cancel,
            progress: progress_rx,
            task,
        }
    }

    /// Replicate `nodes` in order on the current task.
    pub async fn run(
        &self,
        nodes: Vec<Endpoint>,
        cancel: &CancellationToken,
        progress: &watch::Sender<RunProgress>,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut remaining = nodes.into_iter();

        while let Some(endpoint) = remaining.next() {
            if cancel.is_cancelled() {
                info!("Run cancelled before {}", endpoint);
                summary.cancelled = true;
                summary.skipped.push(endpoint);
                summary.skipped.extend(remaining.by_ref());
                break;
            }

            progress.send_modify(|p| p.current = Some(endpoint.clone()));
            let outcome = match self.coordinator.sync_node(&endpoint).await {
                Ok(report) => NodeOutcome::Completed { report },
                Err(e) => {
                    warn!("Replication of {} failed: {}", endpoint, e);
                    NodeOutcome::Failed { reason: e.to_string() }
                }
            };

            let ok = matches!(outcome, NodeOutcome::Completed { .. });
            progress.send_modify(|p| {
                p.completed += 1;
                if ok {
                    p.succeeded += 1;
                } else {
                    p.failed += 1;
                }
                p.current = None;
            });
            summary.outcomes.push((endpoint, outcome));
        }

        progress.send_modify(|p| {
            p.current = None;
            p.finished = true;
        });
        summary
    }
}

/// Handle to a spawned run.
pub struct RunHandle {
    cancel: CancellationToken,
    progress: watch::Receiver<RunProgress>,
    task: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Stop before the next node. The current pass runs to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Watch progress as it changes.
    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.clone()
    }

    /// Current progress.
    pub fn snapshot(&self) -> RunProgress {
        self.progress.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn join(self) -> Result<RunSummary, JoinError> {
        self.task.await
    }
}
