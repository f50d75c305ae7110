//! ReplicationCoordinator: one complete sync pass against one node.
//!
//! A pass moves through `Paging` (fetch the next page) and `Importing`
//! (ingest its records, then commit) until the node stops handing out
//! continuation tokens, then `RetryingFailures` (GetRecord for every record
//! that failed last time), then `Finalizing` (write the bookkeeping back).
//!
//! Record-level problems (crosswalk or content-store failures, an
//! `idDoesNotExist` on retry) are isolated to the record. Anything else
//! aborts the pass: the watermark stays where it was and the node is marked
//! not alive. Already-committed pages are kept; re-fetching them next time
//! is harmless because ingestion is idempotent.
//!
//! Transient failures are not retried inside a pass. The next run starts
//! from the same watermark and picks the work up again.

use crate::batch::{HarvestBatch, HarvestedRecord, Staging};
use crate::endpoint::Endpoint;
use crate::error::{HarvestError, Result};
use crate::events::{EventBus, HarvestEvent};
use crate::ingest::{BadRecord, ContentStore, Crosswalk, IngestOutcome, Notifier, PassNotice, ingest_record};
use crate::node::Node;
use crate::protocol::client::ProtocolClient;
use crate::protocol::request::OaiRequest;
use crate::splitter::{ID_DOES_NOT_EXIST, ResponseSplitter};
use crate::store::{NodeLeases, NodeStore};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to harvest and where to put it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationConfig {
    /// Format requested from every node
    pub metadata_prefix: String,
    /// Container new local objects are created in
    pub destination: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            metadata_prefix: "oai_dc".to_string(),
            destination: "harvested".to_string(),
        }
    }
}

/// The external collaborators a pass drives.
#[derive(Clone)]
pub struct Collaborators {
    pub crosswalk: Arc<dyn Crosswalk>,
    pub content: Arc<dyn ContentStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Where a pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PassPhase {
    Paging,
    Importing,
    RetryingFailures,
    Finalizing,
}

/// Working state of one pass.
///
/// Holds its own copy of the node's prior failures so nothing is written
/// back to the node until the pass finishes.
#[derive(Debug, Clone)]
pub struct ReplicationRun {
    pub run_id: String,
    pub endpoint: Endpoint,
    /// Lower bound: the node's watermark at run start
    pub from: Option<DateTime<Utc>>,
    /// Upper bound, and the new watermark if the pass completes
    pub until: DateTime<Utc>,
    prior_failures: BTreeSet<String>,
    succeeded: BTreeSet<String>,
    bad: BTreeMap<String, Option<String>>,
    /// Resumption tokens handed out so far in this pass
    tokens: HashSet<String>,
    phase: PassPhase,
}

impl ReplicationRun {
    pub fn start(node: &Node, until: DateTime<Utc>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            endpoint: node.endpoint.clone(),
            from: node.last_harvested,
            until,
            prior_failures: node.failed_imports.clone(),
            succeeded: BTreeSet::new(),
            bad: BTreeMap::new(),
            tokens: HashSet::new(),
            phase: PassPhase::Paging,
        }
    }

    pub fn phase(&self) -> PassPhase {
        self.phase
    }

    fn enter(&mut self, phase: PassPhase) {
        if self.phase != phase {
            debug!("{} [{}]: {:?} -> {:?}", self.endpoint, self.run_id, self.phase, phase);
            self.phase = phase;
        }
    }

    pub fn record_success(&mut self, external_id: &str) {
        self.bad.remove(external_id);
        self.succeeded.insert(external_id.to_string());
    }

    pub fn record_failure(&mut self, external_id: &str, reason: Option<String>) {
        self.succeeded.remove(external_id);
        self.bad.insert(external_id.to_string(), reason);
    }

    /// Note a resumption token. False if this pass has already been given it.
    pub fn see_token(&mut self, token: &str) -> bool {
        self.tokens.insert(token.to_string())
    }

    /// Prior failures not yet resolved or re-failed in this run.
    pub fn pending_retries(&self) -> Vec<String> {
        self.prior_failures
            .iter()
            .filter(|id| !self.succeeded.contains(*id) && !self.bad.contains_key(*id))
            .cloned()
            .collect()
    }

    /// `(prior - succeeded) ∪ bad`
    pub fn remaining_failures(&self) -> BTreeSet<String> {
        self.prior_failures
            .iter()
            .filter(|id| !self.succeeded.contains(*id))
            .chain(self.bad.keys())
            .cloned()
            .collect()
    }

    fn bad_records(&self) -> Vec<BadRecord> {
        self.remaining_failures()
            .into_iter()
            .map(|id| BadRecord {
                reason: self.bad.get(&id).cloned().flatten(),
                external_id: id,
            })
            .collect()
    }
}

/// Outcome of a completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub run_id: String,
    pub batches: usize,
    /// Records ingested successfully, paging and retry combined
    pub imported: usize,
    pub created: usize,
    pub replaced: usize,
    /// Records the node reported as deleted
    pub deleted_seen: usize,
    /// GetRecord retries issued
    pub retried: usize,
    /// Prior failures that now imported
    pub recovered: usize,
    pub remaining_failures: BTreeSet<String>,
}

/// Drives replication passes.
pub struct ReplicationCoordinator {
    client: Arc<dyn ProtocolClient>,
    store: Arc<dyn NodeStore>,
    collaborators: Collaborators,
    splitter: ResponseSplitter,
    leases: Arc<NodeLeases>,
    events: Arc<EventBus>,
    config: ReplicationConfig,
}

impl ReplicationCoordinator {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        store: Arc<dyn NodeStore>,
        collaborators: Collaborators,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            client,
            store,
            collaborators,
            splitter: ResponseSplitter::default(),
            leases: Arc::new(NodeLeases::new()),
            events: Arc::new(EventBus::new()),
            config,
        }
    }

    pub fn with_staging(mut self, staging: Staging) -> Self {
        self.splitter = ResponseSplitter::new(staging);
        self
    }

    /// Share leases with other coordinators so they exclude each other.
    pub fn with_leases(mut self, leases: Arc<NodeLeases>) -> Self {
        self.leases = leases;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Run a pass bounded by now (whole seconds).
    pub async fn sync_node(&self, endpoint: &Endpoint) -> Result<PassReport> {
        let now = Utc::now();
        let run_start = now.with_nanosecond(0).unwrap_or(now);
        self.sync_node_at(endpoint, run_start).await
    }

    /// Run a pass with an explicit upper bound.
    pub async fn sync_node_at(&self, endpoint: &Endpoint, run_start: DateTime<Utc>) -> Result<PassReport> {
        let _lease = self
            .leases
            .try_acquire(endpoint)
            .ok_or_else(|| HarvestError::NodeBusy(endpoint.to_string()))?;

        let node = self
            .store
            .get(endpoint)
            .await?
            .ok_or_else(|| HarvestError::UnknownNode(endpoint.to_string()))?;

        if !node.supports(&self.config.metadata_prefix) {
            let err = HarvestError::UnsupportedFormat {
                endpoint: endpoint.to_string(),
                prefix: self.config.metadata_prefix.clone(),
            };
            warn!("{}", err);
            self.events.emit(HarvestEvent::PassFailed {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
            });
            return Err(err);
        }

        let mut run = ReplicationRun::start(&node, run_start);
        let mut report = PassReport {
            run_id: run.run_id.clone(),
            ..PassReport::default()
        };
        info!(
            "Harvesting {} from {} until {}",
            node.label(),
            run.from.map(|t| t.to_rfc3339()).unwrap_or_else(|| "the beginning".into()),
            run.until.to_rfc3339()
        );
        self.events.emit(HarvestEvent::PassStarted {
            endpoint: endpoint.clone(),
            run_id: run.run_id.clone(),
        });

        let outcome = self.execute(&node, &mut run, &mut report).await;
        run.enter(PassPhase::Finalizing);
        let remaining = run.remaining_failures();

        match outcome {
            Ok(()) => {
                let failed = remaining.clone();
                let until = run.until;
                self.store
                    .update(
                        endpoint,
                        Box::new(move |node| {
                            node.alive = true;
                            node.last_harvested = Some(until);
                            node.failed_imports = failed;
                        }),
                    )
                    .await?;

                if !remaining.is_empty() {
                    self.notify(&run, None).await;
                }
                info!(
                    "Harvested {}: {} imported, {} still failing",
                    node.label(),
                    report.imported,
                    remaining.len()
                );
                self.events.emit(HarvestEvent::PassCompleted {
                    endpoint: endpoint.clone(),
                    imported: report.imported,
                    remaining_failures: remaining.len(),
                });
                report.remaining_failures = remaining;
                Ok(report)
            }
            Err(err) => {
                warn!("Pass on {} aborted: {}", node.label(), err);
                let failed = remaining;
                self.store
                    .update(
                        endpoint,
                        Box::new(move |node| {
                            node.mark_unreachable();
                            node.failed_imports = failed;
                        }),
                    )
                    .await?;
                self.notify(&run, Some(err.to_string())).await;
                self.events.emit(HarvestEvent::PassFailed {
                    endpoint: endpoint.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn execute(&self, node: &Node, run: &mut ReplicationRun, report: &mut PassReport) -> Result<()> {
        let mut request = OaiRequest::ListRecords {
            metadata_prefix: self.config.metadata_prefix.clone(),
            from: run.from,
            until: Some(run.until),
            granularity: node.granularity,
        };

        loop {
            run.enter(PassPhase::Paging);
            let body = self.client.fetch(&node.endpoint, &request).await?;
            let mut batch = self.splitter.split(body).await?;
            report.batches += 1;

            run.enter(PassPhase::Importing);
            let token = batch.continuation_token.take();
            self.import_batch(batch, run, report).await?;

            match token {
                Some(token) => {
                    // A token seen before means the node is paging in a cycle.
                    if !run.see_token(&token) {
                        return Err(HarvestError::MalformedResponse(format!(
                            "resumption token {:?} repeated",
                            token
                        )));
                    }
                    request = OaiRequest::ResumeListRecords { token };
                }
                None => break,
            }
        }

        let pending = run.pending_retries();
        if pending.is_empty() {
            return Ok(());
        }

        run.enter(PassPhase::RetryingFailures);
        debug!("Retrying {} prior failures on {}", pending.len(), node.endpoint);
        for external_id in pending {
            report.retried += 1;
            if self.retry_record(node, &external_id, run, report).await? {
                report.recovered += 1;
            }
        }
        self.collaborators.content.commit().await?;
        Ok(())
    }

    /// Ingest one page and commit it.
    async fn import_batch(&self, batch: HarvestBatch, run: &mut ReplicationRun, report: &mut PassReport) -> Result<()> {
        report.deleted_seen += batch.deleted.len();
        let mut imported = 0;
        let mut failed = 0;

        for record in batch {
            if self.import_record(&record, run, report).await {
                imported += 1;
            } else {
                failed += 1;
            }
        }

        self.collaborators.content.commit().await?;

        // The page's bookkeeping goes with its content. The watermark only
        // moves in Finalizing.
        let remaining = run.remaining_failures();
        self.store
            .update(&run.endpoint, Box::new(move |node| node.failed_imports = remaining))
            .await?;

        self.events.emit(HarvestEvent::BatchImported {
            endpoint: run.endpoint.clone(),
            imported,
            failed,
        });
        Ok(())
    }

    /// Returns whether the record imported. Failures are recorded on `run`.
    async fn import_record(&self, record: &HarvestedRecord, run: &mut ReplicationRun, report: &mut PassReport) -> bool {
        let blob = match record.blob.read() {
            Ok(blob) => blob,
            Err(e) => {
                warn!("{}: cannot read staged record: {}", record.external_id, e);
                run.record_failure(&record.external_id, Some(e.to_string()));
                return false;
            }
        };

        let outcome = ingest_record(
            self.collaborators.crosswalk.as_ref(),
            self.collaborators.content.as_ref(),
            &self.config.destination,
            &record.external_id,
            &blob,
        )
        .await;

        match outcome {
            Ok(outcome) => {
                match outcome {
                    IngestOutcome::Created => report.created += 1,
                    IngestOutcome::Replaced => report.replaced += 1,
                }
                report.imported += 1;
                run.record_success(&record.external_id);
                true
            }
            Err(e) => {
                warn!("{}: import failed: {}", record.external_id, e);
                run.record_failure(&record.external_id, Some(e.to_string()));
                false
            }
        }
    }

    /// GetRecord one prior failure. Returns whether it now imported.
    async fn retry_record(
        &self,
        node: &Node,
        external_id: &str,
        run: &mut ReplicationRun,
        report: &mut PassReport,
    ) -> Result<bool> {
        let request = OaiRequest::GetRecord {
            metadata_prefix: self.config.metadata_prefix.clone(),
            identifier: external_id.to_string(),
        };
        let body = self.client.fetch(&node.endpoint, &request).await?;
        let batch = match self.splitter.split(body).await {
            Ok(batch) => batch,
            Err(err) if err.oai_code() == Some(ID_DOES_NOT_EXIST) => {
                run.record_failure(external_id, Some(err.to_string()));
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        if batch.deleted.iter().any(|id| id == external_id) {
            // Withdrawn upstream; nothing left to import.
            debug!("{}: deleted upstream, dropping from failures", external_id);
            report.deleted_seen += 1;
            run.record_success(external_id);
            return Ok(false);
        }

        let Some(record) = batch.into_iter().find(|r| r.external_id == external_id) else {
            run.record_failure(external_id, Some("record not returned by GetRecord".to_string()));
            return Ok(false);
        };
        Ok(self.import_record(&record, run, report).await)
    }

    async fn notify(&self, run: &ReplicationRun, aborted: Option<String>) {
        let notice = PassNotice {
            endpoint: run.endpoint.clone(),
            aborted,
            bad_records: run.bad_records(),
        };
        self.collaborators.notifier.notify(&notice).await;
    }
}
