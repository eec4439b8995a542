// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The control loop.
//!
//! One `Worker` runs per engine start. It owns the only handle that writes
//! to the index, so index mutations never race. The update callback registered
//! with the document store only touches [`SyncStatus`].
//!
//! ```text
//! run ─┬─▶ read-only? ──yes──▶ ReadOnly (exit)
//!      │
//!      └─▶ loop {
//!            run_once: Connecting → RootReconcile → SteadyState (accept / process / complete)
//!            Err(Stopped)  → exit quietly
//!            Err(other)    → record error, reset, Backoff, retry
//!          }
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::refresh::RefreshPolicy;
use super::types::{EnginePhase, JobOutcome};
use crate::error::{IndexSyncError, Result};
use crate::metrics;
use crate::resilience::{sleep_or_cancel, with_timeout, RetryConfig};
use crate::status::SyncStatus;
use crate::store::{
    DocCrawler, DocEntry, DocListing, DocStore, DocUpdate, IndexStore, IndexSyncStore, Query,
    SearchOptions, Table,
};

pub(super) struct Worker {
    pub(super) status: Arc<SyncStatus>,
    pub(super) docs: Arc<dyn DocStore>,
    pub(super) index: Arc<dyn IndexStore>,
    pub(super) sync_store: Arc<dyn IndexSyncStore>,
    pub(super) crawler: Arc<dyn DocCrawler>,
    pub(super) retry: RetryConfig,
    pub(super) phase: Arc<watch::Sender<EnginePhase>>,
    pub(super) refresh: RefreshPolicy,
}

impl Worker {
    pub(super) fn set_phase(&self, phase: EnginePhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = %previous, to = %phase, "Engine phase changed");
        }
        metrics::set_engine_phase(&phase.to_string());
    }

    /// Run until cancelled, or until the index turns out to be read-only.
    pub(super) async fn run(mut self, cancel: CancellationToken) {
        if self.index.is_readonly() {
            info!("Index is read-only, nothing to synchronize");
            self.status.set_readonly(true);
            self.set_phase(EnginePhase::ReadOnly);
            return;
        }

        let mut attempt = 0usize;
        loop {
            match self.run_once(&cancel).await {
                Ok(()) => break,
                Err(e) if e.is_stopped() => {
                    debug!("Index sync stopped");
                    break;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.retry.delay_for_attempt(attempt);
                    error!(
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Index sync loop failed"
                    );
                    metrics::record_loop_error(e.kind());
                    self.status.set_error(Some(e.to_string()));
                    self.status.reset();

                    if attempt >= self.retry.max_attempts {
                        warn!(attempt, "Giving up on index sync after repeated failures");
                        break;
                    }

                    self.set_phase(EnginePhase::Backoff);
                    if sleep_or_cancel(delay, &cancel).await.is_err() {
                        debug!("Index sync stopped during backoff");
                        break;
                    }
                    metrics::record_loop_restart();
                }
            }
        }

        self.set_phase(EnginePhase::Stopped);
    }

    /// One connect / reconcile / process cycle. Only returns with an error.
    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.set_phase(EnginePhase::Connecting);
        self.wait_for_dependencies(cancel).await?;
        self.status.set_error(None);

        let version = self
            .index
            .schema_version()
            .await
            .map_err(|e| IndexSyncError::store("schema version", e))?;

        // Dropping the subscription at the end of the cycle unsubscribes.
        let status = Arc::clone(&self.status);
        let _subscription = self
            .docs
            .subscribe_updates(Arc::new(move |update: DocUpdate| {
                if let Err(e) = status.handle_update(&update) {
                    warn!(doc_id = %update.doc_id, error = %e, "Failed to apply document update");
                }
            }));

        let result = self.sync(version, cancel).await;
        self.refresh.flush_on_exit(self.index.as_ref()).await;
        result
    }

    async fn wait_for_dependencies(&self, cancel: &CancellationToken) -> Result<()> {
        let timeout = self.retry.connection_timeout;
        with_timeout("dependencies to connect", timeout, async {
            tokio::try_join!(
                async {
                    self.docs
                        .wait_for_connected(cancel)
                        .await
                        .map_err(|e| IndexSyncError::store("connect document store", e))
                },
                async {
                    self.index
                        .wait_for_connected(cancel)
                        .await
                        .map_err(|e| IndexSyncError::store("connect index", e))
                },
                async {
                    self.sync_store
                        .wait_for_connected(cancel)
                        .await
                        .map_err(|e| IndexSyncError::store("connect clock store", e))
                },
            )?;
            Ok(())
        })
        .await
    }

    async fn sync(&mut self, version: u32, cancel: &CancellationToken) -> Result<()> {
        self.set_phase(EnginePhase::RootReconcile);
        self.load_root().await?;
        let indexed = self.load_indexed_docs().await?;
        info!(
            desired = self.status.desired_docs().len(),
            indexed = indexed.len(),
            version,
            "Root listing loaded"
        );
        self.status.set_indexed_docs(indexed);

        self.set_phase(EnginePhase::SteadyState);
        let root_doc_id = self.status.root_doc_id().to_string();
        loop {
            let doc_id = self.status.accept_job(cancel).await?;
            let kind = if doc_id == root_doc_id { "root" } else { "doc" };
            let started = Instant::now();

            // Document jobs refresh before persisting their clock.
            let result = if kind == "root" {
                match self.reconcile_root().await {
                    Ok(outcome) => self
                        .refresh
                        .refresh_if_needed(self.index.as_ref())
                        .await
                        .map(|()| outcome),
                    Err(e) => Err(e),
                }
            } else {
                self.index_doc(&doc_id, version).await
            };
            self.status.complete_job();
            metrics::record_job_duration(kind, started.elapsed());

            let outcome = result?;
            metrics::record_job(kind, outcome.as_str());
            if let JobOutcome::Skipped(reason) = outcome {
                debug!(doc_id = %doc_id, reason = reason.as_str(), "Job skipped");
            }
        }
    }

    /// Decode the root document and seed the desired set.
    async fn load_root(&self) -> Result<()> {
        let root_doc_id = self.status.root_doc_id();
        let mut root = self.crawler.new_root(root_doc_id);
        let bin = self
            .docs
            .get_document(root_doc_id)
            .await
            .map_err(|e| IndexSyncError::store("load root document", e))?;
        if let Some(bin) = bin {
            root.apply_update(&bin)
                .map_err(|e| IndexSyncError::store("decode root document", e))?;
        } else {
            debug!(root = %root_doc_id, "Root document missing, starting from an empty listing");
        }
        self.status.load_root(root);
        Ok(())
    }

    /// What the index currently holds, read from the doc table.
    async fn load_indexed_docs(&self) -> Result<DocListing> {
        let result = self
            .index
            .search(
                Table::Doc,
                Query::All,
                SearchOptions::unlimited().with_fields(&["docId", "title"]),
            )
            .await
            .map_err(|e| IndexSyncError::store("load indexed docs", e))?;

        Ok(result
            .nodes
            .into_iter()
            .map(|node| {
                let first = |field: &str| {
                    node.fields
                        .get(field)
                        .and_then(|values| values.first())
                        .cloned()
                };
                let doc_id = first("docId").unwrap_or_else(|| node.id.clone());
                let title = first("title").filter(|t| !t.is_empty());
                (doc_id, DocEntry { title })
            })
            .collect())
    }
}
