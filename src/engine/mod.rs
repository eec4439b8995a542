// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index sync engine.
//!
//! The orchestrator that ties together:
//! - The replicated document store via [`DocStore`]
//! - The local search index via [`IndexStore`] (plus an optional remote replica)
//! - Indexed-clock persistence via [`IndexSyncStore`]
//! - Content extraction via [`DocCrawler`]
//! - Bookkeeping and observable progress via [`SyncStatus`]
//!
//! # Lifecycle
//!
//! 1. [`start()`](IndexSyncEngine::start) spawns the control loop (stopping any
//!    previous run first)
//! 2. The loop connects, reconciles the root listing, then processes jobs
//! 3. Loop errors are recorded in [`SyncState::error_message`], the status is
//!    reset, and the loop reconnects after the retry delay
//! 4. [`stop()`](IndexSyncEngine::stop) cancels the run, waits for the final
//!    flush, and is safe to call repeatedly

mod crawl;
mod reconcile;
mod refresh;
mod types;
mod worker;

pub use types::EnginePhase;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::clock_store::SqliteIndexSyncStore;
use crate::config::IndexSyncConfig;
use crate::error::Result;
use crate::metrics;
use crate::observe::throttle;
use crate::queue::Priority;
use crate::resilience::RetryConfig;
use crate::router::QueryRouter;
use crate::status::{DocSyncState, PriorityBoost, SyncState, SyncStatus};
use crate::store::{DocCrawler, DocStore, IndexStore, IndexSyncStore};

use refresh::RefreshPolicy;
use worker::Worker;

/// How long [`IndexSyncEngine::stop`] waits for the loop's final flush.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct Run {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps a search index in step with a replicated document store.
///
/// # Example
///
/// ```rust,ignore
/// let engine = IndexSyncEngine::new(config, docs, index, clocks, crawler);
/// engine.start().await?;
///
/// let boost = engine.add_priority("doc-being-viewed", 10);
/// engine.wait_for_completed(&CancellationToken::new()).await?;
///
/// engine.stop().await;
/// ```
pub struct IndexSyncEngine {
    config: IndexSyncConfig,
    retry: RetryConfig,
    status: Arc<SyncStatus>,
    docs: Arc<dyn DocStore>,
    index: Arc<dyn IndexStore>,
    sync_store: Arc<dyn IndexSyncStore>,
    crawler: Arc<dyn DocCrawler>,
    router: QueryRouter,
    phase_tx: Arc<watch::Sender<EnginePhase>>,
    run: Mutex<Option<Run>>,
}

impl IndexSyncEngine {
    /// Create an engine. Nothing runs until [`start()`](Self::start).
    pub fn new(
        config: IndexSyncConfig,
        docs: Arc<dyn DocStore>,
        index: Arc<dyn IndexStore>,
        sync_store: Arc<dyn IndexSyncStore>,
        crawler: Arc<dyn DocCrawler>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(EnginePhase::Idle);
        Self {
            retry: RetryConfig::from_config(&config),
            status: Arc::new(SyncStatus::new(&config)),
            router: QueryRouter::new(Arc::clone(&index), None),
            config,
            docs,
            index,
            sync_store,
            crawler,
            phase_tx: Arc::new(phase_tx),
            run: Mutex::new(None),
        }
    }

    /// Create an engine whose indexed clocks live in the SQLite database
    /// named by `config.clock_store`.
    pub async fn with_sqlite_clock_store(
        config: IndexSyncConfig,
        docs: Arc<dyn DocStore>,
        index: Arc<dyn IndexStore>,
        crawler: Arc<dyn DocCrawler>,
    ) -> Result<Self> {
        let clocks = SqliteIndexSyncStore::open(&config.clock_store).await?;
        info!(path = %clocks.path(), "Indexed clock store opened");
        Ok(Self::new(config, docs, index, Arc::new(clocks), crawler))
    }

    /// Route reads with `prefer: Remote` to `remote`.
    pub fn with_remote(mut self, remote: Arc<dyn IndexStore>) -> Self {
        self.router = QueryRouter::new(Arc::clone(&self.index), Some(remote));
        self
    }

    /// Override the reconnect schedule.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the control loop, stopping a previous run first.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;
        self.stop().await;

        info!(root = %self.config.root_doc_id, "Starting index sync engine");
        // Pause and battery-save set before start stay in effect.
        self.status.clear_run();

        let worker = Worker {
            status: Arc::clone(&self.status),
            docs: Arc::clone(&self.docs),
            index: Arc::clone(&self.index),
            sync_store: Arc::clone(&self.sync_store),
            crawler: Arc::clone(&self.crawler),
            retry: self.retry.clone(),
            phase: Arc::clone(&self.phase_tx),
            refresh: RefreshPolicy::new(self.index.recommended_refresh_interval()),
        };

        let cancel = CancellationToken::new();
        let span = info_span!("index_sync", root = %self.config.root_doc_id);
        let handle = tokio::spawn(worker.run(cancel.clone()).instrument(span));
        *self.lock_run() = Some(Run { cancel, handle });
        Ok(())
    }

    /// Cancel the current run and wait for it to flush and exit.
    pub async fn stop(&self) {
        let Some(run) = self.lock_run().take() else {
            return;
        };

        info!("Stopping index sync engine");
        run.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, run.handle).await {
            Ok(Ok(())) => debug!("Index sync loop exited"),
            Ok(Err(e)) => warn!(error = %e, "Index sync loop panicked"),
            Err(_) => warn!("Index sync loop did not exit in time"),
        }

        if !self.phase().is_terminal() {
            self.phase_tx.send_replace(EnginePhase::Stopped);
            metrics::set_engine_phase(&EnginePhase::Stopped.to_string());
        }
    }

    /// True while a started loop has not exited.
    pub fn is_running(&self) -> bool {
        self.lock_run()
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase_tx.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<EnginePhase> {
        self.phase_tx.subscribe()
    }

    pub fn root_doc_id(&self) -> &str {
        &self.config.root_doc_id
    }

    /// The bookkeeping shared with the control loop.
    pub fn status(&self) -> &Arc<SyncStatus> {
        &self.status
    }

    pub fn query_router(&self) -> &QueryRouter {
        &self.router
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Observation
    // ═══════════════════════════════════════════════════════════════════════════

    /// Throttled progress stream (leading + trailing, `state_throttle` window).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn state(&self) -> watch::Receiver<SyncState> {
        throttle(
            self.status.subscribe_state(),
            self.config.state_throttle_duration(),
        )
    }

    /// Latest progress snapshot, un-throttled.
    pub fn state_now(&self) -> SyncState {
        self.status.state()
    }

    /// Throttled progress stream for one document.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn doc_state(&self, doc_id: &str) -> watch::Receiver<DocSyncState> {
        throttle(
            self.status.doc_state(doc_id),
            self.config.state_throttle_duration(),
        )
    }

    /// Resolve once every known document is indexed and the queue is idle.
    pub async fn wait_for_completed(&self, cancel: &CancellationToken) -> Result<()> {
        self.status.wait_for_completed(cancel).await
    }

    /// Resolve once `doc_id` is indexed and not queued.
    pub async fn wait_for_doc_completed(
        &self,
        doc_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.status.wait_for_doc_completed(doc_id, cancel).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Controls
    // ═══════════════════════════════════════════════════════════════════════════

    /// Boost `doc_id` while the returned guard lives.
    pub fn add_priority(&self, doc_id: &str, delta: Priority) -> PriorityBoost {
        self.status.add_priority(doc_id, delta)
    }

    pub fn pause_sync(&self) {
        self.status.pause_sync();
    }

    pub fn resume_sync(&self) {
        self.status.resume_sync();
    }

    pub fn enable_battery_save_mode(&self) {
        self.status.enable_battery_save_mode();
    }

    pub fn disable_battery_save_mode(&self) {
        self.status.disable_battery_save_mode();
    }
}

impl Drop for IndexSyncEngine {
    fn drop(&mut self) {
        if let Some(run) = self.lock_run().take() {
            run.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for IndexSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSyncEngine")
            .field("root_doc_id", &self.config.root_doc_id)
            .field("phase", &self.phase())
            .field("state", &self.state_now())
            .finish_non_exhaustive()
    }
}
