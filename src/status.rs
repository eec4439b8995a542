// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync status: the single source of truth for the engine's bookkeeping.
//!
//! [`SyncStatus`] owns the job queue, the desired and indexed document sets,
//! the decoded root structure, and the pause / battery-save controls. Every
//! mutation runs under one mutex and republishes a [`SyncState`] snapshot
//! before the lock is released, so observers never see a torn state.
//!
//! # Observation
//!
//! ```text
//!  mutator ──lock──▶ StatusInner ──▶ state_tx (watch, latest SyncState)
//!                         │
//!                         └────────▶ changes (broadcast: Doc(id) | All)
//!                                        │
//!                     doc_state(id) ◀────┘  per-doc DocSyncState
//! ```
//!
//! The raw `watch` channel is un-throttled; the engine wraps it with
//! [`crate::observe::throttle`] for UI consumers.
//!
//! # Root structure
//!
//! The decoded root lives behind its own [`SharedRoot`] lock, outside the
//! status mutex, so a crawl can read it on a blocking thread while mutators
//! keep running. Lock order is always root first, then status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::IndexSyncConfig;
use crate::error::{IndexSyncError, Result};
use crate::metrics;
use crate::queue::{Priority, PriorityJobQueue, ROOT_PRIORITY};
use crate::store::{DocEntry, DocListing, DocUpdate, RootStructure, StoreResult};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// The decoded root structure, shared with crawls running off the runtime.
pub type SharedRoot = Arc<RwLock<Option<Box<dyn RootStructure>>>>;

/// Aggregated progress snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub paused: bool,
    pub battery_save_mode: bool,
    /// Pending jobs plus the job in flight.
    pub indexing: usize,
    /// Desired documents plus the root listing itself.
    pub total: usize,
    pub completed: bool,
    pub error_message: Option<String>,
}

/// Progress of a single document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocSyncState {
    pub indexing: bool,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StatusChange {
    Doc(String),
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Control {
    paused: bool,
    battery_save: bool,
}

struct StatusInner {
    desired: DocListing,
    indexed: DocListing,
    current_job: Option<String>,
    root_ready: bool,
    readonly: bool,
    error_message: Option<String>,
    priorities: HashMap<String, Priority>,
}

/// In-memory state holder shared by the control loop and the update callback.
pub struct SyncStatus {
    root_doc_id: String,
    include_trash: bool,
    battery_save_min_priority: Priority,
    queue: PriorityJobQueue,
    root: SharedRoot,
    inner: Mutex<StatusInner>,
    control: watch::Sender<Control>,
    state_tx: watch::Sender<SyncState>,
    changes: broadcast::Sender<StatusChange>,
}

impl SyncStatus {
    pub fn new(config: &IndexSyncConfig) -> Self {
        let mut priorities = config.priorities.clone();
        priorities.insert(config.root_doc_id.clone(), ROOT_PRIORITY);

        let inner = StatusInner {
            desired: DocListing::new(),
            indexed: DocListing::new(),
            current_job: None,
            root_ready: false,
            readonly: false,
            error_message: None,
            priorities,
        };
        let (control, _) = watch::channel(Control::default());
        let (state_tx, _) = watch::channel(SyncState {
            total: 1,
            ..Default::default()
        });
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            root_doc_id: config.root_doc_id.clone(),
            include_trash: config.include_trash,
            battery_save_min_priority: config.battery_save_min_priority,
            queue: PriorityJobQueue::new(),
            root: Arc::new(RwLock::new(None)),
            inner: Mutex::new(inner),
            control,
            state_tx,
            changes,
        }
    }

    pub fn root_doc_id(&self) -> &str {
        &self.root_doc_id
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_root(&self) -> RwLockWriteGuard<'_, Option<Box<dyn RootStructure>>> {
        self.root.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn compute_state(&self, inner: &StatusInner) -> SyncState {
        let control = *self.control.borrow();
        if inner.readonly {
            return SyncState {
                paused: control.paused,
                battery_save_mode: control.battery_save,
                indexing: 0,
                total: 0,
                completed: true,
                error_message: inner.error_message.clone(),
            };
        }
        let pending = self.queue.len();
        SyncState {
            paused: control.paused,
            battery_save_mode: control.battery_save,
            indexing: pending + usize::from(inner.current_job.is_some()),
            total: inner.desired.len() + 1,
            completed: inner.root_ready && pending == 0 && inner.current_job.is_none(),
            error_message: inner.error_message.clone(),
        }
    }

    fn compute_doc_state(&self, inner: &StatusInner, doc_id: &str) -> DocSyncState {
        if inner.readonly {
            return DocSyncState {
                indexing: false,
                completed: true,
            };
        }
        let queued = self.queue.has(doc_id);
        DocSyncState {
            indexing: queued,
            completed: inner.indexed.contains_key(doc_id) && !queued,
        }
    }

    /// Republish the snapshot. Callers hold the lock.
    fn publish(&self, inner: &StatusInner, change: StatusChange) {
        let next = self.compute_state(inner);
        metrics::set_queue_depth(self.queue.len());
        metrics::set_progress(next.indexing, next.total);
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        // No receivers is fine
        let _ = self.changes.send(change);
    }

    fn schedule_locked(&self, inner: &StatusInner, doc_id: &str) {
        let priority = inner.priorities.get(doc_id).copied().unwrap_or(0);
        if self.queue.push(doc_id, priority) {
            trace!(doc_id = %doc_id, priority, "Job scheduled");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Job lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Queue `doc_id` with its configured priority (default 0).
    pub fn schedule_job(&self, doc_id: &str) {
        let inner = self.lock();
        self.schedule_locked(&inner, doc_id);
        self.publish(&inner, StatusChange::Doc(doc_id.to_string()));
    }

    /// Wait for the next eligible job and mark it as in flight.
    ///
    /// Blocks while paused. In battery-save mode only jobs at or above the
    /// configured minimum priority are accepted. A change to either control
    /// while waiting is picked up immediately.
    pub async fn accept_job(&self, cancel: &CancellationToken) -> Result<String> {
        let mut control = self.control.subscribe();
        loop {
            let Control {
                paused,
                battery_save,
            } = *control.borrow_and_update();

            if paused {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(IndexSyncError::Stopped),
                    changed = control.changed() => {
                        if changed.is_err() {
                            return Err(IndexSyncError::Stopped);
                        }
                        continue;
                    }
                }
            }

            if cancel.is_cancelled() {
                return Err(IndexSyncError::Stopped);
            }
            let min_priority = battery_save.then_some(self.battery_save_min_priority);

            // Register before checking so a push in between is not missed.
            let pushed = self.queue.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            // Pop and mark in flight in one critical section: no snapshot may
            // show the job neither queued nor current.
            {
                let mut inner = self.lock();
                if let Some(doc_id) = self.queue.try_pop(min_priority) {
                    inner.current_job = Some(doc_id.clone());
                    self.publish(&inner, StatusChange::Doc(doc_id.clone()));
                    return Ok(doc_id);
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IndexSyncError::Stopped),
                _ = control.changed() => {}
                _ = &mut pushed => {}
            }
        }
    }

    /// Clear the in-flight job.
    pub fn complete_job(&self) {
        let mut inner = self.lock();
        let change = match inner.current_job.take() {
            Some(doc_id) => StatusChange::Doc(doc_id),
            None => StatusChange::All,
        };
        self.publish(&inner, change);
    }

    pub fn current_job(&self) -> Option<String> {
        self.lock().current_job.clone()
    }

    pub fn pending_jobs(&self) -> usize {
        self.queue.len()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Priorities
    // ═══════════════════════════════════════════════════════════════════════════

    /// Raise `doc_id`'s priority by `delta` until the returned guard is reverted
    /// or dropped. Overlapping boosts accumulate.
    pub fn add_priority(self: &Arc<Self>, doc_id: &str, delta: Priority) -> PriorityBoost {
        let applied = if doc_id == self.root_doc_id {
            // Already maximal
            0
        } else {
            self.adjust_priority(doc_id, delta);
            delta
        };
        PriorityBoost {
            status: Some(Arc::downgrade(self)),
            doc_id: doc_id.to_string(),
            delta: applied,
        }
    }

    fn adjust_priority(&self, doc_id: &str, delta: Priority) {
        if delta == 0 {
            return;
        }
        let mut inner = self.lock();
        let entry = inner.priorities.entry(doc_id.to_string()).or_insert(0);
        *entry = entry.saturating_add(delta);
        let priority = *entry;
        self.queue.set_priority(doc_id, priority);
        debug!(doc_id = %doc_id, priority, "Priority adjusted");
        self.publish(&inner, StatusChange::Doc(doc_id.to_string()));
    }

    /// Configured priority for `doc_id` (boosts included).
    pub fn priority_of(&self, doc_id: &str) -> Priority {
        self.lock().priorities.get(doc_id).copied().unwrap_or(0)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Controls
    // ═══════════════════════════════════════════════════════════════════════════

    fn set_control(&self, update: impl FnOnce(&mut Control)) {
        let inner = self.lock();
        let changed = self.control.send_if_modified(|control| {
            let before = *control;
            update(control);
            *control != before
        });
        if changed {
            self.publish(&inner, StatusChange::All);
        }
    }

    pub fn pause_sync(&self) {
        self.set_control(|c| c.paused = true);
    }

    pub fn resume_sync(&self) {
        self.set_control(|c| c.paused = false);
    }

    pub fn enable_battery_save_mode(&self) {
        self.set_control(|c| c.battery_save = true);
    }

    pub fn disable_battery_save_mode(&self) {
        self.set_control(|c| c.battery_save = false);
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().paused
    }

    pub fn is_battery_save_mode(&self) -> bool {
        self.control.borrow().battery_save
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Root structure and document sets
    // ═══════════════════════════════════════════════════════════════════════════

    /// Install the decoded root structure, seed the desired set from it, and
    /// schedule the root job followed by every desired document.
    pub fn load_root(&self, root: Box<dyn RootStructure>) {
        let mut slot = self.write_root();
        let mut inner = self.lock();
        let docs = root.docs(self.include_trash);
        self.schedule_locked(&inner, &self.root_doc_id);
        for doc_id in docs.keys() {
            self.schedule_locked(&inner, doc_id);
        }
        debug!(docs = docs.len(), "Root structure loaded");
        inner.desired = docs;
        *slot = Some(root);
        inner.root_ready = true;
        self.publish(&inner, StatusChange::All);
    }

    pub fn is_root_ready(&self) -> bool {
        self.lock().root_ready
    }

    /// React to a document update observed on the replicated store.
    ///
    /// Updates arriving before [`load_root`](Self::load_root) are ignored; the
    /// initial load already reflects them.
    pub fn handle_update(&self, update: &DocUpdate) -> StoreResult<()> {
        if update.doc_id != self.root_doc_id {
            let inner = self.lock();
            if !inner.root_ready {
                trace!(doc_id = %update.doc_id, "Update before root ready, ignoring");
            } else if inner.desired.contains_key(&update.doc_id) {
                self.schedule_locked(&inner, &update.doc_id);
                self.publish(&inner, StatusChange::Doc(update.doc_id.clone()));
            }
            return Ok(());
        }

        let mut slot = self.write_root();
        let Some(root) = slot.as_mut() else {
            trace!("Root update before root ready, ignoring");
            return Ok(());
        };
        root.apply_update(&update.bin)?;
        let listing = root.docs(self.include_trash);
        let mut inner = self.lock();

        let mut touched = Vec::new();
        for (doc_id, entry) in &listing {
            let changed = match inner.desired.get(doc_id) {
                None => true,
                Some(known) => known.title != entry.title,
            };
            if changed {
                self.schedule_locked(&inner, doc_id);
                touched.push(doc_id.clone());
            }
        }
        for doc_id in inner.desired.keys() {
            if !listing.contains_key(doc_id) {
                touched.push(doc_id.clone());
            }
        }
        inner.desired = listing;
        self.schedule_locked(&inner, &self.root_doc_id);

        debug!(touched = touched.len(), "Root structure updated");
        for doc_id in touched {
            let _ = self.changes.send(StatusChange::Doc(doc_id));
        }
        self.publish(&inner, StatusChange::Doc(self.root_doc_id.clone()));
        Ok(())
    }

    /// Handle to the decoded root structure, for crawls off the runtime.
    pub fn shared_root(&self) -> SharedRoot {
        Arc::clone(&self.root)
    }

    pub fn is_desired(&self, doc_id: &str) -> bool {
        self.lock().desired.contains_key(doc_id)
    }

    pub fn desired_docs(&self) -> DocListing {
        self.lock().desired.clone()
    }

    pub fn indexed_docs(&self) -> DocListing {
        self.lock().indexed.clone()
    }

    pub fn is_indexed(&self, doc_id: &str) -> bool {
        self.lock().indexed.contains_key(doc_id)
    }

    /// Replace the indexed set with what the index store reports.
    pub fn set_indexed_docs(&self, docs: DocListing) {
        let mut inner = self.lock();
        inner.indexed = docs;
        self.publish(&inner, StatusChange::All);
    }

    /// Record that the index now holds `doc_id` with `entry`.
    pub fn mark_indexed(&self, doc_id: &str, entry: DocEntry) {
        let mut inner = self.lock();
        inner.indexed.insert(doc_id.to_string(), entry);
        self.publish(&inner, StatusChange::Doc(doc_id.to_string()));
    }

    /// Record that `doc_id` was removed from the index.
    pub fn unmark_indexed(&self, doc_id: &str) {
        let mut inner = self.lock();
        inner.indexed.remove(doc_id);
        self.publish(&inner, StatusChange::Doc(doc_id.to_string()));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Error / read-only / reset
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn set_error(&self, message: Option<String>) {
        let mut inner = self.lock();
        inner.error_message = message;
        self.publish(&inner, StatusChange::All);
    }

    pub fn set_readonly(&self, readonly: bool) {
        let mut inner = self.lock();
        inner.readonly = readonly;
        self.publish(&inner, StatusChange::All);
    }

    /// Clear everything except the priority table and the error message.
    ///
    /// Used after a loop failure. Pause and battery-save are cleared too.
    pub fn reset(&self) {
        let mut slot = self.write_root();
        let mut inner = self.lock();
        self.clear_run_locked(&mut slot, &mut inner);
        self.control.send_if_modified(|control| {
            let before = *control;
            *control = Control::default();
            *control != before
        });
        self.publish(&inner, StatusChange::All);
    }

    /// Clear the state of a previous run before a fresh start.
    ///
    /// Unlike [`reset`](Self::reset), pause and battery-save set by the host
    /// stay in effect.
    pub fn clear_run(&self) {
        let mut slot = self.write_root();
        let mut inner = self.lock();
        self.clear_run_locked(&mut slot, &mut inner);
        self.publish(&inner, StatusChange::All);
    }

    fn clear_run_locked(
        &self,
        slot: &mut Option<Box<dyn RootStructure>>,
        inner: &mut StatusInner,
    ) {
        self.queue.clear();
        *slot = None;
        inner.desired.clear();
        inner.indexed.clear();
        inner.current_job = None;
        inner.root_ready = false;
        inner.readonly = false;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Observation
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current snapshot.
    pub fn state(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    /// Un-throttled snapshot stream.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn doc_sync_state(&self, doc_id: &str) -> DocSyncState {
        let inner = self.lock();
        self.compute_doc_state(&inner, doc_id)
    }

    /// Stream of [`DocSyncState`] for one document, recomputed when that
    /// document (or everything) changes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn doc_state(self: &Arc<Self>, doc_id: &str) -> watch::Receiver<DocSyncState> {
        let mut changes = self.changes.subscribe();
        let (tx, rx) = watch::channel(self.doc_sync_state(doc_id));
        let status: Weak<Self> = Arc::downgrade(self);
        let doc_id = doc_id.to_string();

        tokio::spawn(async move {
            loop {
                let relevant = tokio::select! {
                    _ = tx.closed() => break,
                    change = changes.recv() => match change {
                        Ok(StatusChange::Doc(id)) => id == doc_id,
                        Ok(StatusChange::All) | Err(RecvError::Lagged(_)) => true,
                        Err(RecvError::Closed) => break,
                    },
                };
                if !relevant {
                    continue;
                }
                let Some(status) = status.upgrade() else {
                    break;
                };
                let next = status.doc_sync_state(&doc_id);
                tx.send_if_modified(|current| {
                    if *current == next {
                        false
                    } else {
                        *current = next;
                        true
                    }
                });
            }
        });

        rx
    }

    /// Resolve once the snapshot reports `completed`.
    pub async fn wait_for_completed(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.subscribe_state();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IndexSyncError::Stopped),
            result = rx.wait_for(|state| state.completed) => {
                result.map(|_| ()).map_err(|_| IndexSyncError::Stopped)
            }
        }
    }

    /// Resolve once `doc_id` is indexed and no longer queued.
    pub async fn wait_for_doc_completed(
        self: &Arc<Self>,
        doc_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut rx = self.doc_state(doc_id);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IndexSyncError::Stopped),
            result = rx.wait_for(|state| state.completed) => {
                result.map(|_| ()).map_err(|_| IndexSyncError::Stopped)
            }
        }
    }
}

impl std::fmt::Debug for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStatus")
            .field("root_doc_id", &self.root_doc_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A temporary priority boost. Reverts on [`revert`](Self::revert) or drop.
#[must_use = "dropping the boost reverts it immediately"]
#[derive(Debug)]
pub struct PriorityBoost {
    status: Option<Weak<SyncStatus>>,
    doc_id: String,
    delta: Priority,
}

impl PriorityBoost {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Subtract the boost again. Later calls are no-ops.
    pub fn revert(&mut self) {
        if let Some(status) = self.status.take().and_then(|weak| weak.upgrade()) {
            status.adjust_priority(&self.doc_id, self.delta.saturating_neg());
        }
    }
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        self.revert();
    }
}
