// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Re-prioritizable blocking job queue keyed by document id.
//!
//! # Design
//!
//! ```text
//!  push(id, p) ──┐                        ┌──▶ async_pop(min, cancel)
//!                │  Vec<Entry> (max-heap) │      waits on Notify until
//!  set_priority ─┼─▶ HashMap<id, slot>  ──┤      top.priority >= min
//!                │  seq counter (FIFO)    │
//!  clear() ──────┘                        └──▶ try_pop(min)
//! ```
//!
//! Ordering is highest priority first, ties broken by insertion order. The
//! side index makes `set_priority` and `has` O(log n) / O(1).
//!
//! `async_pop` is cancel-safe: a job leaves the heap only inside a synchronous
//! critical section, so dropping the future (or firing the token) never loses
//! work.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{IndexSyncError, Result};

/// Job priority. Larger runs first.
pub type Priority = i64;

/// Priority of the reserved root-listing job. Nothing outranks it.
pub const ROOT_PRIORITY: Priority = Priority::MAX;

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    priority: Priority,
    seq: u64,
}

impl Entry {
    fn outranks(&self, other: &Entry) -> bool {
        self.priority > other.priority || (self.priority == other.priority && self.seq < other.seq)
    }
}

#[derive(Debug, Default)]
struct JobHeap {
    heap: Vec<Entry>,
    slots: HashMap<String, usize>,
    next_seq: u64,
}

impl JobHeap {
    fn push(&mut self, id: &str, priority: Priority) -> bool {
        if self.slots.contains_key(id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = self.heap.len();
        self.heap.push(Entry {
            id: id.to_string(),
            priority,
            seq,
        });
        self.slots.insert(id.to_string(), slot);
        self.sift_up(slot);
        true
    }

    fn set_priority(&mut self, id: &str, priority: Priority) -> bool {
        let Some(&slot) = self.slots.get(id) else {
            return false;
        };
        let old = self.heap[slot].priority;
        self.heap[slot].priority = priority;
        if priority > old {
            self.sift_up(slot);
        } else if priority < old {
            self.sift_down(slot);
        }
        true
    }

    fn peek(&self) -> Option<&Entry> {
        self.heap.first()
    }

    fn pop(&mut self) -> Option<Entry> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let entry = self.heap.pop()?;
        self.slots.remove(&entry.id);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(entry)
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.slots.insert(self.heap[a].id.clone(), a);
        self.slots.insert(self.heap[b].id.clone(), b);
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.heap[slot].outranks(&self.heap[parent]) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut best = slot;
            if left < len && self.heap[left].outranks(&self.heap[best]) {
                best = left;
            }
            if right < len && self.heap[right].outranks(&self.heap[best]) {
                best = right;
            }
            if best == slot {
                break;
            }
            self.swap(slot, best);
            slot = best;
        }
    }
}

/// Blocking priority queue of document ids.
///
/// Safe for one producer and one consumer across tasks/threads. The engine
/// pops with [`try_pop`](Self::try_pop) while holding its status lock and
/// waits on [`notified`](Self::notified) in between.
#[derive(Debug, Default)]
pub struct PriorityJobQueue {
    jobs: Mutex<JobHeap>,
    notify: Notify,
}

impl PriorityJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JobHeap> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `id` if absent. An id already pending keeps its position and
    /// priority. Always wakes a waiting consumer.
    ///
    /// Returns `true` if the id was newly inserted.
    pub fn push(&self, id: &str, priority: Priority) -> bool {
        let inserted = self.lock().push(id, priority);
        self.notify.notify_waiters();
        inserted
    }

    /// Change the priority of a pending job. No effect on ids that are not
    /// queued (including one already popped and in flight).
    pub fn set_priority(&self, id: &str, priority: Priority) -> bool {
        let updated = self.lock().set_priority(id, priority);
        if updated {
            self.notify.notify_waiters();
        }
        updated
    }

    pub fn has(&self, id: &str) -> bool {
        self.lock().slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current priority of a pending job.
    pub fn priority_of(&self, id: &str) -> Option<Priority> {
        let jobs = self.lock();
        jobs.slots.get(id).map(|&slot| jobs.heap[slot].priority)
    }

    /// Remove and return the best job if it meets `min_priority`.
    pub fn try_pop(&self, min_priority: Option<Priority>) -> Option<String> {
        let mut jobs = self.lock();
        let eligible = match (jobs.peek(), min_priority) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(top), Some(min)) => top.priority >= min,
        };
        if eligible {
            jobs.pop().map(|entry| entry.id)
        } else {
            None
        }
    }

    /// Wait for a job with priority >= `min_priority` (any job when `None`),
    /// then remove and return the highest-priority one.
    ///
    /// Fails with [`IndexSyncError::Stopped`] without dequeuing anything if
    /// `cancel` fires first.
    pub async fn async_pop(
        &self,
        min_priority: Option<Priority>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        loop {
            if cancel.is_cancelled() {
                return Err(IndexSyncError::Stopped);
            }

            // Register interest before checking, so a push between the check
            // and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_pop(min_priority) {
                return Ok(id);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IndexSyncError::Stopped),
                _ = &mut notified => {}
            }
        }
    }

    /// Future resolved by the next push or priority raise.
    ///
    /// For callers that pop with [`try_pop`](Self::try_pop) under a lock of
    /// their own; `enable` it before checking the queue.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Drop every pending job. Waiters are not woken.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
