// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index flush policy.
//!
//! An index may buffer writes and recommend a refresh interval. With no
//! interval (or zero) every mutation is flushed; otherwise a flush happens only
//! once the interval has elapsed since the previous one.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::{IndexSyncError, Result};
use crate::metrics;
use crate::store::IndexStore;

#[derive(Debug)]
pub(crate) struct RefreshPolicy {
    interval: Option<Duration>,
    last_flush: Instant,
}

impl RefreshPolicy {
    pub(crate) fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.filter(|i| !i.is_zero()),
            last_flush: Instant::now(),
        }
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        match self.interval {
            None => true,
            Some(interval) => now.saturating_duration_since(self.last_flush) > interval,
        }
    }

    /// Flush if the policy says so.
    pub(crate) async fn refresh_if_needed(&mut self, index: &dyn IndexStore) -> Result<()> {
        if self.is_due(Instant::now()) {
            self.flush(index).await?;
        }
        Ok(())
    }

    /// Flush unconditionally.
    pub(crate) async fn flush(&mut self, index: &dyn IndexStore) -> Result<()> {
        let started = Instant::now();
        if let Err(e) = index.flush().await {
            metrics::record_flush_error();
            return Err(IndexSyncError::store("flush", e));
        }
        let elapsed = started.elapsed();
        trace!(elapsed_ms = elapsed.as_millis() as u64, "Index flushed");
        metrics::record_flush(elapsed);
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Final flush on loop exit. Errors are logged, never returned.
    pub(crate) async fn flush_on_exit(&mut self, index: &dyn IndexStore) {
        if let Err(e) = self.flush(index).await {
            if !e.is_stopped() {
                warn!(error = %e, "Final index flush failed");
            }
        }
    }
}
