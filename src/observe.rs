// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Throttled re-publication of `watch` channels.
//!
//! A `watch` channel already behaves as a hot, replay-latest broadcaster.
//! [`throttle`] adds a leading + trailing time throttle on top of it: the
//! first change after a quiet period is forwarded immediately, and a burst of
//! changes inside one window collapses into a single trailing update carrying
//! the latest value.
//!
//! ```text
//! source:   0 ─1─2─3──────────────────4──────────
//! output:   0 ────────[window]3────────4──────────
//!           ^leading            ^trailing  ^leading
//! ```

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

/// Re-publish `source` through a channel throttled to one update per `period`.
///
/// The returned receiver starts with the current value. The forwarding task
/// stops when every returned receiver is dropped or the source closes (after
/// delivering any pending trailing value).
///
/// Must be called from within a Tokio runtime.
pub fn throttle<T>(source: watch::Receiver<T>, period: Duration) -> watch::Receiver<T>
where
    T: Clone + Send + Sync + 'static,
{
    let initial = source.borrow().clone();
    let (tx, rx) = watch::channel(initial);
    tokio::spawn(forward_throttled(source, tx, period));
    rx
}

async fn forward_throttled<T>(mut source: watch::Receiver<T>, tx: watch::Sender<T>, period: Duration)
where
    T: Clone + Send + Sync + 'static,
{
    // The initial value counts as the leading emission of the first window.
    let mut last_emit = Instant::now();
    let mut pending = false;

    loop {
        let deadline = last_emit + period;
        tokio::select! {
            _ = tx.closed() => {
                trace!("Throttled channel has no subscribers, stopping");
                break;
            }
            changed = source.changed() => {
                if changed.is_err() {
                    if pending {
                        tx.send_replace(source.borrow().clone());
                    }
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    tx.send_replace(source.borrow_and_update().clone());
                    last_emit = now;
                    pending = false;
                } else {
                    pending = true;
                }
            }
            _ = tokio::time::sleep_until(deadline), if pending => {
                tx.send_replace(source.borrow_and_update().clone());
                last_emit = Instant::now();
                pending = false;
            }
        }
    }
}
