// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Job throughput by kind and outcome
//! - Index writes (doc upserts, block inserts, deletions)
//! - Crawl failures and native-crawl hits
//! - Flush count and latency
//! - Queue depth, progress, and engine phase
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `index_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use index_sync::metrics;
//! use std::time::Duration;
//!
//! // After a document job finishes
//! metrics::record_job("doc", "indexed");
//! metrics::record_blocks_written(42);
//!
//! // After an index flush
//! metrics::record_flush(Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a processed job.
///
/// `kind` is `"root"` or `"doc"`; `outcome` is e.g. `"indexed"`, `"skipped"`.
pub fn record_job(kind: &str, outcome: &str) {
    counter!("index_sync_jobs_total", "kind" => kind.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record job processing latency.
pub fn record_job_duration(kind: &str, duration: Duration) {
    histogram!("index_sync_job_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a document job skipped without index writes.
pub fn record_doc_skipped(reason: &str) {
    counter!("index_sync_docs_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a doc record written during root reconciliation.
pub fn record_doc_upserted(operation: &str) {
    counter!("index_sync_docs_upserted_total", "operation" => operation.to_string()).increment(1);
}

/// Record a document removed from the index.
pub fn record_doc_deleted() {
    counter!("index_sync_docs_deleted_total").increment(1);
}

/// Record block records inserted for one document.
pub fn record_blocks_written(count: usize) {
    counter!("index_sync_blocks_written_total").increment(count as u64);
    histogram!("index_sync_blocks_per_doc").record(count as f64);
}

/// Record a failed crawl. `source` is `"native"` or `"crawler"`.
pub fn record_crawl_failure(source: &str) {
    counter!("index_sync_crawl_failures_total", "source" => source.to_string()).increment(1);
}

/// Record a crawl served by the document store's native fast path.
pub fn record_native_crawl_hit() {
    counter!("index_sync_native_crawl_hits_total").increment(1);
}

/// Record an index flush and its latency.
pub fn record_flush(duration: Duration) {
    counter!("index_sync_flushes_total").increment(1);
    histogram!("index_sync_flush_duration_seconds").record(duration.as_secs_f64());
}

/// Record a failed flush.
pub fn record_flush_error() {
    counter!("index_sync_flush_errors_total").increment(1);
}

/// Record an indexed-clock SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn clock_store_retries_total(operation: &str) {
    counter!("index_sync_clock_store_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a control-loop failure that triggers a reset and backoff.
pub fn record_loop_error(error_type: &str) {
    counter!("index_sync_loop_errors_total", "error_type" => error_type.to_string()).increment(1);
}

/// Record a control-loop restart after backoff.
pub fn record_loop_restart() {
    counter!("index_sync_loop_restarts_total").increment(1);
}

/// Gauge for pending jobs.
pub fn set_queue_depth(depth: usize) {
    gauge!("index_sync_queue_depth").set(depth as f64);
}

/// Gauges mirroring the published progress snapshot.
pub fn set_progress(indexing: usize, total: usize) {
    gauge!("index_sync_indexing").set(indexing as f64);
    gauge!("index_sync_total").set(total as f64);
}

/// Gauge for engine phase.
pub fn set_engine_phase(phase: &str) {
    // Numeric encoding for alerting
    let value = match phase {
        "Idle" => 0.0,
        "Connecting" => 1.0,
        "RootReconcile" => 2.0,
        "SteadyState" => 3.0,
        "Backoff" => 4.0,
        "ReadOnly" => 5.0,
        "Stopped" => 6.0,
        _ => -1.0,
    };
    gauge!("index_sync_engine_phase").set(value);
}
