// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the index sync engine.
//!
//! Errors are categorized by where they happen: collaborator stores, the
//! crawler, or the clock database. The control loop retries every failure
//! except [`IndexSyncError::Stopped`], so a corrupt root or a broken clock
//! database keeps backing off until it is fixed or the engine is stopped.
//!
//! # Error Categories
//!
//! | Error Type | Description |
//! |------------|-------------|
//! | `Timeout` | A dependency did not become reachable in time |
//! | `Store` | Document/index/metadata store failure (see [`StoreError`]) |
//! | `Crawl` | Content extraction failed for one document |
//! | `ClockStore` | Local SQLite errors |
//! | `Config` | Configuration invalid |
//! | `Stopped` | Deliberate cancellation, not a failure |
//! | `Internal` | Unexpected internal error |
//!
//! # The `Stopped` sentinel
//!
//! Cancelling the engine's token surfaces as [`IndexSyncError::Stopped`] from
//! every suspension point. The retry loop checks [`IndexSyncError::is_stopped()`]
//! and exits quietly instead of recording an error message.

use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for index sync operations.
pub type Result<T> = std::result::Result<T, IndexSyncError>;

/// Errors that can occur while keeping the index in sync.
#[derive(Error, Debug)]
pub enum IndexSyncError {
    /// A dependency did not report "reachable" before the deadline.
    #[error("Timeout waiting for {operation} after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// A collaborator store failed.
    #[error("Store error ({operation}): {source}")]
    Store {
        operation: String,
        #[source]
        source: StoreError,
    },

    /// Content extraction failed for a document.
    ///
    /// The control loop treats this as a per-document skip.
    #[error("Crawl error ({doc_id}): {message}")]
    Crawl { doc_id: String, message: String },

    /// SQLite error in the indexed-clock store.
    #[error("Clock store error: {0}")]
    ClockStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine was stopped on purpose.
    #[error("Manually stopped")]
    Stopped,

    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexSyncError {
    /// Wrap a collaborator error with the operation that produced it.
    ///
    /// Cancellation reported by a store becomes [`IndexSyncError::Stopped`].
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        match source {
            StoreError::Cancelled => Self::Stopped,
            source => Self::Store {
                operation: operation.into(),
                source,
            },
        }
    }

    /// Create a crawl error for a document.
    pub fn crawl(doc_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Crawl {
            doc_id: doc_id.into(),
            message: message.into(),
        }
    }

    /// True for the deliberate-stop sentinel.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Store { .. } => "store",
            Self::Crawl { .. } => "crawl",
            Self::ClockStore(_) => "clock_store",
            Self::Config(_) => "config",
            Self::Stopped => "stopped",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for IndexSyncError {
    fn from(e: StoreError) -> Self {
        Self::store("unknown", e)
    }
}
