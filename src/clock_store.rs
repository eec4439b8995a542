// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Indexed-clock persistence.
//!
//! Stores one [`DocIndexedClock`] per document in SQLite so that the
//! "already indexed" check survives process restarts.
//!
//! # Write-through cache
//!
//! Reads are served from an in-memory map loaded at open time. Writes update
//! the database first and the cache after, so a failed write never leaves the
//! cache claiming a document is indexed when the disk says otherwise.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Statements are retried with exponential backoff (max 5 attempts).
//!
//! ## Marker Semantics
//!
//! A marker is written only **after** the document's blocks are in the index.
//!
//! ```text
//! crawl doc → write blocks → flush → persist marker
//!                                  (crash here = re-index, idempotent)
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClockStoreConfig;
use crate::error::{IndexSyncError, Result};
use crate::store::{BoxFuture, DocIndexedClock, IndexSyncStore, StoreError};

/// Attempts per statement while the database reports busy or locked.
const BUSY_ATTEMPTS: u32 = 5;
const BUSY_BASE_DELAY: Duration = Duration::from_millis(10);
const BUSY_MAX_DELAY: Duration = Duration::from_millis(500);

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), by code or by message.
fn is_busy(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = e else {
        return false;
    };
    match db_err.code() {
        Some(code) => matches!(&*code, "5" | "6"),
        None => {
            let message = db_err.message().to_lowercase();
            message.contains("locked") || message.contains("busy")
        }
    }
}

/// Run `statement`, backing off and retrying while SQLite is contended.
async fn retry_busy<F, Fut, T>(
    operation: &str,
    mut statement: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut delay = BUSY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match statement().await {
            Err(e) if is_busy(&e) && attempt < BUSY_ATTEMPTS => {
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, "Clock store busy");
                crate::metrics::clock_store_retries_total(operation);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BUSY_MAX_DELAY);
            }
            Err(e) => {
                if is_busy(&e) {
                    warn!(operation, attempt, "Clock store still busy, giving up");
                }
                return Err(e);
            }
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Clock store statement succeeded after retry");
                }
                return Ok(value);
            }
        }
    }
}

fn from_row(doc_id: String, timestamp_ms: i64, indexer_version: i64) -> Option<DocIndexedClock> {
    let timestamp = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)?;
    let indexer_version = u32::try_from(indexer_version).ok()?;
    Some(DocIndexedClock {
        doc_id,
        timestamp,
        indexer_version,
    })
}

/// SQLite-backed [`IndexSyncStore`].
pub struct SqliteIndexSyncStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, DocIndexedClock>>>,
    path: String,
}

impl SqliteIndexSyncStore {
    /// Open the store described by `config`.
    pub async fn open(config: &ClockStoreConfig) -> Result<Self> {
        if config.is_in_memory() {
            Self::in_memory().await
        } else {
            Self::connect(&config.sqlite_path, config.wal_mode).await
        }
    }

    /// Open (or create) a database file with WAL journaling.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect(path, true).await
    }

    /// A private in-memory database. Contents are lost on close.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| IndexSyncError::Config(format!("Invalid SQLite path: {}", e)))?;

        // Every connection gets its own memory database; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        Self::init(pool, ":memory:".to_string()).await
    }

    async fn connect(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing indexed-clock store");

        let journal_mode = if wal_mode {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::init(pool, path_str).await
    }

    async fn init(pool: SqlitePool, path: String) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexer_sync (
                doc_id TEXT PRIMARY KEY,
                timestamp_ms INTEGER NOT NULL,
                indexer_version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64, i64)> =
            sqlx::query_as("SELECT doc_id, timestamp_ms, indexer_version FROM indexer_sync")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (doc_id, timestamp_ms, indexer_version) in rows {
            match from_row(doc_id.clone(), timestamp_ms, indexer_version) {
                Some(clock) => {
                    cache.insert(doc_id, clock);
                }
                None => warn!(doc_id = %doc_id, timestamp_ms, "Ignoring malformed indexed clock"),
            }
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored indexed clocks from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path,
        })
    }

    /// Get a marker from the cache, falling back to disk.
    pub async fn get(&self, doc_id: &str) -> Result<Option<DocIndexedClock>> {
        if let Some(clock) = self.cache.read().await.get(doc_id) {
            return Ok(Some(clock.clone()));
        }

        let pool = &self.pool;
        let row: Option<(String, i64, i64)> = retry_busy("clock_get", || async {
            sqlx::query_as(
                "SELECT doc_id, timestamp_ms, indexer_version FROM indexer_sync WHERE doc_id = ?",
            )
            .bind(doc_id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        let clock = row.and_then(|(id, ts, version)| from_row(id, ts, version));
        if let Some(ref clock) = clock {
            self.cache
                .write()
                .await
                .insert(doc_id.to_string(), clock.clone());
        }
        Ok(clock)
    }

    /// Persist a marker, replacing any previous one for the document.
    pub async fn set(&self, clock: DocIndexedClock) -> Result<()> {
        let pool = &self.pool;
        let timestamp_ms = clock.timestamp.timestamp_millis();
        let version = i64::from(clock.indexer_version);

        retry_busy("clock_set", || async {
            sqlx::query(
                r#"
                INSERT INTO indexer_sync (doc_id, timestamp_ms, indexer_version)
                VALUES (?, ?, ?)
                ON CONFLICT(doc_id) DO UPDATE SET
                    timestamp_ms = excluded.timestamp_ms,
                    indexer_version = excluded.indexer_version
                "#,
            )
            .bind(&clock.doc_id)
            .bind(timestamp_ms)
            .bind(version)
            .execute(pool)
            .await
        })
        .await?;

        debug!(doc_id = %clock.doc_id, timestamp_ms, version, "Indexed clock stored");
        self.cache.write().await.insert(clock.doc_id.clone(), clock);
        Ok(())
    }

    /// Delete the marker for a document. Missing markers are not an error.
    pub async fn clear(&self, doc_id: &str) -> Result<()> {
        let pool = &self.pool;

        retry_busy("clock_clear", || async {
            sqlx::query("DELETE FROM indexer_sync WHERE doc_id = ?")
                .bind(doc_id)
                .execute(pool)
                .await
        })
        .await?;

        self.cache.write().await.remove(doc_id);
        debug!(doc_id = %doc_id, "Indexed clock cleared");
        Ok(())
    }

    /// Number of cached markers.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        retry_busy("clock_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Indexed-clock store closed");
    }
}

impl IndexSyncStore for SqliteIndexSyncStore {
    fn wait_for_connected<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            if self.pool.is_closed() {
                return Err(StoreError::Unavailable("clock store closed".to_string()));
            }
            Ok(())
        })
    }

    fn get_doc_indexed_clock(&self, doc_id: &str) -> BoxFuture<'_, Option<DocIndexedClock>> {
        let doc_id = doc_id.to_string();
        Box::pin(async move {
            self.get(&doc_id)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
    }

    fn set_doc_indexed_clock(&self, clock: DocIndexedClock) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.set(clock).await.map_err(|e| StoreError::Backend(e.to_string())) })
    }

    fn clear_doc_indexed_clock(&self, doc_id: &str) -> BoxFuture<'_, ()> {
        let doc_id = doc_id.to_string();
        Box::pin(async move {
            self.clear(&doc_id)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
    }
}

impl std::fmt::Debug for SqliteIndexSyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteIndexSyncStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
