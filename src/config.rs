// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the index sync engine.
//!
//! Configuration is passed to [`IndexSyncEngine::new()`](crate::IndexSyncEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use index_sync::config::IndexSyncConfig;
//!
//! let config = IndexSyncConfig {
//!     root_doc_id: "workspace-1".into(),
//!     ..Default::default()
//! };
//! assert_eq!(config.connect_timeout_duration().as_secs(), 30);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! IndexSyncConfig
//! ├── root_doc_id: String           # Reserved root-listing document id
//! ├── connect_timeout: "30s"        # Deadline for dependencies to be reachable
//! ├── retry_delay: "5s"             # Backoff after a loop failure
//! ├── state_throttle: "1s"          # Observable state throttle window
//! ├── battery_save_min_priority: 1  # Jobs below this wait in battery-save mode
//! ├── include_trash: false          # Index trashed documents too
//! ├── priorities: {docId: i64}      # Initial priority table
//! └── clock_store: ClockStoreConfig # SQLite indexed-clock persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! root_doc_id: "workspace-1"
//! connect_timeout: "30s"
//! retry_delay: "5s"
//! priorities:
//!   pinned-doc: 10
//! clock_store:
//!   sqlite_path: "/var/lib/app/index-sync.db"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::queue::Priority;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSyncConfig {
    /// Id of the root document that lists every other document.
    /// Also the id of the reserved root job.
    pub root_doc_id: String,

    /// How long to wait for all stores to become reachable (e.g. "30s").
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Delay before reconnecting after the loop fails (e.g. "5s").
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    /// Throttle window for the observable state streams (e.g. "1s").
    #[serde(default = "default_state_throttle")]
    pub state_throttle: String,

    /// Minimum job priority accepted while battery-save mode is on.
    #[serde(default = "default_battery_save_min_priority")]
    pub battery_save_min_priority: Priority,

    /// Index documents that the root structure marks as trashed.
    #[serde(default)]
    pub include_trash: bool,

    /// Initial priority table (docId → priority). Missing ids use 0.
    #[serde(default)]
    pub priorities: HashMap<String, Priority>,

    /// Indexed-clock persistence settings.
    #[serde(default)]
    pub clock_store: ClockStoreConfig,
}

fn default_connect_timeout() -> String {
    "30s".to_string()
}

fn default_retry_delay() -> String {
    "5s".to_string()
}

fn default_state_throttle() -> String {
    "1s".to_string()
}

fn default_battery_save_min_priority() -> Priority {
    1
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

impl Default for IndexSyncConfig {
    fn default() -> Self {
        Self {
            root_doc_id: "workspace".to_string(),
            connect_timeout: default_connect_timeout(),
            retry_delay: default_retry_delay(),
            state_throttle: default_state_throttle(),
            battery_save_min_priority: default_battery_save_min_priority(),
            include_trash: false,
            priorities: HashMap::new(),
            clock_store: ClockStoreConfig::default(),
        }
    }
}

impl IndexSyncConfig {
    /// Short timers and an in-memory clock store, for tests.
    pub fn for_testing(root_doc_id: &str) -> Self {
        Self {
            root_doc_id: root_doc_id.to_string(),
            connect_timeout: "500ms".to_string(),
            retry_delay: "50ms".to_string(),
            state_throttle: "10ms".to_string(),
            clock_store: ClockStoreConfig::in_memory(),
            ..Default::default()
        }
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        parse_or(&self.connect_timeout, Duration::from_secs(30))
    }

    pub fn retry_delay_duration(&self) -> Duration {
        parse_or(&self.retry_delay, Duration::from_secs(5))
    }

    pub fn state_throttle_duration(&self) -> Duration {
        parse_or(&self.state_throttle, Duration::from_secs(1))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.root_doc_id.is_empty() {
            return Err(crate::error::IndexSyncError::Config(
                "root_doc_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClockStoreConfig: SQLite persistence for DocIndexedClock markers
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite settings for [`SqliteIndexSyncStore`](crate::clock_store::SqliteIndexSyncStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockStoreConfig {
    /// Path to the database file, or ":memory:".
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Use WAL journaling.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_sqlite_path() -> String {
    "index_sync.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ClockStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
        }
    }
}

impl ClockStoreConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}
