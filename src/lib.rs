// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Index Sync Engine
//!
//! Keeps a queryable search index consistent with a replicated (CRDT) document
//! store while documents are edited, added, renamed, and removed.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             index-sync-engine                             │
//! │                                                                           │
//! │  DocStore updates ──► SyncStatus ──► PriorityJobQueue ──► control loop    │
//! │  (callback)           (desired /     (root job first,     (one job at a   │
//! │                        indexed sets)  boosts, battery)     time)          │
//! │                                                               │           │
//! │                       IndexSyncStore ◄── indexed clocks ──────┤           │
//! │                       (SQLite)                                ▼           │
//! │                                                          IndexStore       │
//! │                                                               │           │
//! │                              QueryRouter ◄── local / remote ──┘           │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Kinds of Jobs
//!
//! 1. **Root job**: diffs the root listing against the doc table, inserting,
//!    renaming, and removing doc records. Always runs first.
//! 2. **Document job**: re-crawls one document when its modification clock
//!    differs from the persisted indexed clock, and rewrites its blocks.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use index_sync::{IndexSyncConfig, IndexSyncEngine, Prefer, Query, SearchOptions, Table};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = IndexSyncConfig {
//!     root_doc_id: "workspace-1".into(),
//!     ..Default::default()
//! };
//! let engine = IndexSyncEngine::with_sqlite_clock_store(config, docs, index, crawler).await?;
//! engine.start().await?;
//!
//! let cancel = CancellationToken::new();
//! let hits = engine
//!     .query_router()
//!     .search(Table::Block, Query::matches("content", "hello"), SearchOptions::default(), Prefer::Local, &cancel)
//!     .await?;
//!
//! engine.stop().await;
//! ```

pub mod clock_store;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod observe;
pub mod queue;
pub mod resilience;
pub mod router;
pub mod status;
pub mod store;

// Re-exports for convenience
pub use clock_store::SqliteIndexSyncStore;
pub use config::{ClockStoreConfig, IndexSyncConfig};
pub use engine::{EnginePhase, IndexSyncEngine};
pub use error::{IndexSyncError, Result};
pub use memory::{MemoryIndexOptions, MemoryIndexStore};
pub use queue::{Priority, PriorityJobQueue, ROOT_PRIORITY};
pub use router::{Prefer, QueryRouter, RoutedStream};
pub use status::{DocSyncState, PriorityBoost, SharedRoot, SyncState, SyncStatus};
pub use store::{
    AggregateOptions, AggregateResult, BlockRecord, CrawlResult, DocClock, DocCrawler, DocEntry,
    DocIndexedClock, DocListing, DocStore, DocUpdate, IndexDocument, IndexStore, IndexSyncStore,
    Query, RootStructure, SearchOptions, SearchResult, StoreError, Subscription, Table,
};
