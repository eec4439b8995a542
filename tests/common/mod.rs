//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Mock DocStore with controllable connectivity and update delivery
//! - JSON root structure and crawler
//! - A harness wiring both to a memory index and an in-memory clock store

#![allow(dead_code)]

pub mod json_crawler;
pub mod mock_docs;

pub use json_crawler::*;
pub use mock_docs::*;

use index_sync::store::{IndexDocument, Query, SearchOptions, Table};
use index_sync::{IndexSyncConfig, IndexSyncEngine, MemoryIndexStore, SqliteIndexSyncStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ROOT: &str = "workspace";

/// Generous upper bound for anything the engine should finish quickly.
pub const WAIT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub docs: Arc<MockDocStore>,
    pub index: MemoryIndexStore,
    pub clocks: Arc<SqliteIndexSyncStore>,
    pub crawler: Arc<JsonCrawler>,
    pub engine: IndexSyncEngine,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_index(MemoryIndexStore::new()).await
    }

    pub async fn with_index(index: MemoryIndexStore) -> Self {
        let clocks = Arc::new(SqliteIndexSyncStore::in_memory().await.unwrap());
        Self::with_parts(MockDocStore::new(), index, clocks, IndexSyncConfig::for_testing(ROOT))
    }

    pub fn with_parts(
        docs: Arc<MockDocStore>,
        index: MemoryIndexStore,
        clocks: Arc<SqliteIndexSyncStore>,
        config: IndexSyncConfig,
    ) -> Self {
        let crawler = Arc::new(JsonCrawler::new());
        let engine = IndexSyncEngine::new(
            config,
            docs.clone(),
            Arc::new(index.clone()),
            clocks.clone(),
            crawler.clone(),
        );
        Self {
            docs,
            index,
            clocks,
            crawler,
            engine,
        }
    }

    /// Seed the root listing and one document per entry.
    pub fn seed(&self, entries: &[(&str, &str)]) {
        self.docs.set_doc(ROOT, root_bin(entries));
        for (doc_id, title) in entries {
            self.docs
                .set_doc(doc_id, doc_bin(title, &[("b1", &format!("{} body", title))]));
        }
    }

    pub async fn wait_completed(&self) {
        let cancel = CancellationToken::new();
        tokio::time::timeout(WAIT, self.engine.wait_for_completed(&cancel))
            .await
            .expect("engine did not complete in time")
            .unwrap();
    }

    pub fn doc_title(&self, doc_id: &str) -> Option<String> {
        self.index
            .get(Table::Doc, doc_id)
            .and_then(|doc| doc.first("title").map(str::to_string))
    }

    /// Block records owned by `doc_id`.
    pub async fn blocks_of(&self, doc_id: &str) -> Vec<IndexDocument> {
        use index_sync::IndexStore;
        let result = self
            .index
            .search(Table::Block, Query::term("docId", doc_id), SearchOptions::unlimited())
            .await
            .unwrap();
        result
            .nodes
            .into_iter()
            .map(|node| IndexDocument {
                id: node.id,
                fields: node.fields,
            })
            .collect()
    }
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
