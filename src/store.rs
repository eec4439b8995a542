// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator contracts.
//!
//! The engine is driven entirely through the traits in this module, which
//! keeps it decoupled from any concrete CRDT library, index backend, or
//! metadata database:
//!
//! - [`DocStore`]: the replicated document store (binary update logs)
//! - [`IndexStore`]: the queryable search index (local or remote replica)
//! - [`IndexSyncStore`]: per-document "indexed clock" markers
//! - [`DocCrawler`] / [`RootStructure`]: content extraction from document binaries
//!
//! All async methods return a boxed future so the traits stay object safe and
//! can be held as `Arc<dyn Trait>`.
//!
//! # Example
//!
//! ```rust,ignore
//! struct MyDocs { /* ... */ }
//!
//! impl DocStore for MyDocs {
//!     fn wait_for_connected<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn get_document(&self, doc_id: &str) -> BoxFuture<'_, Option<Vec<u8>>> {
//!         let doc_id = doc_id.to_string();
//!         Box::pin(async move { Ok(self.load(&doc_id).await) })
//!     }
//!     // ...
//! }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Result type for collaborator operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Stream of query results, re-emitted whenever the underlying table changes.
pub type ResultStream<T> = BoxStream<'static, StoreResult<T>>;

/// Errors reported by collaborator stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The caller's cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// The backend is not reachable right now.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A write was attempted against a read-only index.
    #[error("index is read-only")]
    ReadOnly,

    /// A document binary could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Index data model
// ═══════════════════════════════════════════════════════════════════════════════

/// Index tables maintained by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    /// One record per document: `docId`, `title`, `summary`.
    Doc,
    /// One record per indexed sub-unit, keyed `"{docId}:{blockId}"`.
    Block,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Doc => "doc",
            Table::Block => "block",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record written to the index: an id plus multi-valued string fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub fields: BTreeMap<String, Vec<String>>,
}

impl IndexDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Append a value to a field.
    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields
            .entry(name.to_string())
            .or_default()
            .push(value.into());
        self
    }

    /// Set a field to a list of values; an empty list leaves the field unset.
    pub fn with_values(mut self, name: &str, values: Vec<String>) -> Self {
        if !values.is_empty() {
            self.fields.insert(name.to_string(), values);
        }
        self
    }

    /// Set a field when the value is present.
    pub fn with_optional(self, name: &str, value: Option<String>) -> Self {
        match value {
            Some(value) => self.with_field(name, value),
            None => self,
        }
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    /// First value of a field.
    pub fn first(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(|v| v.first()).map(String::as_str)
    }
}

/// Query over one index table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Query {
    /// Every record in the table.
    All,
    /// Some value of `field` equals `value` exactly.
    Term { field: String, value: String },
    /// Some value of `field` contains `value`, case-insensitively.
    Match { field: String, value: String },
    /// The record has at least one value for `field`.
    Exists { field: String },
    /// Combine sub-queries.
    Boolean { occur: Occur, queries: Vec<Query> },
}

impl Query {
    pub fn term(field: &str, value: impl Into<String>) -> Self {
        Query::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(field: &str, value: impl Into<String>) -> Self {
        Query::Match {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

/// How [`Query::Boolean`] combines its sub-queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Occur {
    /// All sub-queries must match.
    Must,
    /// At least one sub-query must match.
    Should,
    /// No sub-query may match.
    MustNot,
}

/// Pagination and projection for [`IndexStore::search`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default)]
    pub skip: usize,
    /// `None` returns every match.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Fields to return on each node. Empty returns all stored fields.
    #[serde(default)]
    pub fields: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: Some(10),
            fields: Vec::new(),
        }
    }
}

impl SearchOptions {
    /// Every match, no pagination.
    pub fn unlimited() -> Self {
        Self {
            limit: None,
            ..Self::default()
        }
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// Pagination info echoed back with every result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub count: usize,
    pub limit: Option<usize>,
    pub skip: usize,
    pub has_more: bool,
}

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchNode {
    pub id: String,
    pub score: f32,
    pub fields: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub pagination: Pagination,
    pub nodes: Vec<SearchNode>,
}

/// Options for [`IndexStore::aggregate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateOptions {
    /// When set, each bucket carries up to `hits.limit` matching nodes.
    #[serde(default)]
    pub hits: Option<SearchOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub key: String,
    pub count: usize,
    pub hits: Option<SearchResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub pagination: Pagination,
    pub buckets: Vec<AggregateBucket>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Document store types
// ═══════════════════════════════════════════════════════════════════════════════

/// Last modification time of a replicated document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocClock {
    pub doc_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A binary update observed on the replicated store.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub doc_id: String,
    pub bin: Vec<u8>,
}

/// Callback invoked for every observed document update.
///
/// Runs on whatever task or thread delivers store notifications.
pub type UpdateCallback = Arc<dyn Fn(DocUpdate) + Send + Sync>;

/// Handle for an update subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(unsubscribe))),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn noop() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Crawl results
// ═══════════════════════════════════════════════════════════════════════════════

/// Title of a desired document, as listed by the root structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocEntry {
    pub title: Option<String>,
}

/// docId → entry, ordered for deterministic iteration.
pub type DocListing = BTreeMap<String, DocEntry>;

/// One indexable fragment of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_id: String,
    pub flavour: String,
    #[serde(default)]
    pub content: Vec<String>,
    #[serde(default)]
    pub blob: Vec<String>,
    #[serde(default)]
    pub ref_doc_id: Vec<String>,
    #[serde(default)]
    pub ref_info: Vec<String>,
    #[serde(default)]
    pub parent_flavour: Option<String>,
    #[serde(default)]
    pub parent_block_id: Option<String>,
    #[serde(default)]
    pub additional: Option<String>,
}

impl BlockRecord {
    /// Index id of a block record.
    pub fn index_id(doc_id: &str, block_id: &str) -> String {
        format!("{}:{}", doc_id, block_id)
    }

    /// Convert to a `block` table record owned by `doc_id`.
    pub fn into_index_document(self, doc_id: &str) -> IndexDocument {
        IndexDocument::new(Self::index_id(doc_id, &self.block_id))
            .with_field("docId", doc_id)
            .with_field("blockId", self.block_id)
            .with_field("flavour", self.flavour)
            .with_values("content", self.content)
            .with_values("blob", self.blob)
            .with_values("refDocId", self.ref_doc_id)
            .with_values("ref", self.ref_info)
            .with_optional("parentFlavour", self.parent_flavour)
            .with_optional("parentBlockId", self.parent_block_id)
            .with_optional("additional", self.additional)
    }
}

/// Output of crawling a single document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub title: String,
    pub blocks: Vec<BlockRecord>,
    #[serde(default)]
    pub preview: Option<String>,
}

/// Idempotence marker for a document's indexed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocIndexedClock {
    pub doc_id: String,
    pub timestamp: DateTime<Utc>,
    pub indexer_version: u32,
}

impl DocIndexedClock {
    /// True when this marker proves `clock` is already indexed at `version`.
    ///
    /// Timestamps compare at millisecond precision, the resolution markers
    /// are persisted with.
    pub fn covers(&self, clock: &DocClock, version: u32) -> bool {
        self.timestamp.timestamp_millis() == clock.timestamp.timestamp_millis()
            && self.indexer_version == version
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// The replicated document store.
pub trait DocStore: Send + Sync + 'static {
    /// Resolve once the store is reachable. Fails with [`StoreError::Cancelled`]
    /// if `cancel` fires first.
    fn wait_for_connected<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, ()>;

    /// Full binary of a document (snapshot merged with pending updates).
    fn get_document(&self, doc_id: &str) -> BoxFuture<'_, Option<Vec<u8>>>;

    /// Last modification time of a document, `None` if it doesn't exist.
    fn get_modification_clock(&self, doc_id: &str) -> BoxFuture<'_, Option<DocClock>>;

    /// Register a callback for every document update.
    fn subscribe_updates(&self, callback: UpdateCallback) -> Subscription;

    /// Optional fast path: produce the crawl result without a CRDT traversal.
    ///
    /// Default implementation returns `None` (always fall back).
    fn native_crawl(&self, _doc_id: &str) -> BoxFuture<'_, Option<CrawlResult>> {
        Box::pin(async { Ok(None) })
    }
}

/// A queryable search index.
pub trait IndexStore: Send + Sync + 'static {
    fn wait_for_connected<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, ()>;

    /// Read-only indexes are never reconciled.
    fn is_readonly(&self) -> bool;

    /// Placeholder replicas are skipped by the query router.
    fn is_placeholder(&self) -> bool {
        false
    }

    /// Current index-schema version. Clocks written under another version are ignored.
    fn schema_version(&self) -> BoxFuture<'_, u32>;

    /// How often buffered writes should be flushed. `None` or zero means after
    /// every mutation.
    fn recommended_refresh_interval(&self) -> Option<Duration> {
        None
    }

    fn insert(&self, table: Table, document: IndexDocument) -> BoxFuture<'_, ()>;

    /// Upsert: merge the given fields into an existing record, or create it.
    fn update(&self, table: Table, document: IndexDocument) -> BoxFuture<'_, ()>;

    fn delete(&self, table: Table, id: &str) -> BoxFuture<'_, ()>;

    fn delete_by_query(&self, table: Table, query: Query) -> BoxFuture<'_, ()>;

    fn search(&self, table: Table, query: Query, options: SearchOptions)
        -> BoxFuture<'_, SearchResult>;

    fn aggregate(
        &self,
        table: Table,
        query: Query,
        field: String,
        options: AggregateOptions,
    ) -> BoxFuture<'_, AggregateResult>;

    /// Emit a search result now and again after every change to `table`.
    /// The stream ends if the backend disconnects.
    fn search_stream(
        &self,
        table: Table,
        query: Query,
        options: SearchOptions,
    ) -> ResultStream<SearchResult>;

    fn aggregate_stream(
        &self,
        table: Table,
        query: Query,
        field: String,
        options: AggregateOptions,
    ) -> ResultStream<AggregateResult>;

    /// Make buffered writes durable and visible.
    fn flush(&self) -> BoxFuture<'_, ()>;
}

/// Storage for per-document indexed clocks.
pub trait IndexSyncStore: Send + Sync + 'static {
    fn wait_for_connected<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, ()>;

    fn get_doc_indexed_clock(&self, doc_id: &str) -> BoxFuture<'_, Option<DocIndexedClock>>;

    fn set_doc_indexed_clock(&self, clock: DocIndexedClock) -> BoxFuture<'_, ()>;

    fn clear_doc_indexed_clock(&self, doc_id: &str) -> BoxFuture<'_, ()>;
}

/// The decoded root listing, kept up to date by applying updates.
pub trait RootStructure: Send + Sync {
    /// Merge a binary update (or full snapshot) into the structure.
    fn apply_update(&mut self, update: &[u8]) -> StoreResult<()>;

    /// Documents listed by the root, optionally including trashed ones.
    fn docs(&self, include_trash: bool) -> DocListing;
}

/// Content extraction ("crawl a document into indexable fields").
pub trait DocCrawler: Send + Sync + 'static {
    /// An empty root structure for `root_doc_id`.
    fn new_root(&self, root_doc_id: &str) -> Box<dyn RootStructure>;

    /// Extract title, blocks and preview from a document binary.
    ///
    /// `Ok(None)` means the document has nothing to index (e.g. no root block).
    fn crawl(
        &self,
        doc_id: &str,
        bin: &[u8],
        root: &dyn RootStructure,
    ) -> StoreResult<Option<CrawlResult>>;
}
