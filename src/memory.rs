// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`IndexStore`] implementation.
//!
//! `MemoryIndexStore` keeps each table as an ordered map of records and
//! evaluates [`Query`] trees directly. It supports everything the engine and
//! the query router need: writes, query deletes, paginated search, field
//! aggregation, reactive streams driven by per-table change counters, flush
//! accounting, a read-only mode, and simulated connectivity.
//!
//! Clones share state, so a test can hand one clone to the engine and inspect
//! the other.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::store::{
    AggregateBucket, AggregateOptions, AggregateResult, BoxFuture, IndexDocument, IndexStore,
    Occur, Pagination, Query, ResultStream, SearchNode, SearchOptions, SearchResult, StoreError,
    StoreResult, Table,
};

/// Behavior switches for [`MemoryIndexStore`].
#[derive(Debug, Clone)]
pub struct MemoryIndexOptions {
    pub readonly: bool,
    pub placeholder: bool,
    pub schema_version: u32,
    /// `None` asks the engine to flush after every mutation.
    pub refresh_interval: Option<Duration>,
    /// Initial connectivity.
    pub connected: bool,
}

impl Default for MemoryIndexOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            placeholder: false,
            schema_version: 1,
            refresh_interval: None,
            connected: true,
        }
    }
}

type Records = BTreeMap<String, IndexDocument>;

struct Inner {
    options: MemoryIndexOptions,
    schema_version: AtomicU32,
    tables: Mutex<HashMap<Table, Records>>,
    doc_changes: watch::Sender<u64>,
    block_changes: watch::Sender<u64>,
    connected: watch::Sender<bool>,
    writes: AtomicUsize,
    flushes: AtomicUsize,
    failures_to_inject: AtomicUsize,
}

/// Reference index store held entirely in memory.
#[derive(Clone)]
pub struct MemoryIndexStore {
    inner: Arc<Inner>,
}

impl Default for MemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::with_options(MemoryIndexOptions::default())
    }

    pub fn with_options(options: MemoryIndexOptions) -> Self {
        let (doc_changes, _) = watch::channel(0);
        let (block_changes, _) = watch::channel(0);
        let (connected, _) = watch::channel(options.connected);
        Self {
            inner: Arc::new(Inner {
                schema_version: AtomicU32::new(options.schema_version),
                options,
                tables: Mutex::new(HashMap::new()),
                doc_changes,
                block_changes,
                connected,
                writes: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
                failures_to_inject: AtomicUsize::new(0),
            }),
        }
    }

    /// A store that rejects writes.
    pub fn readonly() -> Self {
        Self::with_options(MemoryIndexOptions {
            readonly: true,
            ..Default::default()
        })
    }

    /// A stand-in replica the query router should never select.
    pub fn placeholder() -> Self {
        Self::with_options(MemoryIndexOptions {
            placeholder: true,
            ..Default::default()
        })
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<Table, Records>> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn changes(&self, table: Table) -> &watch::Sender<u64> {
        match table {
            Table::Doc => &self.inner.doc_changes,
            Table::Block => &self.inner.block_changes,
        }
    }

    fn notify(&self, table: Table) {
        self.changes(table).send_modify(|version| *version += 1);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.inner.options.readonly {
            return Err(StoreError::ReadOnly);
        }
        if !self.is_connected() {
            return Err(StoreError::Unavailable("index disconnected".to_string()));
        }
        let injected = self
            .inner
            .failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    /// Apply a mutation to one table and publish a change.
    fn mutate(&self, table: Table, f: impl FnOnce(&mut Records)) -> StoreResult<()> {
        self.check_writable()?;
        {
            let mut tables = self.tables();
            f(tables.entry(table).or_default());
        }
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        self.notify(table);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Test / diagnostics accessors
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fetch a record by id.
    pub fn get(&self, table: Table, id: &str) -> Option<IndexDocument> {
        self.tables().get(&table).and_then(|t| t.get(id)).cloned()
    }

    /// Ids in a table, sorted.
    pub fn ids(&self, table: Table) -> Vec<String> {
        self.tables()
            .get(&table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, table: Table) -> usize {
        self.tables().get(&table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }

    /// Successful mutations so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> usize {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    /// Make the next `count` writes fail with a backend error.
    pub fn inject_write_failures(&self, count: usize) {
        self.inner.failures_to_inject.store(count, Ordering::SeqCst);
    }

    pub fn set_schema_version(&self, version: u32) {
        self.inner.schema_version.store(version, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Simulate losing or regaining the backend. Open streams end on disconnect.
    pub fn set_connected(&self, connected: bool) {
        debug!(connected, "Memory index connectivity changed");
        self.inner.connected.send_replace(connected);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Query evaluation
    // ═══════════════════════════════════════════════════════════════════════════

    fn matching(&self, table: Table, query: &Query) -> Vec<(IndexDocument, f32)> {
        let tables = self.tables();
        let Some(records) = tables.get(&table) else {
            return Vec::new();
        };
        let mut hits: Vec<_> = records
            .values()
            .filter_map(|doc| score(doc, query).map(|s| (doc.clone(), s)))
            .collect();
        // Higher score first, then id for stable pages
        hits.sort_by(|(a, sa), (b, sb)| sb.total_cmp(sa).then_with(|| a.id.cmp(&b.id)));
        hits
    }

    fn search_now(&self, table: Table, query: &Query, options: &SearchOptions) -> SearchResult {
        paginate(self.matching(table, query), options)
    }

    fn aggregate_now(
        &self,
        table: Table,
        query: &Query,
        field: &str,
        options: &AggregateOptions,
    ) -> AggregateResult {
        let mut groups: BTreeMap<String, Vec<(IndexDocument, f32)>> = BTreeMap::new();
        for (doc, s) in self.matching(table, query) {
            let Some(values) = doc.get(field) else {
                continue;
            };
            let mut keys: Vec<String> = values.to_vec();
            keys.sort();
            keys.dedup();
            for key in keys {
                groups.entry(key).or_default().push((doc.clone(), s));
            }
        }

        let buckets: Vec<AggregateBucket> = groups
            .into_iter()
            .map(|(key, docs)| AggregateBucket {
                key,
                count: docs.len(),
                hits: options.hits.as_ref().map(|hits| paginate(docs, hits)),
            })
            .collect();

        AggregateResult {
            pagination: Pagination {
                count: buckets.len(),
                limit: None,
                skip: 0,
                has_more: false,
            },
            buckets,
        }
    }

    fn connected_future<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, ()> {
        let mut connected = self.inner.connected.subscribe();
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StoreError::Cancelled),
                result = connected.wait_for(|c| *c) => result
                    .map(|_| ())
                    .map_err(|_| StoreError::Unavailable("index dropped".to_string())),
            }
        })
    }

    /// Re-run `compute` now and after every change to `table` until disconnect.
    fn watch_table<T, F>(&self, table: Table, compute: F) -> ResultStream<T>
    where
        T: Send + 'static,
        F: Fn(&MemoryIndexStore) -> T + Send + Sync + 'static,
    {
        struct StreamState<F> {
            store: MemoryIndexStore,
            changes: watch::Receiver<u64>,
            connected: watch::Receiver<bool>,
            compute: F,
            first: bool,
        }

        let state = StreamState {
            store: self.clone(),
            changes: self.changes(table).subscribe(),
            connected: self.inner.connected.subscribe(),
            compute,
            first: true,
        };

        futures::stream::unfold(state, |mut st| async move {
            if !st.first {
                tokio::select! {
                    changed = st.changes.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    _ = disconnected(&mut st.connected) => return None,
                }
            }
            if !*st.connected.borrow_and_update() {
                return None;
            }
            st.first = false;
            st.changes.borrow_and_update();
            let value = (st.compute)(&st.store);
            Some((Ok(value), st))
        })
        .boxed()
    }
}

async fn disconnected(rx: &mut watch::Receiver<bool>) {
    loop {
        if !*rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Score `doc` against `query`; `None` when it does not match.
fn score(doc: &IndexDocument, query: &Query) -> Option<f32> {
    match query {
        Query::All => Some(1.0),
        Query::Term { field, value } => doc
            .get(field)
            .filter(|values| values.iter().any(|v| v == value))
            .map(|_| 1.0),
        Query::Match { field, value } => {
            let needle = value.to_lowercase();
            let hits = doc
                .get(field)
                .map(|values| {
                    values
                        .iter()
                        .filter(|v| v.to_lowercase().contains(&needle))
                        .count()
                })
                .unwrap_or(0);
            (hits > 0).then_some(hits as f32)
        }
        Query::Exists { field } => doc
            .get(field)
            .filter(|values| !values.is_empty())
            .map(|_| 1.0),
        Query::Boolean { occur, queries } => {
            let scores: Vec<Option<f32>> = queries.iter().map(|q| score(doc, q)).collect();
            match occur {
                Occur::Must => scores
                    .iter()
                    .try_fold(0.0, |acc, s| s.map(|s| acc + s))
                    .map(|total: f32| total.max(1.0)),
                Occur::Should => {
                    let total: f32 = scores.iter().flatten().sum();
                    scores.iter().any(Option::is_some).then_some(total)
                }
                Occur::MustNot => scores.iter().all(Option::is_none).then_some(1.0),
            }
        }
    }
}

fn paginate(hits: Vec<(IndexDocument, f32)>, options: &SearchOptions) -> SearchResult {
    let count = hits.len();
    let page: Vec<SearchNode> = hits
        .into_iter()
        .skip(options.skip)
        .take(options.limit.unwrap_or(usize::MAX))
        .map(|(doc, score)| {
            let fields = if options.fields.is_empty() {
                doc.fields
            } else {
                doc.fields
                    .into_iter()
                    .filter(|(name, _)| options.fields.contains(name))
                    .collect()
            };
            SearchNode {
                id: doc.id,
                score,
                fields,
            }
        })
        .collect();

    SearchResult {
        pagination: Pagination {
            count,
            limit: options.limit,
            skip: options.skip,
            has_more: options.skip.saturating_add(page.len()) < count,
        },
        nodes: page,
    }
}

impl IndexStore for MemoryIndexStore {
    fn wait_for_connected<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, ()> {
        self.connected_future(cancel)
    }

    fn is_readonly(&self) -> bool {
        self.inner.options.readonly
    }

    fn is_placeholder(&self) -> bool {
        self.inner.options.placeholder
    }

    fn schema_version(&self) -> BoxFuture<'_, u32> {
        let version = self.inner.schema_version.load(Ordering::SeqCst);
        Box::pin(async move { Ok(version) })
    }

    fn recommended_refresh_interval(&self) -> Option<Duration> {
        self.inner.options.refresh_interval
    }

    fn insert(&self, table: Table, document: IndexDocument) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            trace!(table = %table, id = %document.id, "insert");
            self.mutate(table, |records| {
                records.insert(document.id.clone(), document);
            })
        })
    }

    fn update(&self, table: Table, document: IndexDocument) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            trace!(table = %table, id = %document.id, "update");
            self.mutate(table, |records| {
                let existing = records
                    .entry(document.id.clone())
                    .or_insert_with(|| IndexDocument::new(document.id.clone()));
                existing.fields.extend(document.fields);
            })
        })
    }

    fn delete(&self, table: Table, id: &str) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            trace!(table = %table, id = %id, "delete");
            self.mutate(table, |records| {
                records.remove(&id);
            })
        })
    }

    fn delete_by_query(&self, table: Table, query: Query) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.mutate(table, |records| {
                records.retain(|_, doc| score(doc, &query).is_none());
            })
        })
    }

    fn search(
        &self,
        table: Table,
        query: Query,
        options: SearchOptions,
    ) -> BoxFuture<'_, SearchResult> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(StoreError::Unavailable("index disconnected".to_string()));
            }
            Ok(self.search_now(table, &query, &options))
        })
    }

    fn aggregate(
        &self,
        table: Table,
        query: Query,
        field: String,
        options: AggregateOptions,
    ) -> BoxFuture<'_, AggregateResult> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(StoreError::Unavailable("index disconnected".to_string()));
            }
            Ok(self.aggregate_now(table, &query, &field, &options))
        })
    }

    fn search_stream(
        &self,
        table: Table,
        query: Query,
        options: SearchOptions,
    ) -> ResultStream<SearchResult> {
        self.watch_table(table, move |store| store.search_now(table, &query, &options))
    }

    fn aggregate_stream(
        &self,
        table: Table,
        query: Query,
        field: String,
        options: AggregateOptions,
    ) -> ResultStream<AggregateResult> {
        self.watch_table(table, move |store| {
            store.aggregate_now(table, &query, &field, &options)
        })
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(StoreError::Unavailable("index disconnected".to_string()));
            }
            self.inner.flushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}

impl std::fmt::Debug for MemoryIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryIndexStore")
            .field("options", &self.inner.options)
            .field("docs", &self.len(Table::Doc))
            .field("blocks", &self.len(Table::Block))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlockRecord;

    fn block(doc_id: &str, block_id: &str, content: &str) -> IndexDocument {
        BlockRecord {
            block_id: block_id.to_string(),
            flavour: "affine:paragraph".to_string(),
            content: vec![content.to_string()],
            ..Default::default()
        }
        .into_index_document(doc_id)
    }

    async fn seeded() -> MemoryIndexStore {
        let store = MemoryIndexStore::new();
        store.insert(Table::Block, block("d1", "b1", "Hello world")).await.unwrap();
        store.insert(Table::Block, block("d1", "b2", "hello again")).await.unwrap();
        store.insert(Table::Block, block("d2", "b1", "goodbye")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = seeded().await;
        assert_eq!(store.len(Table::Block), 3);
        assert!(store.is_empty(Table::Doc));
        let record = store.get(Table::Block, "d1:b1").unwrap();
        assert_eq!(record.first("content"), Some("Hello world"));
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = MemoryIndexStore::new();
        store
            .insert(Table::Doc, IndexDocument::new("d1").with_field("title", "A"))
            .await
            .unwrap();
        store
            .update(Table::Doc, IndexDocument::new("d1").with_field("summary", "preview"))
            .await
            .unwrap();
        let doc = store.get(Table::Doc, "d1").unwrap();
        assert_eq!(doc.first("title"), Some("A"));
        assert_eq!(doc.first("summary"), Some("preview"));

        // Update creates missing records
        store
            .update(Table::Doc, IndexDocument::new("d2").with_field("title", "B"))
            .await
            .unwrap();
        assert!(store.get(Table::Doc, "d2").is_some());
    }

    #[tokio::test]
    async fn test_delete_by_term_is_exact() {
        let store = seeded().await;
        store.insert(Table::Block, block("d10", "b1", "other")).await.unwrap();
        store
            .delete_by_query(Table::Block, Query::term("docId", "d1"))
            .await
            .unwrap();
        assert_eq!(store.ids(Table::Block), vec!["d10:b1", "d2:b1"]);
    }

    #[tokio::test]
    async fn test_match_is_case_insensitive_and_scored() {
        let store = seeded().await;
        let result = store
            .search(Table::Block, Query::matches("content", "HELLO"), SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.pagination.count, 2);
        let ids: Vec<_> = result.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["d1:b1", "d1:b2"]);
    }

    #[tokio::test]
    async fn test_pagination_and_projection() {
        let store = seeded().await;
        let options = SearchOptions {
            skip: 1,
            limit: Some(1),
            fields: vec!["docId".to_string()],
        };
        let result = store.search(Table::Block, Query::All, options).await.unwrap();
        assert_eq!(result.pagination.count, 3);
        assert!(result.pagination.has_more);
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].fields.len(), 1);
        assert!(result.nodes[0].fields.contains_key("docId"));

        let all = store
            .search(Table::Block, Query::All, SearchOptions::unlimited())
            .await
            .unwrap();
        assert_eq!(all.nodes.len(), 3);
        assert!(!all.pagination.has_more);
    }

    #[tokio::test]
    async fn test_boolean_queries() {
        let store = seeded().await;
        let must = Query::Boolean {
            occur: Occur::Must,
            queries: vec![Query::term("docId", "d1"), Query::matches("content", "again")],
        };
        let result = store
            .search(Table::Block, must, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].id, "d1:b2");

        let must_not = Query::Boolean {
            occur: Occur::MustNot,
            queries: vec![Query::term("docId", "d1")],
        };
        let result = store
            .search(Table::Block, must_not, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].id, "d2:b1");

        let should = Query::Boolean {
            occur: Occur::Should,
            queries: vec![Query::term("docId", "d2"), Query::Exists { field: "blob".into() }],
        };
        let result = store
            .search(Table::Block, should, SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_by_doc() {
        let store = seeded().await;
        let result = store
            .aggregate(
                Table::Block,
                Query::All,
                "docId".to_string(),
                AggregateOptions {
                    hits: Some(SearchOptions {
                        limit: Some(1),
                        ..Default::default()
                    }),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.buckets.len(), 2);
        assert_eq!(result.buckets[0].key, "d1");
        assert_eq!(result.buckets[0].count, 2);
        let hits = result.buckets[0].hits.as_ref().unwrap();
        assert_eq!(hits.nodes.len(), 1);
        assert!(hits.pagination.has_more);
    }

    #[tokio::test]
    async fn test_readonly_rejects_writes() {
        let store = MemoryIndexStore::readonly();
        assert!(store.is_readonly());
        let err = store
            .insert(Table::Doc, IndexDocument::new("d1"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::ReadOnly);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryIndexStore::new();
        store.inject_write_failures(1);
        assert!(store.insert(Table::Doc, IndexDocument::new("a")).await.is_err());
        assert!(store.insert(Table::Doc, IndexDocument::new("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_flush_counts() {
        let store = MemoryIndexStore::new();
        store.flush().await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.flush_count(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_connected() {
        let store = MemoryIndexStore::with_options(MemoryIndexOptions {
            connected: false,
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let s = store.clone();
        let c = cancel.clone();
        let handle = tokio::spawn(async move { s.wait_for_connected(&c).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        store.set_connected(true);
        handle.await.unwrap().unwrap();

        store.set_connected(false);
        cancel.cancel();
        assert_eq!(
            store.wait_for_connected(&cancel).await.unwrap_err(),
            StoreError::Cancelled
        );
    }

    #[tokio::test]
    async fn test_search_stream_reemits_and_ends_on_disconnect() {
        let store = MemoryIndexStore::new();
        let mut stream = store.search_stream(Table::Doc, Query::All, SearchOptions::default());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.pagination.count, 0);

        store.insert(Table::Doc, IndexDocument::new("d1")).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.pagination.count, 1);

        // Changes to other tables don't wake the stream
        store.insert(Table::Block, block("d1", "b1", "x")).await.unwrap();
        store.set_connected(false);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_stream() {
        let store = seeded().await;
        let mut stream = store.aggregate_stream(
            Table::Block,
            Query::All,
            "docId".to_string(),
            AggregateOptions::default(),
        );
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.buckets.len(), 2);

        store.insert(Table::Block, block("d3", "b1", "new")).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.buckets.len(), 3);
    }
}
