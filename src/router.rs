// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read routing between the local index and an optional remote replica.
//!
//! Every read waits for the chosen backend to be reachable and then delegates.
//! There is no caching and no implicit retry; callers bound the wait with
//! their own cancellation token.
//!
//! Streaming reads resubscribe after the backend's stream ends (typically on
//! disconnect) once it is reachable again.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{IndexSyncError, Result};
use crate::store::{
    AggregateOptions, AggregateResult, IndexStore, Query, ResultStream, SearchOptions,
    SearchResult, StoreError, Table,
};

/// Which backend a read should prefer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prefer {
    #[default]
    Local,
    Remote,
}

/// Stream of routed read results.
pub type RoutedStream<T> = BoxStream<'static, Result<T>>;

/// Routes search and aggregate reads.
#[derive(Clone)]
pub struct QueryRouter {
    local: Arc<dyn IndexStore>,
    remote: Option<Arc<dyn IndexStore>>,
}

impl QueryRouter {
    pub fn new(local: Arc<dyn IndexStore>, remote: Option<Arc<dyn IndexStore>>) -> Self {
        Self { local, remote }
    }

    /// True when reads preferring `prefer` go to the remote replica.
    pub fn routes_remote(&self, prefer: Prefer) -> bool {
        prefer == Prefer::Remote
            && self
                .remote
                .as_ref()
                .is_some_and(|remote| !remote.is_placeholder())
    }

    fn backend(&self, prefer: Prefer) -> &Arc<dyn IndexStore> {
        match &self.remote {
            Some(remote) if self.routes_remote(prefer) => remote,
            _ => &self.local,
        }
    }

    async fn connected(
        &self,
        prefer: Prefer,
        cancel: &CancellationToken,
    ) -> Result<&Arc<dyn IndexStore>> {
        let backend = self.backend(prefer);
        backend
            .wait_for_connected(cancel)
            .await
            .map_err(|e| IndexSyncError::store("wait for index", e))?;
        Ok(backend)
    }

    pub async fn search(
        &self,
        table: Table,
        query: Query,
        options: SearchOptions,
        prefer: Prefer,
        cancel: &CancellationToken,
    ) -> Result<SearchResult> {
        trace!(table = %table, ?prefer, "search");
        let backend = self.connected(prefer, cancel).await?;
        backend
            .search(table, query, options)
            .await
            .map_err(|e| IndexSyncError::store("search", e))
    }

    pub async fn aggregate(
        &self,
        table: Table,
        query: Query,
        field: &str,
        options: AggregateOptions,
        prefer: Prefer,
        cancel: &CancellationToken,
    ) -> Result<AggregateResult> {
        trace!(table = %table, field, ?prefer, "aggregate");
        let backend = self.connected(prefer, cancel).await?;
        backend
            .aggregate(table, query, field.to_string(), options)
            .await
            .map_err(|e| IndexSyncError::store("aggregate", e))
    }

    /// Live search results. Ends when `cancel` fires.
    pub fn search_stream(
        &self,
        table: Table,
        query: Query,
        options: SearchOptions,
        prefer: Prefer,
        cancel: CancellationToken,
    ) -> RoutedStream<SearchResult> {
        resubscribing(Arc::clone(self.backend(prefer)), cancel, move |store| {
            store.search_stream(table, query.clone(), options.clone())
        })
    }

    /// Live aggregation results. Ends when `cancel` fires.
    pub fn aggregate_stream(
        &self,
        table: Table,
        query: Query,
        field: &str,
        options: AggregateOptions,
        prefer: Prefer,
        cancel: CancellationToken,
    ) -> RoutedStream<AggregateResult> {
        let field = field.to_string();
        resubscribing(Arc::clone(self.backend(prefer)), cancel, move |store| {
            store.aggregate_stream(table, query.clone(), field.clone(), options.clone())
        })
    }
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRouter")
            .field("has_remote", &self.remote.is_some())
            .finish()
    }
}

struct Resubscribe<T, F> {
    backend: Arc<dyn IndexStore>,
    cancel: CancellationToken,
    open: F,
    current: Option<ResultStream<T>>,
    done: bool,
}

/// Wait for `backend`, open a stream, forward it, and start over when it ends.
fn resubscribing<T, F>(
    backend: Arc<dyn IndexStore>,
    cancel: CancellationToken,
    open: F,
) -> RoutedStream<T>
where
    T: Send + 'static,
    F: Fn(&dyn IndexStore) -> ResultStream<T> + Send + 'static,
{
    let state = Resubscribe {
        backend,
        cancel,
        open,
        current: None,
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }

            if st.current.is_none() {
                match st.backend.wait_for_connected(&st.cancel).await {
                    Ok(()) => {
                        trace!("Index reachable, subscribing");
                        st.current = Some((st.open)(st.backend.as_ref()));
                    }
                    Err(StoreError::Cancelled) => return None,
                    Err(e) => {
                        st.done = true;
                        return Some((Err(IndexSyncError::store("wait for index", e)), st));
                    }
                }
            }

            let stream = st.current.as_mut()?;
            let next = tokio::select! {
                biased;
                _ = st.cancel.cancelled() => return None,
                item = stream.next() => item,
            };

            match next {
                Some(item) => {
                    let item = item.map_err(|e| IndexSyncError::store("index stream", e));
                    return Some((item, st));
                }
                None => {
                    debug!("Index stream ended, waiting to resubscribe");
                    st.current = None;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndexStore;
    use crate::store::IndexDocument;
    use std::time::Duration;

    fn titled(id: &str, title: &str) -> IndexDocument {
        IndexDocument::new(id)
            .with_field("docId", id)
            .with_field("title", title)
    }

    #[test]
    fn test_routing_rules() {
        let local = Arc::new(MemoryIndexStore::new());
        let remote = Arc::new(MemoryIndexStore::new());
        let placeholder = Arc::new(MemoryIndexStore::placeholder());

        let none = QueryRouter::new(local.clone(), None);
        assert!(!none.routes_remote(Prefer::Remote));

        let with_remote = QueryRouter::new(local.clone(), Some(remote));
        assert!(with_remote.routes_remote(Prefer::Remote));
        assert!(!with_remote.routes_remote(Prefer::Local));

        let with_placeholder = QueryRouter::new(local, Some(placeholder));
        assert!(!with_placeholder.routes_remote(Prefer::Remote));
    }

    #[tokio::test]
    async fn test_search_routes_by_preference() {
        let local = MemoryIndexStore::new();
        let remote = MemoryIndexStore::new();
        local.insert(Table::Doc, titled("a", "Local")).await.unwrap();
        remote.insert(Table::Doc, titled("b", "Remote")).await.unwrap();

        let router = QueryRouter::new(Arc::new(local), Some(Arc::new(remote)));
        let cancel = CancellationToken::new();

        let result = router
            .search(Table::Doc, Query::All, SearchOptions::default(), Prefer::Local, &cancel)
            .await
            .unwrap();
        assert_eq!(result.nodes[0].id, "a");

        let result = router
            .search(Table::Doc, Query::All, SearchOptions::default(), Prefer::Remote, &cancel)
            .await
            .unwrap();
        assert_eq!(result.nodes[0].id, "b");
    }

    #[tokio::test]
    async fn test_aggregate_delegates() {
        let local = MemoryIndexStore::new();
        local.insert(Table::Doc, titled("a", "x")).await.unwrap();
        local.insert(Table::Doc, titled("b", "x")).await.unwrap();
        let router = QueryRouter::new(Arc::new(local), None);

        let result = router
            .aggregate(
                Table::Doc,
                Query::All,
                "title",
                AggregateOptions::default(),
                Prefer::Remote,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.buckets.len(), 1);
        assert_eq!(result.buckets[0].count, 2);
    }

    #[tokio::test]
    async fn test_search_waits_for_connection() {
        let local = MemoryIndexStore::new();
        local.set_connected(false);
        let router = QueryRouter::new(Arc::new(local.clone()), None);
        let cancel = CancellationToken::new();

        let r = router.clone();
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            r.search(Table::Doc, Query::All, SearchOptions::default(), Prefer::Local, &c)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        local.set_connected(true);
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.pagination.count, 0);
    }

    #[tokio::test]
    async fn test_search_cancelled_while_waiting() {
        let local = MemoryIndexStore::new();
        local.set_connected(false);
        let router = QueryRouter::new(Arc::new(local), None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = router
            .search(Table::Doc, Query::All, SearchOptions::default(), Prefer::Local, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_stopped());
    }

    #[tokio::test]
    async fn test_stream_resubscribes_after_reconnect() {
        let local = MemoryIndexStore::new();
        let router = QueryRouter::new(Arc::new(local.clone()), None);
        let cancel = CancellationToken::new();
        let mut stream = router.search_stream(
            Table::Doc,
            Query::All,
            SearchOptions::default(),
            Prefer::Local,
            cancel.clone(),
        );

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.pagination.count, 0);

        // Inner stream ends; the routed stream waits, then resubscribes
        local.set_connected(false);
        local.set_connected(true);
        local.insert(Table::Doc, titled("a", "A")).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let result = stream.next().await.unwrap().unwrap();
                if result.pagination.count == 1 {
                    return result;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(next.nodes[0].id, "a");

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_stream_routes_remote() {
        let local = MemoryIndexStore::new();
        let remote = MemoryIndexStore::new();
        remote.insert(Table::Doc, titled("r", "R")).await.unwrap();
        let router = QueryRouter::new(Arc::new(local), Some(Arc::new(remote)));

        let mut stream = router.aggregate_stream(
            Table::Doc,
            Query::All,
            "docId",
            AggregateOptions::default(),
            Prefer::Remote,
            CancellationToken::new(),
        );
        let result = stream.next().await.unwrap().unwrap();
        assert_eq!(result.buckets.len(), 1);
        assert_eq!(result.buckets[0].key, "r");
    }
}
