//! Mock DocStore for testing.
//!
//! Holds document binaries with strictly increasing modification clocks,
//! delivers updates to subscribers synchronously, and can simulate
//! disconnects, native crawl results, and native crawl failures.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use index_sync::store::{
    BoxFuture, CrawlResult, DocClock, DocStore, DocUpdate, StoreError, Subscription,
    UpdateCallback,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct StoredDoc {
    bin: Vec<u8>,
    timestamp: DateTime<Utc>,
}

type Subscribers = Arc<Mutex<Vec<(u64, UpdateCallback)>>>;

/// In-memory replicated document store.
///
/// # Example
/// ```rust,ignore
/// let docs = MockDocStore::new();
/// docs.set_doc("workspace", root_bin(&[("d1", "Title")]));
/// docs.set_doc("d1", doc_bin("Title", &[("b1", "hello")]));
/// ```
pub struct MockDocStore {
    docs: Mutex<HashMap<String, StoredDoc>>,
    native: Mutex<HashMap<String, CrawlResult>>,
    native_failures: AtomicUsize,
    subscribers: Subscribers,
    next_subscriber: AtomicU64,
    connected: watch::Sender<bool>,
    last_timestamp: Mutex<DateTime<Utc>>,
}

impl MockDocStore {
    pub fn new() -> Arc<Self> {
        let (connected, _) = watch::channel(true);
        Arc::new(Self {
            docs: Mutex::new(HashMap::new()),
            native: Mutex::new(HashMap::new()),
            native_failures: AtomicUsize::new(0),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(0),
            connected,
            last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
        })
    }

    /// A new clock at least one millisecond after the previous one.
    fn tick(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock().unwrap();
        let now = Utc::now();
        let next = if now > *last + ChronoDuration::milliseconds(1) {
            now
        } else {
            *last + ChronoDuration::milliseconds(1)
        };
        *last = next;
        next
    }

    /// Store a document and notify subscribers.
    pub fn set_doc(&self, doc_id: &str, bin: Vec<u8>) {
        let timestamp = self.tick();
        self.docs.lock().unwrap().insert(
            doc_id.to_string(),
            StoredDoc {
                bin: bin.clone(),
                timestamp,
            },
        );
        self.notify(DocUpdate {
            doc_id: doc_id.to_string(),
            bin,
        });
    }

    /// Store a document without notifying anyone.
    pub fn set_doc_silently(&self, doc_id: &str, bin: Vec<u8>) {
        let timestamp = self.tick();
        self.docs
            .lock()
            .unwrap()
            .insert(doc_id.to_string(), StoredDoc { bin, timestamp });
    }

    pub fn remove_doc(&self, doc_id: &str) {
        self.docs.lock().unwrap().remove(doc_id);
    }

    fn notify(&self, update: DocUpdate) {
        let callbacks: Vec<UpdateCallback> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(update.clone());
        }
    }

    pub fn set_native(&self, doc_id: &str, result: CrawlResult) {
        self.native.lock().unwrap().insert(doc_id.to_string(), result);
    }

    /// Make the next `count` native crawls fail.
    pub fn fail_native_crawls(&self, count: usize) {
        self.native_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl DocStore for MockDocStore {
    fn wait_for_connected<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, ()> {
        let mut rx = self.connected.subscribe();
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StoreError::Cancelled),
                result = rx.wait_for(|c| *c) => result
                    .map(|_| ())
                    .map_err(|e| StoreError::Unavailable(e.to_string())),
            }
        })
    }

    fn get_document(&self, doc_id: &str) -> BoxFuture<'_, Option<Vec<u8>>> {
        let bin = self
            .docs
            .lock()
            .unwrap()
            .get(doc_id)
            .map(|doc| doc.bin.clone());
        Box::pin(async move { Ok(bin) })
    }

    fn get_modification_clock(&self, doc_id: &str) -> BoxFuture<'_, Option<DocClock>> {
        let clock = self.docs.lock().unwrap().get(doc_id).map(|doc| DocClock {
            doc_id: doc_id.to_string(),
            timestamp: doc.timestamp,
        });
        Box::pin(async move { Ok(clock) })
    }

    fn subscribe_updates(&self, callback: UpdateCallback) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().push((id, callback));
        let subscribers = Arc::clone(&self.subscribers);
        Subscription::new(move || {
            subscribers.lock().unwrap().retain(|(sid, _)| *sid != id);
        })
    }

    fn native_crawl(&self, doc_id: &str) -> BoxFuture<'_, Option<CrawlResult>> {
        let failing = self
            .native_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = self.native.lock().unwrap().get(doc_id).cloned();
        Box::pin(async move {
            if failing {
                return Err(StoreError::Backend("native crawler crashed".to_string()));
            }
            Ok(result)
        })
    }
}
