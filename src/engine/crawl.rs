// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document job: re-crawl one document and rewrite its blocks.
//!
//! # Flow
//!
//! ```text
//! not indexed? ─────────────────────────────▶ skip
//! no modification clock? ───────────────────▶ skip
//! indexed clock covers clock + version? ────▶ skip
//! native crawl ──(none / error)──▶ load binary ──▶ crawler
//!      │                              │ missing      │ none / error
//!      ▼                              ▼              ▼
//! delete blocks, insert blocks,      skip           skip
//! update summary, flush per policy,
//! persist indexed clock
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use super::types::{JobOutcome, SkipReason};
use super::worker::Worker;
use crate::error::{IndexSyncError, Result};
use crate::metrics;
use crate::store::{CrawlResult, DocIndexedClock, IndexDocument, Query, StoreError, Table};

enum Crawled {
    Found(CrawlResult),
    Skip(SkipReason),
}

impl Worker {
    pub(super) async fn index_doc(&mut self, doc_id: &str, version: u32) -> Result<JobOutcome> {
        if !self.status.is_indexed(doc_id) {
            return Ok(skip(SkipReason::NotIndexed));
        }

        let clock = self
            .docs
            .get_modification_clock(doc_id)
            .await
            .map_err(|e| IndexSyncError::store("get modification clock", e))?;
        let Some(clock) = clock else {
            return Ok(skip(SkipReason::NoClock));
        };

        let marker = self
            .sync_store
            .get_doc_indexed_clock(doc_id)
            .await
            .map_err(|e| IndexSyncError::store("get indexed clock", e))?;
        if marker.is_some_and(|m| m.covers(&clock, version)) {
            return Ok(skip(SkipReason::Current));
        }

        let crawled = match self.crawl(doc_id).await? {
            Crawled::Found(result) => result,
            Crawled::Skip(reason) => return Ok(skip(reason)),
        };

        self.index
            .delete_by_query(Table::Block, Query::term("docId", doc_id))
            .await
            .map_err(|e| IndexSyncError::store("delete blocks", e))?;

        let block_count = crawled.blocks.len();
        for block in crawled.blocks {
            self.index
                .insert(Table::Block, block.into_index_document(doc_id))
                .await
                .map_err(|e| IndexSyncError::store("insert block", e))?;
        }
        metrics::record_blocks_written(block_count);

        if let Some(preview) = crawled.preview.filter(|p| !p.is_empty()) {
            self.index
                .update(
                    Table::Doc,
                    IndexDocument::new(doc_id).with_field("summary", preview),
                )
                .await
                .map_err(|e| IndexSyncError::store("update summary", e))?;
        }

        self.refresh.refresh_if_needed(self.index.as_ref()).await?;

        self.sync_store
            .set_doc_indexed_clock(DocIndexedClock {
                doc_id: doc_id.to_string(),
                timestamp: clock.timestamp,
                indexer_version: version,
            })
            .await
            .map_err(|e| IndexSyncError::store("set indexed clock", e))?;

        debug!(doc_id = %doc_id, blocks = block_count, "Document indexed");
        Ok(JobOutcome::Indexed)
    }

    /// Native fast path first, then the crawler over the full binary.
    ///
    /// Only cancellation and a missing root structure are errors; crawl
    /// failures become skips so the document is retried on its next change.
    async fn crawl(&self, doc_id: &str) -> Result<Crawled> {
        match self.docs.native_crawl(doc_id).await {
            Ok(Some(result)) => {
                metrics::record_native_crawl_hit();
                return Ok(Crawled::Found(result));
            }
            Ok(None) => {}
            Err(StoreError::Cancelled) => return Err(IndexSyncError::Stopped),
            Err(e) => {
                warn!(doc_id = %doc_id, error = %e, "Native crawl failed, falling back");
                metrics::record_crawl_failure("native");
            }
        }

        let bin = match self.docs.get_document(doc_id).await {
            Ok(Some(bin)) => bin,
            Ok(None) => return Ok(Crawled::Skip(SkipReason::Missing)),
            Err(StoreError::Cancelled) => return Err(IndexSyncError::Stopped),
            Err(e) => return Ok(crawl_failed(IndexSyncError::crawl(doc_id, e.to_string()))),
        };

        // Crawling is synchronous and may be slow; keep it off the runtime
        // and outside the status lock.
        let crawler = Arc::clone(&self.crawler);
        let root = self.status.shared_root();
        let id = doc_id.to_string();
        let crawled = tokio::task::spawn_blocking(move || {
            let slot = root.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.as_deref().map(|root| crawler.crawl(&id, &bin, root))
        })
        .await
        .map_err(|e| IndexSyncError::Internal(format!("crawl task failed: {}", e)))?
        .ok_or_else(|| IndexSyncError::Internal("root structure not loaded".to_string()))?;

        Ok(match crawled {
            Ok(Some(result)) => Crawled::Found(result),
            Ok(None) => Crawled::Skip(SkipReason::Empty),
            Err(e) => crawl_failed(IndexSyncError::crawl(doc_id, e.to_string())),
        })
    }
}

fn skip(reason: SkipReason) -> JobOutcome {
    metrics::record_doc_skipped(reason.as_str());
    JobOutcome::Skipped(reason)
}

fn crawl_failed(error: IndexSyncError) -> Crawled {
    warn!(error = %error, "Crawl failed, skipping document");
    metrics::record_crawl_failure("crawler");
    Crawled::Skip(SkipReason::CrawlFailed)
}
