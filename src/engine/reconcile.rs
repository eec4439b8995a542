// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Root job: reconcile the doc table against the root listing.
//!
//! Desired docs missing from the index are inserted, renamed docs are
//! updated, and indexed docs no longer listed are removed together with their
//! blocks and indexed clock.

use tracing::debug;

use super::types::JobOutcome;
use super::worker::Worker;
use crate::error::{IndexSyncError, Result};
use crate::metrics;
use crate::store::{DocEntry, IndexDocument, Query, Table};

/// The `doc` table record for a listed document.
pub(crate) fn doc_record(doc_id: &str, entry: &DocEntry) -> IndexDocument {
    IndexDocument::new(doc_id)
        .with_field("docId", doc_id)
        .with_field("title", entry.title.clone().unwrap_or_default())
}

impl Worker {
    pub(super) async fn reconcile_root(&self) -> Result<JobOutcome> {
        let desired = self.status.desired_docs();
        let indexed = self.status.indexed_docs();

        let mut inserted = 0usize;
        let mut updated = 0usize;
        for (doc_id, entry) in &desired {
            match indexed.get(doc_id) {
                None => {
                    self.index
                        .insert(Table::Doc, doc_record(doc_id, entry))
                        .await
                        .map_err(|e| IndexSyncError::store("insert doc", e))?;
                    metrics::record_doc_upserted("insert");
                    inserted += 1;
                }
                Some(known) if known.title != entry.title => {
                    self.index
                        .update(Table::Doc, doc_record(doc_id, entry))
                        .await
                        .map_err(|e| IndexSyncError::store("update doc", e))?;
                    metrics::record_doc_upserted("update");
                    updated += 1;
                }
                Some(_) => continue,
            }
            self.status.mark_indexed(doc_id, entry.clone());
        }

        let stale: Vec<&String> = indexed
            .keys()
            .filter(|doc_id| !desired.contains_key(*doc_id))
            .collect();
        for doc_id in &stale {
            self.remove_doc(doc_id).await?;
        }

        debug!(
            inserted,
            updated,
            removed = stale.len(),
            "Root listing reconciled"
        );
        Ok(JobOutcome::Reconciled)
    }

    /// Drop a document's record, its blocks, and its indexed clock.
    async fn remove_doc(&self, doc_id: &str) -> Result<()> {
        self.index
            .delete(Table::Doc, doc_id)
            .await
            .map_err(|e| IndexSyncError::store("delete doc", e))?;
        self.index
            .delete_by_query(Table::Block, Query::term("docId", doc_id))
            .await
            .map_err(|e| IndexSyncError::store("delete blocks", e))?;
        self.sync_store
            .clear_doc_indexed_clock(doc_id)
            .await
            .map_err(|e| IndexSyncError::store("clear indexed clock", e))?;
        self.status.unmark_indexed(doc_id);
        metrics::record_doc_deleted();
        debug!(doc_id = %doc_id, "Document removed from index");
        Ok(())
    }
}
