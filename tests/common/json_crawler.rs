//! JSON stand-ins for the CRDT root structure and content extraction.
//!
//! Root document binaries are JSON listings that replace the whole listing on
//! every update. Document binaries are JSON `{title, blocks, preview}` objects;
//! `null` means "nothing to index" and anything unparseable is a crawl error.

use index_sync::store::{
    BlockRecord, CrawlResult, DocCrawler, DocEntry, DocListing, RootStructure, StoreError,
    StoreResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootEntry {
    title: Option<String>,
    #[serde(default)]
    trash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocContent {
    title: String,
    blocks: Vec<(String, String)>,
    #[serde(default)]
    preview: Option<String>,
}

/// Root listing binary: `(docId, title)` pairs.
pub fn root_bin(entries: &[(&str, &str)]) -> Vec<u8> {
    let listing: Vec<(&str, &str, bool)> = entries.iter().map(|(id, t)| (*id, *t, false)).collect();
    root_bin_with_trash(&listing)
}

/// Root listing binary: `(docId, title, trashed)` triples.
pub fn root_bin_with_trash(entries: &[(&str, &str, bool)]) -> Vec<u8> {
    let listing: BTreeMap<String, RootEntry> = entries
        .iter()
        .map(|(id, title, trash)| {
            (
                id.to_string(),
                RootEntry {
                    title: Some(title.to_string()),
                    trash: *trash,
                },
            )
        })
        .collect();
    serde_json::to_vec(&listing).unwrap()
}

/// Document binary with `(blockId, text)` blocks.
pub fn doc_bin(title: &str, blocks: &[(&str, &str)]) -> Vec<u8> {
    doc_bin_with_preview(title, blocks, None)
}

pub fn doc_bin_with_preview(title: &str, blocks: &[(&str, &str)], preview: Option<&str>) -> Vec<u8> {
    serde_json::to_vec(&DocContent {
        title: title.to_string(),
        blocks: blocks
            .iter()
            .map(|(id, text)| (id.to_string(), text.to_string()))
            .collect(),
        preview: preview.map(str::to_string),
    })
    .unwrap()
}

/// A document the crawler finds nothing in.
pub fn empty_doc_bin() -> Vec<u8> {
    b"null".to_vec()
}

/// Bytes the crawler cannot parse.
pub fn corrupt_bin() -> Vec<u8> {
    b"\x00\x01 not json".to_vec()
}

#[derive(Default)]
pub struct JsonRoot {
    listing: BTreeMap<String, RootEntry>,
}

impl RootStructure for JsonRoot {
    fn apply_update(&mut self, update: &[u8]) -> StoreResult<()> {
        self.listing =
            serde_json::from_slice(update).map_err(|e| StoreError::Parse(e.to_string()))?;
        Ok(())
    }

    fn docs(&self, include_trash: bool) -> DocListing {
        self.listing
            .iter()
            .filter(|(_, entry)| include_trash || !entry.trash)
            .map(|(id, entry)| {
                (
                    id.clone(),
                    DocEntry {
                        title: entry.title.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Crawler over [`doc_bin`] payloads. Records every crawled doc id.
#[derive(Default)]
pub struct JsonCrawler {
    crawled: Mutex<Vec<String>>,
}

impl JsonCrawler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Doc ids in crawl order.
    pub fn crawled(&self) -> Vec<String> {
        self.crawled.lock().unwrap().clone()
    }

    pub fn crawl_count(&self, doc_id: &str) -> usize {
        self.crawled
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == doc_id)
            .count()
    }
}

impl DocCrawler for JsonCrawler {
    fn new_root(&self, _root_doc_id: &str) -> Box<dyn RootStructure> {
        Box::new(JsonRoot::default())
    }

    fn crawl(
        &self,
        doc_id: &str,
        bin: &[u8],
        _root: &dyn RootStructure,
    ) -> StoreResult<Option<CrawlResult>> {
        self.crawled.lock().unwrap().push(doc_id.to_string());
        let content: Option<DocContent> =
            serde_json::from_slice(bin).map_err(|e| StoreError::Parse(e.to_string()))?;
        Ok(content.map(|content| CrawlResult {
            title: content.title,
            blocks: content
                .blocks
                .into_iter()
                .map(|(block_id, text)| BlockRecord {
                    block_id,
                    flavour: "affine:paragraph".to_string(),
                    content: vec![text],
                    ..Default::default()
                })
                .collect(),
            preview: content.preview,
        }))
    }
}
