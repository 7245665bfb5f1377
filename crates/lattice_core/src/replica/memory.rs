//! In-memory replica store for tests and development.
//!
//! Data is lost when dropped. Supports injected write failures so tests can
//! observe the atomic edge-set replacement guarantee.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use super::store::ReplicaStore;
use super::types::{GhostLink, Link, PageMetadata};
use crate::error::{LatticeError, Result};

/// In-memory replica store.
///
/// Thread-safe via `RwLock`; pages keep insertion order for deterministic
/// iteration in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pages: RwLock<IndexMap<String, PageMetadata>>,

    /// Outgoing edge sets, keyed by source page id.
    links: RwLock<HashMap<String, Vec<Link>>>,
    ghost_links: RwLock<HashMap<String, Vec<GhostLink>>>,

    /// Document blobs: page id -> (state, version).
    documents: RwLock<HashMap<String, (Vec<u8>, i64)>>,

    search_index: RwLock<HashMap<String, String>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,

    /// When set, the next edge-set replacement fails before touching state.
    fail_next_edge_save: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `save_links`/`save_ghost_links` call fail without
    /// applying anything. Used to verify that a failed replacement leaves
    /// the prior edge set fully intact.
    pub fn inject_edge_save_failure(&self) {
        self.fail_next_edge_save.store(true, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> Result<()> {
        if self.fail_next_edge_save.swap(false, Ordering::SeqCst) {
            return Err(LatticeError::Io(std::io::Error::other(
                "injected write failure",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaStore for MemoryStore {
    async fn get_all_pages(&self) -> Result<Vec<PageMetadata>> {
        let pages = self.pages.read().unwrap();
        Ok(pages.values().cloned().collect())
    }

    async fn get_page(&self, id: &str) -> Result<Option<PageMetadata>> {
        let pages = self.pages.read().unwrap();
        Ok(pages.get(id).cloned())
    }

    async fn upsert_page(&self, meta: &PageMetadata) -> Result<()> {
        let mut pages = self.pages.write().unwrap();
        pages.insert(meta.id.clone(), meta.clone());
        Ok(())
    }

    async fn delete_page(&self, id: &str) -> Result<()> {
        let mut pages = self.pages.write().unwrap();
        if let Some(page) = pages.get_mut(id) {
            page.mark_deleted();
        }
        Ok(())
    }

    async fn get_links(&self, page_id: &str) -> Result<Vec<Link>> {
        let links = self.links.read().unwrap();
        Ok(links.get(page_id).cloned().unwrap_or_default())
    }

    async fn get_backlinks(&self, page_id: &str) -> Result<Vec<Link>> {
        let links = self.links.read().unwrap();
        Ok(links
            .values()
            .flatten()
            .filter(|l| l.target_id == page_id)
            .cloned()
            .collect())
    }

    async fn get_all_links(&self) -> Result<Vec<Link>> {
        let links = self.links.read().unwrap();
        Ok(links.values().flatten().cloned().collect())
    }

    async fn save_links(&self, source_page_id: &str, new_links: &[Link]) -> Result<()> {
        self.check_injected_failure()?;
        // Build the replacement fully before swapping so a panic or failure
        // above never leaves a half-replaced set.
        let replacement: Vec<Link> = new_links.to_vec();
        let mut links = self.links.write().unwrap();
        links.insert(source_page_id.to_string(), replacement);
        Ok(())
    }

    async fn get_ghost_links(&self, source_page_id: &str) -> Result<Vec<GhostLink>> {
        let ghosts = self.ghost_links.read().unwrap();
        Ok(ghosts.get(source_page_id).cloned().unwrap_or_default())
    }

    async fn get_ghost_links_by_text(&self, text: &str) -> Result<Vec<GhostLink>> {
        let ghosts = self.ghost_links.read().unwrap();
        Ok(ghosts
            .values()
            .flatten()
            .filter(|g| g.link_text == text)
            .cloned()
            .collect())
    }

    async fn get_all_ghost_links(&self) -> Result<Vec<GhostLink>> {
        let ghosts = self.ghost_links.read().unwrap();
        Ok(ghosts.values().flatten().cloned().collect())
    }

    async fn save_ghost_links(&self, source_page_id: &str, new_links: &[GhostLink]) -> Result<()> {
        self.check_injected_failure()?;
        let replacement: Vec<GhostLink> = new_links.to_vec();
        let mut ghosts = self.ghost_links.write().unwrap();
        ghosts.insert(source_page_id.to_string(), replacement);
        Ok(())
    }

    async fn get_document_state(&self, page_id: &str) -> Result<Option<Vec<u8>>> {
        let docs = self.documents.read().unwrap();
        Ok(docs.get(page_id).map(|(state, _)| state.clone()))
    }

    async fn save_document_state(&self, page_id: &str, state: &[u8], version: i64) -> Result<()> {
        let mut docs = self.documents.write().unwrap();
        docs.insert(page_id.to_string(), (state.to_vec(), version));
        Ok(())
    }

    async fn get_document_version(&self, page_id: &str) -> Result<i64> {
        let docs = self.documents.read().unwrap();
        Ok(docs.get(page_id).map(|(_, version)| *version).unwrap_or(0))
    }

    async fn search_pages(&self, query: &str) -> Result<Vec<PageMetadata>> {
        let needle = query.to_lowercase();
        let index = self.search_index.read().unwrap();
        let pages = self.pages.read().unwrap();
        Ok(pages
            .values()
            .filter(|p| !p.is_deleted)
            .filter(|p| {
                p.title.to_lowercase().contains(&needle)
                    || index
                        .get(&p.id)
                        .is_some_and(|text| text.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect())
    }

    async fn update_search_index(&self, page_id: &str, text: &str) -> Result<()> {
        let mut index = self.search_index.write().unwrap();
        index.insert(page_id.to_string(), text.to_string());
        Ok(())
    }

    async fn get_last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.last_sync.read().unwrap())
    }

    async fn set_last_sync_time(&self, ts: DateTime<Utc>) -> Result<()> {
        *self.last_sync.write().unwrap() = Some(ts);
        Ok(())
    }
}
