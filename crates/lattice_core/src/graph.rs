//! Link graph maintenance over the replica store.
//!
//! Manages the directed link graph between pages and the ghost-link set
//! (references to titles that do not exist as pages yet), including the
//! promotion of a ghost link into a real page once enough distinct sources
//! reference it.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::replica::{GhostLink, Link, PageMetadata, ReplicaStore};

/// How many distinct source pages must reference a ghost link before
/// promotion materializes a real page. A single unconfirmed mention never
/// auto-creates a page.
pub const PROMOTION_THRESHOLD: usize = 2;

/// Pure logic over the replica store for edge and ghost-link maintenance.
///
/// All mutations go through the store's replace-by-source contract, so a
/// reader never observes a partial edge set.
pub struct LinkGraph {
    store: Arc<dyn ReplicaStore>,
    /// Owner recorded on pages materialized by promotion.
    owner_id: String,
}

impl LinkGraph {
    pub fn new(store: Arc<dyn ReplicaStore>, owner_id: impl Into<String>) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
        }
    }

    /// Add a directed edge. Idempotent: re-adding an existing edge is a
    /// no-op and does not rewrite the stored set.
    pub async fn add_link(&self, source: &str, target: &str) -> Result<()> {
        let mut links = self.store.get_links(source).await?;
        if links.iter().any(|l| l.target_id == target) {
            return Ok(());
        }
        links.push(Link::new(source, target));
        self.store.save_links(source, &links).await
    }

    /// Remove a directed edge. Removing an absent edge is a no-op.
    pub async fn remove_link(&self, source: &str, target: &str) -> Result<()> {
        let links = self.store.get_links(source).await?;
        let remaining: Vec<Link> = links
            .iter()
            .filter(|l| l.target_id != target)
            .cloned()
            .collect();
        if remaining.len() == links.len() {
            return Ok(());
        }
        self.store.save_links(source, &remaining).await
    }

    /// Track an unresolved reference from `source` to the title `text`.
    /// Repeated mentions from the same source collapse to one entry.
    pub async fn add_ghost_link(&self, text: &str, source: &str) -> Result<()> {
        let mut ghosts = self.store.get_ghost_links(source).await?;
        if ghosts.iter().any(|g| g.link_text == text) {
            return Ok(());
        }
        ghosts.push(GhostLink::new(text, source));
        self.store.save_ghost_links(source, &ghosts).await
    }

    pub async fn remove_ghost_link(&self, text: &str, source: &str) -> Result<()> {
        let ghosts = self.store.get_ghost_links(source).await?;
        let remaining: Vec<GhostLink> = ghosts
            .iter()
            .filter(|g| g.link_text != text)
            .cloned()
            .collect();
        if remaining.len() == ghosts.len() {
            return Ok(());
        }
        self.store.save_ghost_links(source, &remaining).await
    }

    /// Promote a ghost link into a real page.
    ///
    /// Gathers the distinct source pages currently holding a ghost link with
    /// this text. With [`PROMOTION_THRESHOLD`] or more sources: creates one
    /// new page titled `text`, adds a real link from every source to it, and
    /// removes those ghost entries. With fewer, this is a no-op and returns
    /// `None`.
    ///
    /// Promotion is caller-invoked; `add_ghost_link` never triggers it.
    pub async fn promote_ghost_link(&self, text: &str) -> Result<Option<PageMetadata>> {
        let ghosts = self.store.get_ghost_links_by_text(text).await?;
        let sources: BTreeSet<String> = ghosts.into_iter().map(|g| g.source_page_id).collect();
        if sources.len() < PROMOTION_THRESHOLD {
            return Ok(None);
        }

        let page = PageMetadata::new(&self.owner_id, text);
        self.store.upsert_page(&page).await?;
        log::info!(
            "promoted ghost link '{}' to page {} ({} sources)",
            text,
            page.id,
            sources.len()
        );

        for source in &sources {
            self.add_link(source, &page.id).await?;
            self.remove_ghost_link(text, source).await?;
        }

        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::MemoryStore;

    fn graph() -> (Arc<MemoryStore>, LinkGraph) {
        let store = Arc::new(MemoryStore::new());
        let graph = LinkGraph::new(store.clone(), "user-1");
        (store, graph)
    }

    #[tokio::test]
    async fn test_add_link_idempotent() {
        let (store, graph) = graph();

        graph.add_link("a", "b").await.unwrap();
        graph.add_link("a", "b").await.unwrap();

        assert_eq!(store.get_links("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_link() {
        let (store, graph) = graph();
        graph.add_link("a", "b").await.unwrap();
        graph.add_link("a", "c").await.unwrap();

        graph.remove_link("a", "b").await.unwrap();
        graph.remove_link("a", "missing").await.unwrap();

        let links = store.get_links("a").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_id, "c");
    }

    #[tokio::test]
    async fn test_ghost_link_collapses_per_source() {
        let (store, graph) = graph();

        graph.add_ghost_link("Target", "a").await.unwrap();
        graph.add_ghost_link("Target", "a").await.unwrap();

        assert_eq!(store.get_ghost_links("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_promotion_below_threshold_is_noop() {
        let (store, graph) = graph();
        graph.add_ghost_link("Target", "a").await.unwrap();

        let promoted = graph.promote_ghost_link("Target").await.unwrap();

        assert!(promoted.is_none());
        assert!(store.get_all_pages().await.unwrap().is_empty());
        // The ghost entry survives for a later promotion attempt.
        assert_eq!(store.get_ghost_links("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_promotion_at_threshold_creates_page_and_links() {
        let (store, graph) = graph();
        graph.add_ghost_link("Target", "a").await.unwrap();
        graph.add_ghost_link("Target", "b").await.unwrap();

        let page = graph.promote_ghost_link("Target").await.unwrap().unwrap();

        assert_eq!(page.title, "Target");
        assert_eq!(page.owner_id, "user-1");

        // Every source gained a real link to the new page.
        for source in ["a", "b"] {
            let links = store.get_links(source).await.unwrap();
            assert_eq!(links.len(), 1);
            assert_eq!(links[0].target_id, page.id);
        }

        // The ghost entries are gone.
        assert!(store.get_ghost_links_by_text("Target").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_counts_distinct_sources_only() {
        let (store, graph) = graph();
        // Two mentions from the same source still count as one.
        graph.add_ghost_link("Target", "a").await.unwrap();
        graph.add_ghost_link("Target", "a").await.unwrap();

        assert!(graph.promote_ghost_link("Target").await.unwrap().is_none());
        assert!(store.get_all_pages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_leaves_other_ghost_texts_alone() {
        let (store, graph) = graph();
        graph.add_ghost_link("Target", "a").await.unwrap();
        graph.add_ghost_link("Other", "a").await.unwrap();
        graph.add_ghost_link("Target", "b").await.unwrap();

        graph.promote_ghost_link("Target").await.unwrap().unwrap();

        let remaining = store.get_ghost_links("a").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].link_text, "Other");
    }
}
