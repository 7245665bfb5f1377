//! Storage abstraction for the local replica.
//!
//! This module defines the [`ReplicaStore`] trait which abstracts over
//! storage backends (SQLite for durable replicas, in-memory for tests) for
//! one user's replica of the page graph.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{GhostLink, Link, PageMetadata};
use crate::error::Result;

/// Trait for local replica storage backends.
///
/// All operations are suspension points; implementations must be safe to
/// call from interleaved cooperative tasks (the sync engine and any number
/// of open document sessions share one store).
///
/// # Storage Model
///
/// The store holds five kinds of data:
/// 1. **Page metadata** with soft-delete tombstones
/// 2. **Link / ghost-link edge sets**, replaced atomically per source page
/// 3. **Document state**: one opaque CRDT blob + version per page
/// 4. **Search index**: denormalized plain text maintained by callers
/// 5. **Sync cursor**: the replica's high-water mark
///
/// # Failure model
///
/// A failed multi-step operation (e.g. replacing an edge set) must leave the
/// prior state intact — readers never observe a partially-applied edge set.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    // ==================== Pages ====================

    /// All pages, tombstones included.
    async fn get_all_pages(&self) -> Result<Vec<PageMetadata>>;

    async fn get_page(&self, id: &str) -> Result<Option<PageMetadata>>;

    async fn upsert_page(&self, meta: &PageMetadata) -> Result<()>;

    /// Soft-delete: sets `is_deleted = true` and bumps `updated_at` so the
    /// deletion wins last-write-wins reconciliation. Never erases the row.
    /// Deleting an unknown id is a no-op.
    async fn delete_page(&self, id: &str) -> Result<()>;

    // ==================== Links ====================

    /// Outgoing edges of `page_id`.
    async fn get_links(&self, page_id: &str) -> Result<Vec<Link>>;

    /// Incoming edges of `page_id`.
    async fn get_backlinks(&self, page_id: &str) -> Result<Vec<Link>>;

    /// The full edge snapshot, for push.
    async fn get_all_links(&self) -> Result<Vec<Link>>;

    /// Replace-by-source: `links` is the complete desired outgoing set for
    /// `source_page_id`. The prior set is deleted and the new one inserted
    /// as one atomic unit.
    async fn save_links(&self, source_page_id: &str, links: &[Link]) -> Result<()>;

    // ==================== Ghost links ====================

    async fn get_ghost_links(&self, source_page_id: &str) -> Result<Vec<GhostLink>>;

    /// Ghost links with this text across all source pages (promotion input).
    async fn get_ghost_links_by_text(&self, text: &str) -> Result<Vec<GhostLink>>;

    async fn get_all_ghost_links(&self) -> Result<Vec<GhostLink>>;

    /// Same replace-by-source contract as [`ReplicaStore::save_links`].
    async fn save_ghost_links(&self, source_page_id: &str, links: &[GhostLink]) -> Result<()>;

    // ==================== Document state ====================

    /// Returns `None` when the page has no content yet; that is a valid
    /// state, not an error.
    async fn get_document_state(&self, page_id: &str) -> Result<Option<Vec<u8>>>;

    async fn save_document_state(&self, page_id: &str, state: &[u8], version: i64) -> Result<()>;

    /// Returns 0 when the page has no document state.
    async fn get_document_version(&self, page_id: &str) -> Result<i64>;

    // ==================== Search ====================

    /// Non-deleted pages matching `query` against title or indexed text.
    async fn search_pages(&self, query: &str) -> Result<Vec<PageMetadata>>;

    /// Maintained by callers (typically after a document save); never
    /// derived automatically from the document state.
    async fn update_search_index(&self, page_id: &str, text: &str) -> Result<()>;

    // ==================== Sync cursor ====================

    async fn get_last_sync_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn set_last_sync_time(&self, ts: DateTime<Utc>) -> Result<()>;
}
