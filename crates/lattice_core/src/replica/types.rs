//! Core types for the local replica: page metadata, link edges, and
//! ghost-link edges.
//!
//! Pages are soft-deleted only. A deleted page stays in the replica as a
//! tombstone so the deletion propagates to other replicas instead of being
//! resurrected by a stale push.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata for a single wiki page.
///
/// The `id` is an opaque stable identifier, unique for the lifetime of the
/// replica set and never reused. `content_preview` is a denormalized
/// plain-text snippet maintained by callers; the authoritative content lives
/// in the page's CRDT document state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub id: String,

    pub owner_id: String,

    /// Provenance pointer set when the page was cloned or migrated from
    /// another page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_page_id: Option<String>,

    pub title: String,

    #[serde(default)]
    pub content_preview: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Soft deletion tombstone. Tombstoned rows are retained indefinitely.
    #[serde(default)]
    pub is_deleted: bool,
}

impl PageMetadata {
    /// Create a new page owned by `owner_id` with a fresh id.
    pub fn new(owner_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            source_page_id: None,
            title: title.into(),
            content_preview: String::new(),
            thumbnail_url: None,
            source_url: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        }
    }

    /// Bump the modification timestamp. Last-write-wins reconciliation keys
    /// off `updated_at`, so every observable mutation must go through this.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Mark this page as deleted (soft delete).
    pub fn mark_deleted(&mut self) {
        self.is_deleted = true;
        self.touch();
    }
}

/// A directed edge between two pages.
///
/// No uniqueness beyond the (source, target) pair; re-adding an existing
/// edge is a no-op at the graph layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub source_id: String,
    pub target_id: String,
    pub created_at: DateTime<Utc>,
}

impl Link {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// A reference to a page title that does not yet exist as a real page.
///
/// Keyed uniquely per (text, source) so repeated mentions from the same
/// source collapse into one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostLink {
    pub link_text: String,
    pub source_page_id: String,
    pub created_at: DateTime<Utc>,

    /// Set when the ghost link was carried over from a page that used to
    /// resolve somewhere (e.g. the target was deleted out from under it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_target_page_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_note_id: Option<String>,
}

impl GhostLink {
    pub fn new(link_text: impl Into<String>, source_page_id: impl Into<String>) -> Self {
        Self {
            link_text: link_text.into(),
            source_page_id: source_page_id.into(),
            created_at: Utc::now(),
            original_target_page_id: None,
            original_note_id: None,
        }
    }
}
