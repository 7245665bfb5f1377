//! The remote authoritative service seam and its wire shapes.
//!
//! [`SyncRemote`] is implemented by [`super::HttpSyncRemote`] for real
//! deployments and by [`InMemoryRemote`] for tests and local development.
//! The in-memory remote carries the full authoritative semantics - per-page
//! last-write-wins on `updated_at` with conflict reporting - so engine
//! behavior can be exercised without a server.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::replica::{GhostLink, Link, PageMetadata};

/// Response of a pull: everything changed since the cursor (or everything,
/// for a full pull), plus the server clock reading for cursor advancement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullBatch {
    pub pages: Vec<PageMetadata>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub ghost_links: Vec<GhostLink>,
    pub server_time: DateTime<Utc>,
}

/// Body of a push: the entire current local snapshot, not a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub pages: Vec<PageMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ghost_links: Vec<GhostLink>,
}

/// A rejected page push: the server copy was newer than the pushed one.
/// Informational - the engine never auto-resolves; a later pull brings the
/// winning version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConflict {
    pub id: String,
    pub server_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub server_time: DateTime<Utc>,
    #[serde(default)]
    pub conflicts: Vec<PushConflict>,
}

/// The remote authoritative service for page metadata and link edges.
#[async_trait]
pub trait SyncRemote: Send + Sync {
    /// Pull records changed since `since`; `None` requests a full pull.
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<PullBatch>;

    /// Push the full local snapshot. The remote applies last-write-wins per
    /// page and reports rejected pages as conflicts.
    async fn push(&self, request: PushRequest) -> Result<PushResponse>;
}

#[derive(Debug, Default)]
struct RemoteState {
    pages: HashMap<String, PageMetadata>,
    links: HashMap<String, Vec<Link>>,
    ghost_links: HashMap<String, Vec<GhostLink>>,
}

/// In-memory authoritative service with last-write-wins semantics.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read of the authoritative copy of a page (test inspection).
    pub fn get_page(&self, id: &str) -> Option<PageMetadata> {
        let state = self.state.lock().unwrap();
        state.pages.get(id).cloned()
    }

    pub fn page_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.pages.len()
    }

    /// Seed the authoritative store directly, bypassing LWW (test setup).
    pub fn seed_page(&self, page: PageMetadata) {
        let mut state = self.state.lock().unwrap();
        state.pages.insert(page.id.clone(), page);
    }
}

#[async_trait]
impl SyncRemote for InMemoryRemote {
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<PullBatch> {
        let state = self.state.lock().unwrap();

        let pages: Vec<PageMetadata> = state
            .pages
            .values()
            .filter(|p| since.is_none_or(|cursor| p.updated_at > cursor))
            .cloned()
            .collect();

        // Edge sets travel with their source page: a pull carries the full
        // outgoing sets of every returned page so the replica can apply them
        // as replace-by-source units.
        let mut links = Vec::new();
        let mut ghost_links = Vec::new();
        for page in &pages {
            if let Some(set) = state.links.get(&page.id) {
                links.extend(set.iter().cloned());
            }
            if let Some(set) = state.ghost_links.get(&page.id) {
                ghost_links.extend(set.iter().cloned());
            }
        }

        Ok(PullBatch {
            pages,
            links,
            ghost_links,
            server_time: Utc::now(),
        })
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        let mut state = self.state.lock().unwrap();
        let mut conflicts = Vec::new();
        let mut rejected_sources: Vec<String> = Vec::new();

        for page in request.pages {
            match state.pages.get(&page.id) {
                Some(existing) if existing.updated_at > page.updated_at => {
                    conflicts.push(PushConflict {
                        id: page.id.clone(),
                        server_updated_at: existing.updated_at,
                    });
                    // A losing page keeps its authoritative edge sets too.
                    rejected_sources.push(page.id);
                }
                _ => {
                    state.pages.insert(page.id.clone(), page);
                }
            }
        }

        let mut links_by_source: HashMap<String, Vec<Link>> = HashMap::new();
        for link in request.links {
            links_by_source
                .entry(link.source_id.clone())
                .or_default()
                .push(link);
        }
        for (source, set) in links_by_source {
            if !rejected_sources.contains(&source) {
                state.links.insert(source, set);
            }
        }

        let mut ghosts_by_source: HashMap<String, Vec<GhostLink>> = HashMap::new();
        for ghost in request.ghost_links {
            ghosts_by_source
                .entry(ghost.source_page_id.clone())
                .or_default()
                .push(ghost);
        }
        for (source, set) in ghosts_by_source {
            if !rejected_sources.contains(&source) {
                state.ghost_links.insert(source, set);
            }
        }

        Ok(PushResponse {
            server_time: Utc::now(),
            conflicts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn push_of(pages: Vec<PageMetadata>) -> PushRequest {
        PushRequest {
            pages,
            links: Vec::new(),
            ghost_links: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_lww_newer_push_wins() {
        let remote = InMemoryRemote::new();
        let mut page = PageMetadata::new("u", "v1");
        remote.push(push_of(vec![page.clone()])).await.unwrap();

        page.title = "v2".into();
        page.updated_at = page.updated_at + Duration::milliseconds(10);
        let resp = remote.push(push_of(vec![page.clone()])).await.unwrap();

        assert!(resp.conflicts.is_empty());
        assert_eq!(remote.get_page(&page.id).unwrap().title, "v2");
    }

    #[tokio::test]
    async fn test_lww_stale_push_reports_conflict() {
        let remote = InMemoryRemote::new();
        let page = PageMetadata::new("u", "newer");
        remote.push(push_of(vec![page.clone()])).await.unwrap();

        let mut stale = page.clone();
        stale.title = "older".into();
        stale.updated_at = page.updated_at - Duration::milliseconds(50);
        let resp = remote.push(push_of(vec![stale])).await.unwrap();

        assert_eq!(resp.conflicts.len(), 1);
        assert_eq!(resp.conflicts[0].id, page.id);
        assert_eq!(resp.conflicts[0].server_updated_at, page.updated_at);
        // The server retains the t2 version.
        assert_eq!(remote.get_page(&page.id).unwrap().title, "newer");
    }

    #[tokio::test]
    async fn test_pull_since_filters_unchanged() {
        let remote = InMemoryRemote::new();
        let page = PageMetadata::new("u", "only");
        remote.push(push_of(vec![page.clone()])).await.unwrap();

        let full = remote.pull(None).await.unwrap();
        assert_eq!(full.pages.len(), 1);

        let later = page.updated_at + Duration::seconds(1);
        let incremental = remote.pull(Some(later)).await.unwrap();
        assert!(incremental.pages.is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_push_keeps_server_edge_sets() {
        let remote = InMemoryRemote::new();
        let page = PageMetadata::new("u", "page");
        remote
            .push(PushRequest {
                pages: vec![page.clone()],
                links: vec![Link::new(&page.id, "authoritative")],
                ghost_links: Vec::new(),
            })
            .await
            .unwrap();

        let mut stale = page.clone();
        stale.updated_at = page.updated_at - Duration::seconds(1);
        remote
            .push(PushRequest {
                pages: vec![stale],
                links: vec![Link::new(&page.id, "stale")],
                ghost_links: Vec::new(),
            })
            .await
            .unwrap();

        let batch = remote.pull(None).await.unwrap();
        assert_eq!(batch.links.len(), 1);
        assert_eq!(batch.links[0].target_id, "authoritative");
    }
}
