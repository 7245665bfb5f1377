//! Metadata/link-graph synchronization.
//!
//! Reconciles the local replica's pages, links, and ghost links against a
//! remote authoritative service via pull-then-push with last-write-wins
//! conflict resolution. Document bodies are **not** part of this channel;
//! they sync independently through the document session manager.
//!
//! # Architecture
//!
//! ```text
//! Remote authoritative service (HTTP or in-memory)
//!         ↑↓  SyncRemote
//!     SyncEngine (pull → apply → push → advance cursor)
//!         ↑↓  ReplicaStore
//!     Local replica (SQLite / memory)
//! ```

mod engine;
pub(crate) mod http;
mod remote;

pub use engine::{SyncEngine, SyncOutcome, SyncReport};
pub use http::HttpSyncRemote;
pub use remote::{InMemoryRemote, PullBatch, PushConflict, PushRequest, PushResponse, SyncRemote};

use serde::{Deserialize, Serialize};

/// Observable state of the sync engine.
///
/// `Synced` and `Error` are resting states; the in-progress guard, not the
/// status, decides whether a new pass may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn description(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "Waiting for next sync",
            SyncStatus::Syncing => "Syncing...",
            SyncStatus::Synced => "Up to date",
            SyncStatus::Error => "Sync failed",
        }
    }
}
