//! Lattice core: offline-first wiki synchronization and collaborative page
//! editing.
//!
//! A wiki's pages form a mutable document graph replicated across a local
//! store, a remote authoritative service, and - for shared pages - a
//! realtime relay. This crate keeps those replicas consistent without
//! central locking:
//!
//! - [`replica`]: the local replica store (pages, links, ghost links,
//!   document blobs, search index, sync cursor)
//! - [`graph`]: link-graph maintenance and ghost-link promotion
//! - [`sync`]: the pull-then-push metadata sync engine with last-write-wins
//! - [`session`]: per-page collaborative document sessions in private or
//!   shared mode
//!
//! Metadata sync and document sync are separate channels with separate
//! cadences; they share consistency only through the replica store's
//! per-record atomicity.

use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod graph;
pub mod replica;
pub mod session;
pub mod sync;

pub use error::{LatticeError, Result};

/// Boxed future alias used at async seams that cannot use `async fn`
/// (debounced actions held behind `Fn` pointers).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
