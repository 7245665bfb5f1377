//! Collaborative document sessions.
//!
//! One live session per open page. Private mode merges the latest remote
//! document on start and saves debounced snapshots back to the document
//! endpoint; shared mode joins the page's realtime channel and lets the
//! relay persist. The CRDT document itself is an opaque mergeable blob -
//! the session logic is merge-then-observe-then-save regardless of where
//! the bytes came from.

mod debounce;
mod doc;
mod document_remote;
mod manager;
mod presence;
pub mod protocol;
mod relay;

pub use debounce::{DebouncedAction, Debouncer};
pub use doc::PageDoc;
pub use document_remote::{
    DocumentRemote, HttpDocumentRemote, InMemoryDocumentRemote, RemoteDocument,
};
pub use manager::{ConnectionStatus, DocSession, PrivateSessionOptions, SessionState};
pub use presence::{
    CursorPosition, PRESENCE_PALETTE, PresenceState, PresenceStatus, SelectionRange,
    color_for_user,
};
pub use protocol::{RelayFrame, channel_name};
pub use relay::{InProcessRelay, RelayConnection, RelayConnector, RelaySender};
