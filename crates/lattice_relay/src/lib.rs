//! Lattice realtime relay.
//!
//! Server-side collaborator for shared pages: authorizes connections with
//! bearer tokens, multiplexes edits between simultaneous editors of one
//! page, and persists the merged document state. Metadata sync is a
//! separate service; this process only handles live document channels.

pub mod auth;
pub mod config;
pub mod room;
pub mod ws;

pub use auth::{AuthUser, TokenStore};
pub use config::Config;
pub use room::{PageRoom, RoomRegistry};
pub use ws::{AppState, channel_handler};
