//! Ephemeral presence: who is editing, where their cursor is.
//!
//! Presence is never persisted. It exists only in relay room memory and in
//! each session's online-users list, and is garbage-collected on
//! disconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed palette for collaborator colors. A user id hashes to a palette
/// index, so the same user renders the same color across sessions and
/// devices.
pub const PRESENCE_PALETTE: [&str; 10] = [
    "#f94144", "#f3722c", "#f8961e", "#f9c74f", "#90be6d", "#43aa8b", "#4d908e", "#577590",
    "#277da1", "#9b5de5",
];

/// Deterministic color for a user id.
///
/// FNV-1a rather than the std hasher: the mapping must be identical across
/// platforms, processes, and releases.
pub fn color_for_user(user_id: &str) -> &'static str {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in user_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    PRESENCE_PALETTE[(hash % PRESENCE_PALETTE.len() as u64) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Away,
}

/// Caret position in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub anchor: u32,
    pub head: u32,
}

/// Selected range in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub from: u32,
    pub to: u32,
}

/// One collaborator's ephemeral state, broadcast over the channel's
/// side-band on every local cursor/selection change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub last_activity: DateTime<Utc>,
}

impl PresenceState {
    /// Fresh presence for a user joining a session, color derived from the
    /// id.
    pub fn joining(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let user_color = color_for_user(&user_id).to_string();
        Self {
            user_id,
            user_name: user_name.into(),
            user_color,
            status: PresenceStatus::Active,
            cursor: None,
            selection: None,
            last_activity: Utc::now(),
        }
    }

    /// Updated copy with a new cursor/selection and refreshed activity.
    pub fn at(
        &self,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
    ) -> Self {
        Self {
            cursor,
            selection,
            status: PresenceStatus::Active,
            last_activity: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_is_deterministic() {
        assert_eq!(color_for_user("alice"), color_for_user("alice"));
    }

    #[test]
    fn test_color_comes_from_palette() {
        for user in ["alice", "bob", "碧", ""] {
            assert!(PRESENCE_PALETTE.contains(&color_for_user(user)));
        }
    }

    #[test]
    fn test_colors_spread_across_palette() {
        // Not a uniformity proof, just a guard against a constant mapping.
        let colors: std::collections::HashSet<_> = (0..50)
            .map(|i| color_for_user(&format!("user-{i}")))
            .collect();
        assert!(colors.len() > 3);
    }

    #[test]
    fn test_presence_round_trips_through_json() {
        let mut presence = PresenceState::joining("alice", "Alice");
        presence.cursor = Some(CursorPosition { anchor: 3, head: 7 });
        presence.selection = Some(SelectionRange { from: 3, to: 7 });

        let json = serde_json::to_string(&presence).unwrap();
        let back: PresenceState = serde_json::from_str(&json).unwrap();
        assert_eq!(presence, back);
    }

    #[test]
    fn test_presence_wire_keys_are_camel_case() {
        let presence = PresenceState::joining("alice", "Alice");
        let json = serde_json::to_string(&presence).unwrap();
        assert!(json.contains("\"userId\""));
        assert!(json.contains("\"userColor\""));
        assert!(json.contains("\"lastActivity\""));
        // An empty cursor is an explicit null, not an omitted key.
        assert!(json.contains("\"cursor\":null"));
    }

    #[test]
    fn test_at_refreshes_activity() {
        let presence = PresenceState::joining("alice", "Alice");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let moved = presence.at(Some(CursorPosition { anchor: 1, head: 1 }), None);
        assert!(moved.last_activity > presence.last_activity);
        assert_eq!(moved.user_color, presence.user_color);
    }
}
