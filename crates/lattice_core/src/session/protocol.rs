//! Wire protocol for the realtime channel.
//!
//! Frames are JSON; document updates travel base64-encoded inside them.
//! The same frames flow client-to-relay and relay-to-client.

use serde::{Deserialize, Serialize};

use super::presence::PresenceState;
use crate::error::{LatticeError, Result};

/// Channel name for a page's realtime document channel.
pub fn channel_name(page_id: &str) -> String {
    format!("page:{page_id}")
}

/// One frame on the realtime channel.
///
/// `Update` carries CRDT bytes; `Presence` is the ephemeral side-band;
/// `PeerJoined`/`PeerLeft` bound the online-users list. Receivers ignore
/// frames about themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    Update {
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },
    Presence {
        presence: PresenceState,
    },
    PeerJoined {
        user_id: String,
        user_name: String,
    },
    PeerLeft {
        user_id: String,
    },
}

impl RelayFrame {
    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| LatticeError::MalformedResponse(format!("frame encode: {e}")))
    }

    /// Decode from the JSON wire form.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| LatticeError::MalformedResponse(format!("frame decode: {e}")))
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_is_namespaced() {
        assert_eq!(channel_name("abc-123"), "page:abc-123");
    }

    #[test]
    fn test_update_frame_round_trip() {
        let frame = RelayFrame::Update {
            update: vec![0, 1, 2, 255],
        };
        let encoded = frame.encode().unwrap();
        assert!(encoded.contains("\"type\":\"update\""));
        assert_eq!(RelayFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_presence_frame_round_trip() {
        let frame = RelayFrame::Presence {
            presence: PresenceState::joining("alice", "Alice"),
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(RelayFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_garbage_decodes_to_malformed_response() {
        let err = RelayFrame::decode("not json").unwrap_err();
        assert!(matches!(err, LatticeError::MalformedResponse(_)));
    }
}
