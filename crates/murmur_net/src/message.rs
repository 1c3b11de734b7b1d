//! Peer protocol: envelope-based typed messaging over the mailbox link.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// A protocol message, one variant per frame type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Introduction sent first on every link.
    Hello {
        /// Port of the sender's mailbox; the host is taken from the link.
        mailbox_port: u16,
        name: String,
        headers: BTreeMap<String, String>,
        groups: Vec<String>,
    },
    /// Unicast payload.
    Whisper { payload: Vec<u8> },
    /// Payload for every member of a group.
    Shout { group: String, payload: Vec<u8> },
    Join { group: String },
    Leave { group: String },
    /// Liveness probe.
    Ping,
    /// Answer to [`Message::Ping`].
    PingOk,
    /// The sender changed its display name.
    Rename { name: String },
}

impl Message {
    /// Frame type name, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Whisper { .. } => "WHISPER",
            Self::Shout { .. } => "SHOUT",
            Self::Join { .. } => "JOIN",
            Self::Leave { .. } => "LEAVE",
            Self::Ping => "PING",
            Self::PingOk => "PING_OK",
            Self::Rename { .. } => "RENAME",
        }
    }
}

/// A framed message: sequence number and sender around a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonic per-link sequence number, starting at 1 with HELLO.
    pub sequence: u64,
    /// PeerId of the sender.
    pub sender: PeerId,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(sender: PeerId, sequence: u64, message: Message) -> Self {
        Self {
            sequence,
            sender,
            message,
        }
    }

    /// Serialize the envelope to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialize_roundtrip() {
        let mut headers = BTreeMap::new();
        headers.insert("X-ROLE".to_string(), "relay".to_string());
        let env = Envelope::new(
            PeerId::generate(),
            1,
            Message::Hello {
                mailbox_port: 49152,
                name: "alpha".to_string(),
                headers,
                groups: vec!["CHAT".to_string()],
            },
        );

        let json = env.to_json().unwrap();
        let deserialized = Envelope::from_json(&json).unwrap();
        assert_eq!(deserialized, env);
    }

    #[test]
    fn test_wire_shape_is_flat() {
        let env = Envelope::new(
            PeerId::from_bytes([1; 16]),
            7,
            Message::Shout {
                group: "CHAT".to_string(),
                payload: b"hi".to_vec(),
            },
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "SHOUT");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["group"], "CHAT");
        assert_eq!(value["payload"], serde_json::json!([104, 105]));
    }

    #[test]
    fn test_unit_variants_decode() {
        let sender = PeerId::generate();
        let json = format!(r#"{{"type":"PING_OK","sequence":3,"sender":"{}"}}"#, uuid_str(sender));
        let env = Envelope::from_json(&json).unwrap();
        assert_eq!(env.message, Message::PingOk);
        assert_eq!(env.message.kind(), "PING_OK");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let sender = PeerId::generate();
        let json = format!(r#"{{"type":"TELEPORT","sequence":3,"sender":"{}"}}"#, uuid_str(sender));
        assert!(Envelope::from_json(&json).is_err());
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(Envelope::from_json("not json").is_err());
        assert!(Envelope::from_json(r#"{"type":"JOIN","sequence":1}"#).is_err());
    }

    fn uuid_str(id: PeerId) -> String {
        serde_json::to_value(id).unwrap().as_str().unwrap().to_string()
    }
}
