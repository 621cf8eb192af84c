//! Wire format for cross-node challenge coordination
//!
//! Nodes talk through two broker facilities: short-lived metadata keys
//! (`challenge:session:<phrase>`) that advertise which node issued a
//! challenge, and per-node event channels (`challenge:events:<node_id>`)
//! carrying the handshake relay messages. Events from newer software
//! versions may carry types this node does not know; those decode as
//! [`EventKind::Unknown`] and are dropped with a log line rather than
//! killing the dispatcher.

use serde::{Deserialize, Serialize};

use crate::transport::{base64_bytes, base64_bytes_opt};

/// Prefix of per-node event channels
pub const EVENT_CHANNEL_PREFIX: &str = "challenge:events:";

/// Prefix of challenge metadata keys
pub const SESSION_KEY_PREFIX: &str = "challenge:session:";

/// Event channel name for a node
#[must_use]
pub fn event_channel(node_id: &str) -> String {
    format!("{EVENT_CHANNEL_PREFIX}{node_id}")
}

/// Metadata key for a challenge phrase
#[must_use]
pub fn session_key(challenge: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{challenge}")
}

/// Value stored under a challenge metadata key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Account the challenge belongs to
    pub username: String,

    /// Node the new machine is connected to
    pub node: String,
}

/// Discriminant of a bus event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A responder on another node accepted the challenge
    Accepted,

    /// New machine's key material, relayed to the responder's node
    ChallengerKey,

    /// Encrypted master key, relayed back to the new machine's node
    EncryptedMasterKey,

    /// Anything this version does not recognize
    #[serde(other)]
    Unknown,
}

/// One event on a node's challenge channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeEvent {
    /// Event discriminant
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Challenge phrase this event belongs to
    pub challenge: String,

    /// Node the event is addressed to
    #[serde(default)]
    pub target_node: String,

    /// Node that published the event
    pub source_node: String,

    /// Kind-specific payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of an [`EventKind::Accepted`] event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedPayload {
    /// Account the responder authenticated as
    pub username: String,
}

/// Payload of an [`EventKind::ChallengerKey`] event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengerKeyPayload {
    /// PEM-encoded signing key
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,

    /// Optional ML-KEM-768 encapsulation key PEM
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes_opt"
    )]
    pub encapsulation_key: Option<Vec<u8>>,
}

/// Payload of an [`EventKind::EncryptedMasterKey`] event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyPayload {
    /// Master key, encrypted for the new machine
    #[serde(with = "base64_bytes")]
    pub encrypted_master_key: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_and_key_names() {
        assert_eq!(event_channel("node-a"), "challenge:events:node-a");
        assert_eq!(
            session_key("apple-horse-anvil"),
            "challenge:session:apple-horse-anvil"
        );
    }

    #[test]
    fn event_round_trip() {
        let event = ChallengeEvent {
            kind: EventKind::Accepted,
            challenge: "apple-horse-anvil".to_string(),
            target_node: "node-a".to_string(),
            source_node: "node-b".to_string(),
            payload: serde_json::to_value(AcceptedPayload {
                username: "alice".to_string(),
            })
            .unwrap(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"accepted""#));

        let back: ChallengeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, EventKind::Accepted);
        let payload: AcceptedPayload = serde_json::from_value(back.payload).unwrap();
        assert_eq!(payload.username, "alice");
    }

    #[test]
    fn unknown_event_kind_decodes_instead_of_failing() {
        let json = r#"{"type":"key_rotation","challenge":"x-y-z","source_node":"node-c"}"#;
        let event: ChallengeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
    }

    #[test]
    fn challenger_key_payload_base64() {
        let payload = ChallengerKeyPayload {
            public_key: b"pem bytes".to_vec(),
            encapsulation_key: Some(vec![0u8; 4]),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: ChallengerKeyPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.public_key, payload.public_key);
        assert_eq!(back.encapsulation_key, payload.encapsulation_key);
    }
}
