//! Typed JSON message exchange over an upgraded bidirectional connection
//!
//! Every message on the wire is an envelope `{"type": ..., "data": ...}`.
//! Reads match on the declared type; an `error` envelope arriving in place of
//! an expected message surfaces as [`Error::Protocol`]. The [`TypedStream`]
//! trait abstracts the underlying connection so the handshake handlers can be
//! driven by a WebSocket in production and by an in-process pipe in tests.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Wire envelope wrapping every typed message
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag
    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific payload
    pub data: serde_json::Value,
}

/// A message that can travel inside an [`Envelope`]
pub trait Message: Serialize + DeserializeOwned {
    /// Wire type tag for this message
    const KIND: &'static str;
}

/// Bidirectional text-frame transport
#[async_trait]
pub trait TypedStream: Send {
    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on connection failure.
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Receive one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on connection failure or close.
    async fn recv_text(&mut self) -> Result<String>;
}

/// Read the next message, requiring it to be of type `M`.
///
/// # Errors
///
/// Returns [`Error::Transport`] on connection failure, [`Error::Protocol`]
/// if the peer sent an error envelope or a message of an unexpected type,
/// and [`Error::MalformedInput`] if the payload does not decode.
pub async fn read_message<S: TypedStream + ?Sized, M: Message>(stream: &mut S) -> Result<M> {
    let text = stream.recv_text().await?;
    let envelope: Envelope = serde_json::from_str(&text)
        .map_err(|e| Error::MalformedInput(format!("invalid envelope: {e}")))?;

    if envelope.kind == ErrorReply::KIND {
        let reply: ErrorReply = serde_json::from_value(envelope.data)
            .unwrap_or_else(|_| ErrorReply { error: "unknown error".to_string() });
        return Err(Error::Protocol(format!("peer reported error: {}", reply.error)));
    }

    if envelope.kind != M::KIND {
        return Err(Error::Protocol(format!(
            "unexpected message type {:?}, expected {:?}",
            envelope.kind,
            M::KIND
        )));
    }

    serde_json::from_value(envelope.data)
        .map_err(|e| Error::MalformedInput(format!("invalid {} payload: {e}", M::KIND)))
}

/// Write a typed message wrapped in an envelope.
///
/// # Errors
///
/// Returns [`Error::Transport`] on connection failure.
pub async fn write_message<S: TypedStream + ?Sized, M: Message>(
    stream: &mut S,
    message: &M,
) -> Result<()> {
    let envelope = Envelope {
        kind: M::KIND.to_string(),
        data: serde_json::to_value(message)?,
    };
    stream.send_text(serde_json::to_string(&envelope)?).await
}

/// Write an error envelope in place of the next expected message.
///
/// # Errors
///
/// Returns [`Error::Transport`] on connection failure.
pub async fn write_error<S: TypedStream + ?Sized>(stream: &mut S, error: &str) -> Result<()> {
    write_message(
        stream,
        &ErrorReply {
            error: error.to_string(),
        },
    )
    .await
}

// === Wire messages ===

/// First message from a new machine: who it is and what it is called
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub username: String,
    pub machine_name: String,
}

impl Message for MachineInfo {
    const KIND: &'static str = "machine_info";
}

/// Free-form server notice (challenge phrase, progress, completion)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNotice {
    pub message: String,
}

impl Message for ServerNotice {
    const KIND: &'static str = "message";
}

/// Error envelope, sent in place of the next expected success message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

impl Message for ErrorReply {
    const KIND: &'static str = "error";
}

/// Responder's typed-in challenge phrase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSubmission {
    pub challenge: String,
}

impl Message for ChallengeSubmission {
    const KIND: &'static str = "challenge";
}

/// New machine's public key material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUpload {
    /// PEM-encoded signing key
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,

    /// Optional ML-KEM-768 encapsulation key PEM (hybrid devices only)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes_opt"
    )]
    pub encapsulation_key: Option<Vec<u8>>,
}

impl Message for KeyUpload {
    const KIND: &'static str = "public_key";
}

/// Master key, encrypted by the responder for the new machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMasterKey {
    #[serde(with = "base64_bytes")]
    pub encrypted_master_key: Vec<u8>,
}

impl Message for EncryptedMasterKey {
    const KIND: &'static str = "encrypted_master_key";
}

// === Transports ===

/// [`TypedStream`] over an axum WebSocket
pub struct WsStream {
    socket: WebSocket,
}

impl WsStream {
    /// Wrap an upgraded WebSocket
    #[must_use]
    pub const fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl TypedStream for WsStream {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.socket
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| Error::Transport(format!("websocket send: {e}")))
    }

    async fn recv_text(&mut self) -> Result<String> {
        loop {
            let frame = self
                .socket
                .recv()
                .await
                .ok_or_else(|| Error::Transport("connection closed".to_string()))?
                .map_err(|e| Error::Transport(format!("websocket recv: {e}")))?;

            match frame {
                WsMessage::Text(text) => return Ok(text.to_string()),
                WsMessage::Close(_) => {
                    return Err(Error::Transport("connection closed by peer".to_string()));
                }
                // Pings are answered by axum; anything else is skipped
                _ => {}
            }
        }
    }
}

/// In-process [`TypedStream`] backed by a pair of channels.
///
/// Used by the handshake integration tests to drive both handler sides
/// without a socket.
pub struct ChannelStream {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

impl ChannelStream {
    /// Create a connected pair of streams
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(16);
        let (b_tx, b_rx) = mpsc::channel(16);
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait]
impl TypedStream for ChannelStream {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.tx
            .send(text)
            .await
            .map_err(|_| Error::Transport("peer stream dropped".to_string()))
    }

    async fn recv_text(&mut self) -> Result<String> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Transport("peer stream dropped".to_string()))
    }
}

/// Serde helpers encoding byte fields as standard base64 strings
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for optional base64 byte fields
pub mod base64_bytes_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| STANDARD.decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}
