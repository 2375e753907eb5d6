//! Network client capability: the boundary to the multi-device protocol.
//!
//! The bridge never speaks the wire protocol itself. Everything goes through
//! the [`NetworkClient`] trait; [`http::HttpNetworkClient`] implements it
//! against a local sidecar that owns pairing, encryption and transport.

pub mod http;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::types::{ContentKind, DeliveryStatus};

// ---------------------------------------------------------------------------
// Credentials and handles
// ---------------------------------------------------------------------------

/// Opaque authentication material that lets a device resume without pairing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential(#[serde(with = "b64")] Vec<u8>);

impl Credential {
    /// Wrap raw credential bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw credential bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential").field(&"[REDACTED]").finish()
    }
}

/// Handle to one live protocol session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Sidecar-assigned session identifier.
    pub id: String,
    /// JID of the linked device, once known.
    pub device_jid: Option<String>,
}

/// Successful outcome of [`NetworkClient::connect`].
#[derive(Debug, Clone)]
pub struct Connected {
    /// Handle for subsequent calls.
    pub handle: SessionHandle,
    /// Fresh credential issued by pairing or refresh; persist it when present.
    pub credential: Option<Credential>,
}

/// Sink for pairing codes (QR payloads) the operator must scan.
pub type PairingSink = mpsc::UnboundedSender<String>;

/// Inbound event sequence for one connection. Ends when the connection drops.
pub type EventStream = Pin<Box<dyn Stream<Item = NetworkEvent> + Send>>;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Media attached to an incoming message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    /// Opaque locator and key material for lazy download.
    #[serde(with = "b64")]
    pub locator: Vec<u8>,
    /// Declared MIME type.
    pub mime_type: String,
    /// Original file name, if any.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Declared size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
}

/// A message as reported by the network (live or from history sync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Conversation JID.
    pub chat_jid: String,
    /// Conversation display name, if the network knows it.
    #[serde(default)]
    pub chat_name: Option<String>,
    /// Message identifier.
    pub message_id: String,
    /// Author JID.
    pub sender: String,
    /// Author push name, if present.
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Server timestamp.
    pub timestamp: DateTime<Utc>,
    /// Whether the linked account authored it.
    #[serde(default)]
    pub from_me: bool,
    /// Content kind; inferred from the attachment when left as text.
    #[serde(default)]
    pub kind: ContentKind,
    /// Text body or caption.
    #[serde(default)]
    pub text: Option<String>,
    /// Attached media.
    #[serde(default)]
    pub media: Option<MediaAttachment>,
    /// Status carried with the message, if any.
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
}

/// An event produced by the network client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    /// A new message (inbound, or sent by us from any device).
    Message(IncomingMessage),
    /// Delivery or read receipt for one or more messages.
    Receipt {
        /// Conversation JID.
        chat_jid: String,
        /// Affected message identifiers.
        message_ids: Vec<String>,
        /// Reported status.
        status: DeliveryStatus,
    },
    /// Contact name learned or changed.
    Contact {
        /// Contact JID.
        jid: String,
        /// Display name.
        #[serde(default)]
        name: Option<String>,
    },
    /// Group metadata learned or changed.
    Group {
        /// Group JID.
        jid: String,
        /// Subject line.
        #[serde(default)]
        name: Option<String>,
        /// Participant JIDs.
        #[serde(default)]
        participants: Vec<String>,
    },
    /// Batch of historical messages pushed after pairing.
    HistorySync {
        /// Messages in network order.
        messages: Vec<IncomingMessage>,
    },
    /// The protocol rotated the credential; persist it.
    CredentialsRotated {
        /// New credential.
        credential: Credential,
    },
    /// Connection established.
    Connected,
    /// Transport dropped.
    Disconnected {
        /// Human-readable reason, if available.
        #[serde(default)]
        reason: Option<String>,
    },
    /// The device was logged out remotely.
    LoggedOut {
        /// Human-readable reason, if available.
        #[serde(default)]
        reason: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// One outbound unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    /// Text message.
    Text {
        /// Message body.
        body: String,
    },
    /// File upload (image, video, audio, document or voice note).
    Media {
        /// Local file to upload.
        path: PathBuf,
        /// Kind the recipient should render it as.
        kind: ContentKind,
        /// MIME type to declare.
        mime_type: String,
        /// File name shown to the recipient.
        file_name: String,
        /// Send as a push-to-talk voice note.
        voice_note: bool,
    },
}

impl OutboundPayload {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Media {
                voice_note: true, ..
            } => "voice_note",
            Self::Media { .. } => "media",
        }
    }
}

/// Network acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ack {
    /// Identifier the network assigned to the message.
    pub message_id: String,
    /// Server timestamp of the send.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Authentication failures from [`NetworkClient::connect`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The stored credential was rejected; the device must pair again.
    #[error("credential rejected")]
    InvalidCredential,

    /// The account already has the maximum number of linked devices.
    #[error("device limit reached")]
    DeviceLimit,

    /// The session was revoked (logged out from the phone).
    #[error("session revoked: {0}")]
    Revoked(String),

    /// Pairing code expired before it was scanned.
    #[error("pairing expired")]
    PairingExpired,

    /// Transient transport failure; safe to retry.
    #[error("transport error: {0}")]
    Transport(String),
}

impl AuthError {
    /// Returns `true` for failures that retrying with the same credential cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DeviceLimit | Self::Revoked(_))
    }
}

/// Failures of established-session operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// HTTP request to the sidecar failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The session is gone; reconnect first.
    #[error("session closed")]
    SessionClosed,

    /// The network rejected the payload.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Media could not be retrieved (expired locator, missing blob).
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// The opaque multi-device protocol implementation.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Establish or resume a session.
    ///
    /// With no credential the client pairs, publishing codes to `pairing`
    /// until one is scanned.
    async fn connect(
        &self,
        credential: Option<&Credential>,
        pairing: &PairingSink,
    ) -> Result<Connected, AuthError>;

    /// Inbound events for the given session. The stream ends on disconnect.
    async fn events(&self, handle: &SessionHandle) -> Result<EventStream, NetworkError>;

    /// Transmit one unit and wait for the network's acknowledgement.
    async fn send(
        &self,
        handle: &SessionHandle,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<Ack, NetworkError>;

    /// Retrieve and decrypt media bytes.
    async fn fetch_media(&self, locator: &[u8]) -> Result<Vec<u8>, NetworkError>;
}

/// Base64 (standard alphabet) serde adapter for opaque blobs.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
