//! Domain types shared by storage, ingestion, commands and queries.
//!
//! Chats and contacts are addressed by WhatsApp JIDs (`<user>@s.whatsapp.net`
//! for people, `<id>@g.us` for groups). Messages are keyed by the pair
//! `(chat_jid, id)`.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Server suffix for individual user JIDs.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Server suffix for group JIDs.
pub const GROUP_SERVER: &str = "g.us";

/// Error returned when a stored or wire value does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field} value: {value:?}")]
pub struct InvalidValue {
    /// Which field contained the bad value.
    pub field: &'static str,
    /// The unexpected value.
    pub value: String,
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether a message was received or sent by the linked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from another participant.
    Inbound,
    /// Sent by the linked account (from this bridge or another device).
    Outbound,
}

impl Direction {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised direction.
    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(InvalidValue {
                field: "direction",
                value: other.to_owned(),
            }),
        }
    }
}

/// What a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text.
    #[default]
    Text,
    /// Photo or sticker.
    Image,
    /// Video clip.
    Video,
    /// Audio file or voice note.
    Audio,
    /// Any other file.
    Document,
    /// Protocol notice (group change, call log, ...).
    System,
}

impl ContentKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::System => "system",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised kind.
    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "document" => Ok(Self::Document),
            "system" => Ok(Self::System),
            other => Err(InvalidValue {
                field: "kind",
                value: other.to_owned(),
            }),
        }
    }

    /// Classify a MIME type into a media kind. Unknown types are documents.
    pub fn from_mime(mime: &str) -> Self {
        let major = mime.split('/').next().unwrap_or_default();
        match major {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Document,
        }
    }

    /// Returns `true` for kinds that carry a media attachment.
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document
        )
    }
}

/// Delivery status of a message, ordered `Sent < Delivered < Read`.
///
/// Stored as its rank so the forward-only merge is a plain `MAX()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted by the server.
    Sent,
    /// Delivered to the recipient device.
    Delivered,
    /// Read by the recipient.
    Read,
}

impl DeliveryStatus {
    /// Numeric rank stored in SQLite.
    pub fn rank(&self) -> i64 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
        }
    }

    /// Inverse of [`rank`](Self::rank).
    ///
    /// # Errors
    ///
    /// Returns an error if the rank is outside `0..=2`.
    pub fn from_rank(rank: i64) -> Result<Self, InvalidValue> {
        match rank {
            0 => Ok(Self::Sent),
            1 => Ok(Self::Delivered),
            2 => Ok(Self::Read),
            other => Err(InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }

    /// Returns the lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Metadata plus lazy-resolution pointer for media attached to a message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    /// Opaque locator and key material handed back to the network client.
    #[serde(skip_serializing, default)]
    pub locator: Vec<u8>,
    /// Declared MIME type.
    pub mime_type: String,
    /// Original file name, when the sender supplied one.
    pub file_name: Option<String>,
    /// Declared size in bytes.
    pub size: Option<u64>,
    /// Local cache path, set once the media has been downloaded.
    pub local_path: Option<PathBuf>,
}

impl std::fmt::Debug for MediaReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaReference")
            .field("locator", &format_args!("[{} bytes]", self.locator.len()))
            .field("mime_type", &self.mime_type)
            .field("file_name", &self.file_name)
            .field("size", &self.size)
            .field("local_path", &self.local_path)
            .finish()
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Conversation the message belongs to.
    pub chat_jid: String,
    /// Network-assigned message identifier (unique within the chat).
    pub id: String,
    /// JID of the author.
    pub sender: String,
    /// Server timestamp.
    pub timestamp: DateTime<Utc>,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Content kind.
    pub kind: ContentKind,
    /// Text body or caption.
    pub text: Option<String>,
    /// Attached media, if any.
    pub media: Option<MediaReference>,
    /// Delivery status (forward-only).
    pub status: DeliveryStatus,
}

/// A conversation, individual or group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Conversation JID.
    pub jid: String,
    /// Display name, if known.
    pub name: Option<String>,
    /// Whether this is a group conversation.
    pub is_group: bool,
    /// Timestamp of the most recent message.
    pub last_activity: Option<DateTime<Utc>>,
    /// Group participants (empty for individual chats or when unknown).
    pub participants: Vec<String>,
    /// Most recent message, when requested.
    pub last_message: Option<Message>,
}

/// A contact entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Contact JID.
    pub jid: String,
    /// Display or push name, if known.
    pub name: Option<String>,
    /// Phone number (user part of the JID).
    pub phone: String,
}

impl Contact {
    /// Build a contact from a JID and optional name.
    pub fn new(jid: impl Into<String>, name: Option<String>) -> Self {
        let jid = jid.into();
        let phone = jid_user(&jid).to_owned();
        Self { jid, name, phone }
    }
}

// ---------------------------------------------------------------------------
// JID helpers
// ---------------------------------------------------------------------------

/// Returns `true` if the JID addresses a group.
pub fn is_group_jid(jid: &str) -> bool {
    jid.rsplit_once('@')
        .is_some_and(|(_, server)| server == GROUP_SERVER)
}

/// Returns the user part of a JID (the phone number for individual chats).
pub fn jid_user(jid: &str) -> &str {
    let user = jid.split_once('@').map_or(jid, |(user, _)| user);
    // Device-qualified JIDs look like `123:4@s.whatsapp.net`.
    user.split_once(':').map_or(user, |(user, _)| user)
}

/// Normalise a recipient into a JID.
///
/// Accepts a full JID (returned trimmed) or a phone number with country code;
/// `+`, spaces, dashes and parentheses are stripped. Returns `None` when
/// nothing usable remains.
pub fn normalize_recipient(recipient: &str) -> Option<String> {
    let trimmed = recipient.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('@') {
        return Some(trimmed.to_owned());
    }
    let digits: String = trimmed
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-' | '(' | ')'))
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{digits}@{USER_SERVER}"))
}

/// Format a timestamp the way it is stored (RFC 3339, millisecond precision, `Z`).
///
/// A fixed format keeps lexicographic order equal to chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
///
/// # Errors
///
/// Returns an error if the value is not RFC 3339.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, InvalidValue> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| InvalidValue {
            field: "timestamp",
            value: s.to_owned(),
        })
}
