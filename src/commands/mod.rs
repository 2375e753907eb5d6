//! Command API: outbound sends and media downloads for the agent layer.
//!
//! Every call is request/response: it returns once the network acknowledges
//! (or the deadline passes). Sends travel through the session's ordered send
//! queue and never touch the ingestion path.

pub mod job;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::media::{MediaError, MediaPipeline, TranscodeError};
use crate::media::files::{kind_for_path, mime_for_path};
use crate::network::{Ack, AuthError, NetworkError, OutboundPayload};
use crate::session::{SessionError, SessionManager};
use crate::store::{Store, StoreError};
use crate::types::{
    jid_user, normalize_recipient, ContentKind, DeliveryStatus, Direction, Message, USER_SERVER,
};

pub use self::job::{JobState, OutboundJob};

/// MIME type declared for voice notes.
pub const VOICE_NOTE_MIME: &str = "audio/ogg; codecs=opus";

/// Stand-in deadline when the configured timeout overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(31_536_000);

/// Errors surfaced to command callers.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The session's credential is no longer accepted.
    #[error("authentication failed: {0}")]
    Auth(AuthError),

    /// No live session; retry later.
    #[error("not connected")]
    NotConnected,

    /// The network rejected the send.
    #[error("send failed: {0}")]
    Send(#[source] NetworkError),

    /// Media could not be retrieved.
    #[error("fetch failed: {0}")]
    Fetch(#[source] NetworkError),

    /// Voice-note conversion needed but unavailable; send the file instead.
    #[error("transcoder unavailable; send the file as a plain attachment")]
    TranscoderUnavailable,

    /// Voice-note conversion failed.
    #[error(transparent)]
    Transcode(TranscodeError),

    /// Deadline exceeded; the send may still be delivered.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Storage failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Rejected argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Local file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SessionError> for CommandError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Network(e) => Self::Send(e),
            SessionError::Auth(e) => Self::Auth(e),
            SessionError::NotConnected | SessionError::EventsTaken | SessionError::Credential(_) => {
                Self::NotConnected
            }
        }
    }
}

impl From<MediaError> for CommandError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Fetch(e) => Self::Fetch(e),
            MediaError::TranscoderUnavailable => Self::TranscoderUnavailable,
            MediaError::Transcode(e) => Self::Transcode(e),
            MediaError::Storage(e) => Self::Storage(e),
            MediaError::Io(e) => Self::Io(e),
        }
    }
}

/// Outcome of an acknowledged send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// Transient job identifier (for correlating logs).
    pub job_id: Uuid,
    /// Recipient JID after normalisation.
    pub chat_jid: String,
    /// Network-assigned message identifier.
    pub message_id: String,
    /// Final job state.
    pub state: JobState,
    /// Server timestamp of the send.
    pub timestamp: DateTime<Utc>,
    /// What was sent.
    pub kind: ContentKind,
}

/// What to record locally once a send is acknowledged.
struct SentContent {
    kind: ContentKind,
    text: Option<String>,
}

/// The four agent-facing commands.
#[derive(Debug, Clone)]
pub struct CommandService {
    session: Arc<SessionManager>,
    media: Arc<MediaPipeline>,
    store: Store,
    timeout: Duration,
}

impl CommandService {
    /// Service with a default per-call deadline.
    pub fn new(
        session: Arc<SessionManager>,
        media: Arc<MediaPipeline>,
        store: Store,
        timeout: Duration,
    ) -> Self {
        Self {
            session,
            media,
            store,
            timeout,
        }
    }

    /// Copy of this service using `timeout` as the per-call deadline.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    /// Per-call deadline in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute deadline for a call starting now. Every stage of one call
    /// shares it.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.timeout)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// [`CommandError::InvalidInput`] for an unusable recipient or empty
    /// body, [`CommandError::NotConnected`] while disconnected,
    /// [`CommandError::Send`] if rejected, [`CommandError::Timeout`] past the
    /// deadline.
    pub async fn send_text(&self, chat: &str, body: &str) -> Result<SendReceipt, CommandError> {
        let to = resolve_recipient(chat)?;
        if body.trim().is_empty() {
            return Err(CommandError::InvalidInput("message body is empty".to_owned()));
        }
        let deadline = self.deadline();
        let job = OutboundJob::new(&to, "text");
        let payload = OutboundPayload::Text {
            body: body.to_owned(),
        };
        let content = SentContent {
            kind: ContentKind::Text,
            text: Some(body.to_owned()),
        };
        self.transmit(job, deadline, &to, payload, content).await
    }

    /// Send a file as an attachment.
    ///
    /// Without a declared kind, the kind is inferred from the extension.
    ///
    /// # Errors
    ///
    /// [`CommandError::InvalidInput`] for an unusable recipient, a missing
    /// file or a non-media kind; otherwise as for
    /// [`send_text`](Self::send_text).
    pub async fn send_file(
        &self,
        chat: &str,
        path: &Path,
        declared_kind: Option<ContentKind>,
    ) -> Result<SendReceipt, CommandError> {
        let deadline = self.deadline();
        let to = resolve_recipient(chat)?;
        ensure_file(path).await?;
        let kind = match declared_kind {
            Some(kind) if kind.is_media() => kind,
            Some(kind) => {
                return Err(CommandError::InvalidInput(format!(
                    "{} cannot carry a file",
                    kind.as_str()
                )));
            }
            None => kind_for_path(path),
        };
        let job = OutboundJob::new(&to, "file");
        let payload = OutboundPayload::Media {
            path: path.to_path_buf(),
            kind,
            mime_type: mime_for_path(path).to_owned(),
            file_name: display_name(path),
            voice_note: false,
        };
        let content = SentContent { kind, text: None };
        self.transmit(job, deadline, &to, payload, content).await
    }

    /// Send audio as a push-to-talk voice note, converting it when needed.
    ///
    /// # Errors
    ///
    /// [`CommandError::TranscoderUnavailable`] when the input is not Ogg/Opus
    /// and no transcoder is configured (nothing is sent; fall back to
    /// [`send_file`](Self::send_file)); otherwise as for
    /// [`send_file`](Self::send_file).
    pub async fn send_voice_note(&self, chat: &str, path: &Path) -> Result<SendReceipt, CommandError> {
        let deadline = self.deadline();
        let to = resolve_recipient(chat)?;
        ensure_file(path).await?;
        let mut job = OutboundJob::new(&to, "voice_note");
        job.advance(JobState::Transcoding);

        let prepared = match timeout_at(deadline, self.media.prepare_voice_note(path)).await {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                job.fail(&e);
                return Err(e.into());
            }
            Err(_) => {
                job.fail(&"transcoding deadline exceeded");
                return Err(CommandError::Timeout(self.timeout));
            }
        };

        let payload = OutboundPayload::Media {
            path: prepared.path.clone(),
            kind: ContentKind::Audio,
            mime_type: VOICE_NOTE_MIME.to_owned(),
            file_name: display_name(&prepared.path),
            voice_note: true,
        };
        let content = SentContent {
            kind: ContentKind::Audio,
            text: None,
        };
        let result = self.transmit(job, deadline, &to, payload, content).await;

        // On timeout the network may still be reading the file.
        if prepared.converted && !matches!(result, Err(CommandError::Timeout(_))) {
            if let Err(e) = tokio::fs::remove_file(&prepared.path).await {
                debug!(path = %prepared.path.display(), error = %e, "failed to remove converted voice note");
            }
        }
        result
    }

    /// Local path of a message's media, downloading it if needed.
    ///
    /// Returns `Ok(None)` when the message has no media.
    ///
    /// # Errors
    ///
    /// [`CommandError::Fetch`] if the network cannot supply the bytes,
    /// [`CommandError::Timeout`] past the deadline, or a storage / I/O error.
    pub async fn download_media(
        &self,
        chat: &str,
        message_id: &str,
    ) -> Result<Option<PathBuf>, CommandError> {
        if chat.trim().is_empty() || message_id.trim().is_empty() {
            return Err(CommandError::InvalidInput(
                "chat and message id are required".to_owned(),
            ));
        }
        match timeout_at(self.deadline(), self.media.fetch(chat.trim(), message_id.trim())).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(chat, message_id, "media download timed out");
                Err(CommandError::Timeout(self.timeout))
            }
        }
    }

    async fn transmit(
        &self,
        mut job: OutboundJob,
        deadline: Instant,
        to: &str,
        payload: OutboundPayload,
        content: SentContent,
    ) -> Result<SendReceipt, CommandError> {
        job.advance(JobState::Sending);
        let ack = match timeout_at(deadline, self.session.send(to, payload)).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                job.fail(&e);
                return Err(e.into());
            }
            Err(_) => {
                job.fail(&"send deadline exceeded");
                return Err(CommandError::Timeout(self.timeout));
            }
        };
        job.advance(JobState::Acknowledged);
        info!(job = %job.id(), chat = to, message_id = %ack.message_id, "send acknowledged");

        self.record_sent(to, &ack, &content).await;
        Ok(SendReceipt {
            job_id: job.id(),
            chat_jid: to.to_owned(),
            message_id: ack.message_id,
            state: job.state(),
            timestamp: ack.timestamp,
            kind: content.kind,
        })
    }

    /// Mirror an acknowledged send into the store. The send already
    /// happened, so a failure here is only logged.
    async fn record_sent(&self, to: &str, ack: &Ack, content: &SentContent) {
        let sender = self
            .session
            .device_jid()
            .await
            .map(|jid| format!("{}@{USER_SERVER}", jid_user(&jid)))
            .unwrap_or_default();
        let message = Message {
            chat_jid: to.to_owned(),
            id: ack.message_id.clone(),
            sender,
            timestamp: ack.timestamp,
            direction: Direction::Outbound,
            kind: content.kind,
            text: content.text.clone(),
            media: None,
            status: DeliveryStatus::Sent,
        };
        if let Err(e) = self.store.upsert_message(message, None).await {
            warn!(chat = to, message_id = %ack.message_id, error = %e, "failed to record sent message");
        }
    }
}

fn resolve_recipient(chat: &str) -> Result<String, CommandError> {
    normalize_recipient(chat)
        .ok_or_else(|| CommandError::InvalidInput(format!("invalid recipient: {chat:?}")))
}

async fn ensure_file(path: &Path) -> Result<(), CommandError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(CommandError::InvalidInput(format!(
            "not a regular file: {}",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CommandError::InvalidInput(
            format!("file not found: {}", path.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_owned())
}
