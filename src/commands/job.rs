//! Transient outbound job tracking.

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle of one send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created, nothing done yet.
    Pending,
    /// Converting audio for a voice note.
    Transcoding,
    /// Handed to the session, waiting for the network.
    Sending,
    /// The network acknowledged the send.
    Acknowledged,
    /// The send did not complete.
    Failed,
}

impl JobState {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Transcoding => "transcoding",
            Self::Sending => "sending",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions happen.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed)
    }
}

/// In-memory record of one send. Never persisted.
#[derive(Debug, Clone)]
pub struct OutboundJob {
    id: Uuid,
    chat_jid: String,
    kind: &'static str,
    state: JobState,
}

impl OutboundJob {
    /// New pending job for `chat_jid`.
    pub fn new(chat_jid: impl Into<String>, kind: &'static str) -> Self {
        let job = Self {
            id: Uuid::new_v4(),
            chat_jid: chat_jid.into(),
            kind,
            state: JobState::Pending,
        };
        debug!(job = %job.id, chat = %job.chat_jid, kind, "outbound job created");
        job
    }

    /// Job identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Target conversation.
    pub fn chat_jid(&self) -> &str {
        &self.chat_jid
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move to `next`. Final states are sticky.
    pub fn advance(&mut self, next: JobState) {
        if self.state.is_final() {
            warn!(
                job = %self.id,
                from = self.state.as_str(),
                to = next.as_str(),
                "ignoring transition out of final state"
            );
            return;
        }
        debug!(
            job = %self.id,
            kind = self.kind,
            from = self.state.as_str(),
            to = next.as_str(),
            "outbound job transition"
        );
        self.state = next;
    }

    /// Mark failed with a reason for the log.
    pub fn fail(&mut self, reason: &dyn std::fmt::Display) {
        warn!(job = %self.id, chat = %self.chat_jid, kind = self.kind, %reason, "outbound job failed");
        self.advance(JobState::Failed);
    }
}
