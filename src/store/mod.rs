//! Storage layer: SQLite mirror of chats, contacts, messages and media metadata.
//!
//! [`Store`] is the sole gateway to `bridge.db`. Reads go straight to the
//! connection pool (concurrent, no cache). Every write goes through a
//! single-writer actor backed by an [`mpsc`] channel, one transaction per
//! logical write. The actor is the single point of truth for the
//! forward-only status merge, and the `(chat_jid, id)` primary key enforces
//! uniqueness underneath it for anything else touching the file.

pub mod queries;
pub mod writer;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::types::{Chat, Contact, DeliveryStatus, InvalidValue, MediaReference, Message};

pub use self::queries::{ChatQuery, ChatSort, ContextWindow, MessageContext, MessageQuery};
use self::writer::WriteOp;

/// Schema applied on open. Statements are idempotent.
pub const SCHEMA: &str = include_str!("../../migrations/001_schema.sql");

/// Writer channel capacity, bounded to provide backpressure.
const WRITER_CHANNEL_CAPACITY: usize = 1024;

/// Read pool size for file-backed databases.
const MAX_READ_CONNECTIONS: u32 = 4;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors and write outcomes
// ---------------------------------------------------------------------------

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Write channel is closed (writer actor stopped).
    #[error("store writer channel closed")]
    WriterClosed,

    /// A stored value could not be decoded.
    #[error(transparent)]
    InvalidValue(#[from] InvalidValue),
}

/// What [`Store::upsert_message`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The key was new; message (and media reference) inserted.
    Inserted,
    /// The key existed and the incoming status ranked higher.
    StatusAdvanced,
    /// The key existed and nothing changed.
    Unchanged,
}

/// Mutable chat fields for [`Store::upsert_chat`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatUpsert {
    /// Conversation JID.
    pub jid: String,
    /// New display name; `None` or empty keeps the stored one.
    pub name: Option<String>,
    /// Activity timestamp; the stored value only moves forward.
    pub last_activity: Option<DateTime<Utc>>,
    /// Group participants; `None` keeps the stored set.
    pub participants: Option<Vec<String>>,
}

impl ChatUpsert {
    /// Upsert carrying only the JID.
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            ..Self::default()
        }
    }
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of chats.
    pub chats: u64,
    /// Number of contacts.
    pub contacts: u64,
    /// Number of messages.
    pub messages: u64,
    /// Number of media references.
    pub media: u64,
    /// Media references with a local copy.
    pub media_downloaded: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the bridge database. Cheap to clone; clones share the writer.
#[derive(Clone)]
pub struct Store {
    /// Connection pool for reads (and the writer's transactions).
    db: SqlitePool,
    /// Channel to the single-writer actor.
    writer_tx: mpsc::Sender<WriteOp>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("pool_size", &self.db.size())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if missing) the database file and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_READ_CONNECTIONS)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        info!(path = %path.display(), "bridge database opened");
        Ok(Self::new(pool))
    }

    /// Open a private in-memory database with the schema applied.
    ///
    /// In-memory databases are per-connection, so the pool is pinned to a
    /// single connection that never expires.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Apply [`SCHEMA`] to a pool.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(pool).await?;
        Ok(())
    }

    /// Wrap an already-migrated pool and spawn the writer actor.
    pub fn new(db: SqlitePool) -> Self {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        tokio::spawn(writer::run_writer(db.clone(), writer_rx));
        Self { db, writer_tx }
    }

    /// Returns the underlying pool (for maintenance tooling and tests).
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Close the pool. Pending and later writes fail.
    pub async fn close(&self) {
        self.db.close().await;
        info!("bridge database closed");
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(writer::Reply<T>) -> WriteOp,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.writer_tx
            .send(build(reply))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        rx.await
            .map_err(|_| StoreError::WriterClosed)?
            .map_err(StoreError::from)
    }

    // -- writes -------------------------------------------------------------

    /// Create the chat if absent, else update its mutable fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the writer has stopped.
    pub async fn upsert_chat(&self, chat: ChatUpsert) -> Result<(), StoreError> {
        self.request(|reply| WriteOp::UpsertChat { chat, reply })
            .await
    }

    /// Create or rename a contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the writer has stopped.
    pub async fn upsert_contact(&self, contact: Contact) -> Result<(), StoreError> {
        self.request(|reply| WriteOp::UpsertContact { contact, reply })
            .await
    }

    /// Insert a message (with its media reference) if the key is new, else
    /// advance its status if the incoming one ranks higher.
    ///
    /// The owning chat is created or touched in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the writer has stopped.
    pub async fn upsert_message(
        &self,
        message: Message,
        chat_name: Option<String>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.request(|reply| WriteOp::UpsertMessage {
            message: Box::new(message),
            chat_name,
            reply,
        })
        .await
    }

    /// Advance a message's status to `status` if it ranks higher.
    ///
    /// Returns `true` if the row changed. For a message not stored yet the
    /// rank is held and applied when the message arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the writer has stopped.
    pub async fn merge_status(
        &self,
        chat_jid: &str,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool, StoreError> {
        let chat_jid = chat_jid.to_owned();
        let message_id = message_id.to_owned();
        self.request(|reply| WriteOp::MergeStatus {
            chat_jid,
            message_id,
            status,
            reply,
        })
        .await
    }

    /// Attach a media reference to an existing message.
    ///
    /// Returns `false` if the message already had one.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not exist or the write fails.
    pub async fn record_media_reference(
        &self,
        chat_jid: &str,
        message_id: &str,
        media: MediaReference,
    ) -> Result<bool, StoreError> {
        let chat_jid = chat_jid.to_owned();
        let message_id = message_id.to_owned();
        self.request(|reply| WriteOp::RecordMedia {
            chat_jid,
            message_id,
            media,
            reply,
        })
        .await
    }

    /// Set the local cache path of a media reference. Only the first call
    /// for a key takes effect; returns `true` if it did.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the writer has stopped.
    pub async fn set_media_local_path(
        &self,
        chat_jid: &str,
        message_id: &str,
        path: PathBuf,
    ) -> Result<bool, StoreError> {
        let chat_jid = chat_jid.to_owned();
        let message_id = message_id.to_owned();
        self.request(|reply| WriteOp::SetMediaLocalPath {
            chat_jid,
            message_id,
            path,
            reply,
        })
        .await
    }

    // -- reads --------------------------------------------------------------

    /// List chats, paged.
    pub async fn list_chats(&self, query: &ChatQuery) -> Result<Vec<Chat>, StoreError> {
        queries::list_chats(&self.db, query).await
    }

    /// Look up one chat.
    pub async fn get_chat(
        &self,
        jid: &str,
        include_last_message: bool,
    ) -> Result<Option<Chat>, StoreError> {
        queries::get_chat(&self.db, jid, include_last_message).await
    }

    /// Find the individual chat for a phone number.
    pub async fn get_direct_chat_by_contact(
        &self,
        phone: &str,
    ) -> Result<Option<Chat>, StoreError> {
        queries::direct_chat_by_phone(&self.db, phone).await
    }

    /// Chats the contact participates in (their direct chat and any group
    /// where they have sent a message).
    pub async fn get_contact_chats(
        &self,
        jid: &str,
        limit: u32,
        page: u32,
    ) -> Result<Vec<Chat>, StoreError> {
        queries::contact_chats(&self.db, jid, limit, page).await
    }

    /// Most recent message sent by or to the contact.
    pub async fn get_last_interaction(&self, jid: &str) -> Result<Option<Message>, StoreError> {
        queries::last_interaction(&self.db, jid).await
    }

    /// List messages matching the filters, newest first.
    pub async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        queries::list_messages(&self.db, query).await
    }

    /// Fetch one message.
    pub async fn get_message(
        &self,
        chat_jid: &str,
        message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        queries::get_message(&self.db, chat_jid, message_id).await
    }

    /// A message with up to `before`/`after` neighbours in its chat.
    pub async fn get_message_context(
        &self,
        chat_jid: &str,
        message_id: &str,
        before: u32,
        after: u32,
    ) -> Result<Option<MessageContext>, StoreError> {
        queries::message_context(&self.db, chat_jid, message_id, before, after).await
    }

    /// Contacts (and individual chats) whose name or number contains `query`.
    pub async fn search_contacts(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<Contact>, StoreError> {
        queries::search_contacts(&self.db, query, limit).await
    }

    /// Media reference for a message, if it has one.
    pub async fn media_reference(
        &self,
        chat_jid: &str,
        message_id: &str,
    ) -> Result<Option<MediaReference>, StoreError> {
        queries::media_reference(&self.db, chat_jid, message_id).await
    }

    /// Row counts.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        queries::stats(&self.db).await
    }
}
