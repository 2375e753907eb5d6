//! Single-writer actor for serialized SQLite writes.
//!
//! All database mutations flow through this actor via an
//! [`mpsc`](tokio::sync::mpsc) channel. Each operation runs in its own
//! transaction and answers on a oneshot channel, so callers observe the
//! outcome while writes stay strictly ordered.

use std::path::PathBuf;

use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

use super::{ChatUpsert, UpsertOutcome};
use crate::types::{
    format_timestamp, is_group_jid, Contact, DeliveryStatus, MediaReference, Message,
};

/// Reply channel carried by every [`WriteOp`].
pub type Reply<T> = oneshot::Sender<Result<T, sqlx::Error>>;

/// Operations that can be sent to the write actor.
#[derive(Debug)]
pub enum WriteOp {
    /// Create or update a chat.
    UpsertChat {
        /// Fields to write.
        chat: ChatUpsert,
        /// Completion.
        reply: Reply<()>,
    },

    /// Create or rename a contact.
    UpsertContact {
        /// Contact to write.
        contact: Contact,
        /// Completion.
        reply: Reply<()>,
    },

    /// Insert a message or merge its status.
    UpsertMessage {
        /// Message to write.
        message: Box<Message>,
        /// Chat display name reported with the message.
        chat_name: Option<String>,
        /// Completion.
        reply: Reply<UpsertOutcome>,
    },

    /// Advance a message's status, or hold it until the message arrives.
    MergeStatus {
        /// Conversation JID.
        chat_jid: String,
        /// Message identifier.
        message_id: String,
        /// Incoming status.
        status: DeliveryStatus,
        /// `true` if the row changed.
        reply: Reply<bool>,
    },

    /// Attach a media reference to an existing message.
    RecordMedia {
        /// Conversation JID.
        chat_jid: String,
        /// Message identifier.
        message_id: String,
        /// Reference to store.
        media: MediaReference,
        /// `true` if inserted.
        reply: Reply<bool>,
    },

    /// Record where a media file was cached.
    SetMediaLocalPath {
        /// Conversation JID.
        chat_jid: String,
        /// Message identifier.
        message_id: String,
        /// Local cache path.
        path: PathBuf,
        /// `true` if the path was set by this call.
        reply: Reply<bool>,
    },
}

/// Run the single-writer actor loop.
///
/// Processes [`WriteOp`] messages until every sender half is dropped.
pub async fn run_writer(db: SqlitePool, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        handle_op(&db, op).await;
    }
    trace!("store writer actor stopped");
}

/// Log failures on the way out; the caller gets the error too.
fn finish<T>(reply: Reply<T>, op: &'static str, result: Result<T, sqlx::Error>) {
    if let Err(err) = &result {
        error!(op, error = %err, "store write failed");
    }
    // The caller may have given up waiting; the write stands regardless.
    let _ = reply.send(result);
}

async fn handle_op(db: &SqlitePool, op: WriteOp) {
    match op {
        WriteOp::UpsertChat { chat, reply } => {
            let result = async {
                let mut tx = db.begin().await?;
                upsert_chat(&mut tx, &chat).await?;
                tx.commit().await
            }
            .await;
            finish(reply, "upsert_chat", result);
        }
        WriteOp::UpsertContact { contact, reply } => {
            let result = async {
                let mut tx = db.begin().await?;
                upsert_contact(&mut tx, &contact).await?;
                tx.commit().await
            }
            .await;
            finish(reply, "upsert_contact", result);
        }
        WriteOp::UpsertMessage {
            message,
            chat_name,
            reply,
        } => {
            let result = async {
                let mut tx = db.begin().await?;
                let outcome = upsert_message(&mut tx, &message, chat_name.as_deref()).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(outcome)
            }
            .await;
            finish(reply, "upsert_message", result);
        }
        WriteOp::MergeStatus {
            chat_jid,
            message_id,
            status,
            reply,
        } => {
            let result = async {
                let mut tx = db.begin().await?;
                let changed = merge_status(&mut tx, &chat_jid, &message_id, status).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(changed)
            }
            .await;
            finish(reply, "merge_status", result);
        }
        WriteOp::RecordMedia {
            chat_jid,
            message_id,
            media,
            reply,
        } => {
            let result = async {
                let mut tx = db.begin().await?;
                let inserted = insert_media(&mut tx, &chat_jid, &message_id, &media).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(inserted)
            }
            .await;
            finish(reply, "record_media", result);
        }
        WriteOp::SetMediaLocalPath {
            chat_jid,
            message_id,
            path,
            reply,
        } => {
            let result = async {
                let mut tx = db.begin().await?;
                let set = set_local_path(&mut tx, &chat_jid, &message_id, &path).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(set)
            }
            .await;
            finish(reply, "set_media_local_path", result);
        }
    }
}

async fn upsert_chat(conn: &mut SqliteConnection, chat: &ChatUpsert) -> Result<(), sqlx::Error> {
    let participants = match &chat.participants {
        Some(list) => Some(serde_json::to_string(list).map_err(|e| sqlx::Error::Encode(e.into()))?),
        None => None,
    };
    let last_activity = chat.last_activity.as_ref().map(format_timestamp);
    sqlx::query(
        "INSERT INTO chats (jid, name, is_group, last_message_time, participants) \
         VALUES (?1, NULLIF(?2, ''), ?3, ?4, COALESCE(?5, '[]')) \
         ON CONFLICT(jid) DO UPDATE SET \
             name = COALESCE(NULLIF(excluded.name, ''), chats.name), \
             last_message_time = CASE \
                 WHEN chats.last_message_time IS NULL THEN excluded.last_message_time \
                 WHEN excluded.last_message_time IS NULL THEN chats.last_message_time \
                 ELSE MAX(chats.last_message_time, excluded.last_message_time) END, \
             participants = COALESCE(?5, chats.participants), \
             updated_at = datetime('now')",
    )
    .bind(&chat.jid)
    .bind(chat.name.as_deref())
    .bind(is_group_jid(&chat.jid))
    .bind(last_activity)
    .bind(participants)
    .execute(&mut *conn)
    .await?;
    trace!(jid = %chat.jid, "chat upserted");
    Ok(())
}

async fn upsert_contact(conn: &mut SqliteConnection, contact: &Contact) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO contacts (jid, name) VALUES (?1, NULLIF(?2, '')) \
         ON CONFLICT(jid) DO UPDATE SET \
             name = COALESCE(NULLIF(excluded.name, ''), contacts.name), \
             updated_at = datetime('now')",
    )
    .bind(&contact.jid)
    .bind(contact.name.as_deref())
    .execute(&mut *conn)
    .await?;
    trace!(jid = %contact.jid, "contact upserted");
    Ok(())
}

async fn upsert_message(
    conn: &mut SqliteConnection,
    message: &Message,
    chat_name: Option<&str>,
) -> Result<UpsertOutcome, sqlx::Error> {
    let chat = ChatUpsert {
        jid: message.chat_jid.clone(),
        name: chat_name.map(str::to_owned),
        last_activity: Some(message.timestamp),
        participants: None,
    };
    upsert_chat(conn, &chat).await?;

    // Receipts that beat the message here are folded in on insert.
    let inserted = sqlx::query(
        "INSERT INTO messages (chat_jid, id, sender, timestamp, direction, kind, content, status) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, MAX(?8, COALESCE( \
             (SELECT status FROM pending_status WHERE chat_jid = ?1 AND message_id = ?2), 0))) \
         ON CONFLICT(chat_jid, id) DO NOTHING",
    )
    .bind(&message.chat_jid)
    .bind(&message.id)
    .bind(&message.sender)
    .bind(format_timestamp(&message.timestamp))
    .bind(message.direction.as_str())
    .bind(message.kind.as_str())
    .bind(message.text.as_deref())
    .bind(message.status.rank())
    .execute(&mut *conn)
    .await?
    .rows_affected()
        > 0;

    if inserted {
        sqlx::query("DELETE FROM pending_status WHERE chat_jid = ?1 AND message_id = ?2")
            .bind(&message.chat_jid)
            .bind(&message.id)
            .execute(&mut *conn)
            .await?;
        if let Some(media) = &message.media {
            insert_media(conn, &message.chat_jid, &message.id, media).await?;
        }
        trace!(chat = %message.chat_jid, id = %message.id, "message inserted");
        return Ok(UpsertOutcome::Inserted);
    }

    if merge_status(conn, &message.chat_jid, &message.id, message.status).await? {
        Ok(UpsertOutcome::StatusAdvanced)
    } else {
        trace!(chat = %message.chat_jid, id = %message.id, "duplicate message ignored");
        Ok(UpsertOutcome::Unchanged)
    }
}

async fn merge_status(
    conn: &mut SqliteConnection,
    chat_jid: &str,
    message_id: &str,
    status: DeliveryStatus,
) -> Result<bool, sqlx::Error> {
    let changed = sqlx::query(
        "UPDATE messages SET status = ?3 \
         WHERE chat_jid = ?1 AND id = ?2 AND status < ?3",
    )
    .bind(chat_jid)
    .bind(message_id)
    .bind(status.rank())
    .execute(&mut *conn)
    .await?
    .rows_affected()
        > 0;
    if changed {
        trace!(chat = chat_jid, id = message_id, status = status.as_str(), "status advanced");
        return Ok(true);
    }

    let known: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE chat_jid = ?1 AND id = ?2)",
    )
    .bind(chat_jid)
    .bind(message_id)
    .fetch_one(&mut *conn)
    .await?;
    if !known {
        sqlx::query(
            "INSERT INTO pending_status (chat_jid, message_id, status) VALUES (?1, ?2, ?3) \
             ON CONFLICT(chat_jid, message_id) DO UPDATE SET \
                 status = MAX(pending_status.status, excluded.status), \
                 updated_at = datetime('now')",
        )
        .bind(chat_jid)
        .bind(message_id)
        .bind(status.rank())
        .execute(&mut *conn)
        .await?;
        trace!(chat = chat_jid, id = message_id, status = status.as_str(), "status held for unseen message");
    }
    Ok(false)
}

async fn insert_media(
    conn: &mut SqliteConnection,
    chat_jid: &str,
    message_id: &str,
    media: &MediaReference,
) -> Result<bool, sqlx::Error> {
    let size = media.size.and_then(|s| i64::try_from(s).ok());
    let local_path = media
        .local_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());
    let inserted = sqlx::query(
        "INSERT INTO media (chat_jid, message_id, locator, mime_type, file_name, size, local_path) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(chat_jid, message_id) DO NOTHING",
    )
    .bind(chat_jid)
    .bind(message_id)
    .bind(media.locator.as_slice())
    .bind(&media.mime_type)
    .bind(media.file_name.as_deref())
    .bind(size)
    .bind(local_path)
    .execute(&mut *conn)
    .await?
    .rows_affected()
        > 0;
    Ok(inserted)
}

async fn set_local_path(
    conn: &mut SqliteConnection,
    chat_jid: &str,
    message_id: &str,
    path: &std::path::Path,
) -> Result<bool, sqlx::Error> {
    let set = sqlx::query(
        "UPDATE media SET local_path = ?3 \
         WHERE chat_jid = ?1 AND message_id = ?2 AND local_path IS NULL",
    )
    .bind(chat_jid)
    .bind(message_id)
    .bind(path.to_string_lossy().into_owned())
    .execute(&mut *conn)
    .await?
    .rows_affected()
        > 0;
    trace!(chat = chat_jid, id = message_id, set, "media local path recorded");
    Ok(set)
}
