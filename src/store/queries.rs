//! Read side of the store.
//!
//! Plain SQL against the pool; no caching. Filters are assembled with
//! [`QueryBuilder`] so every user-supplied value is bound, never spliced.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::{StoreError, StoreStats};
use crate::types::{
    format_timestamp, normalize_recipient, parse_timestamp, Chat, ContentKind, Contact,
    DeliveryStatus, Direction, MediaReference, Message,
};

/// Default page size for listings.
pub const DEFAULT_LIMIT: u32 = 20;

/// Raw message row joined with its media reference.
///
/// Fields: `(chat_jid, id, sender, timestamp, direction, kind, content, status,
/// locator, mime_type, file_name, size, local_path)`.
type MessageRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<Vec<u8>>,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
);

/// Raw chat row. Fields: `(jid, name, is_group, last_message_time, participants)`.
type ChatRow = (String, Option<String>, i64, Option<String>, String);

const MESSAGE_SELECT: &str = "SELECT m.chat_jid, m.id, m.sender, m.timestamp, m.direction, \
            m.kind, m.content, m.status, \
            md.locator, md.mime_type, md.file_name, md.size, md.local_path \
     FROM messages m \
     LEFT JOIN media md ON md.chat_jid = m.chat_jid AND md.message_id = m.id";

const CHAT_SELECT: &str =
    "SELECT c.jid, c.name, c.is_group, c.last_message_time, c.participants FROM chats c";

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

/// Chat listing order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSort {
    /// Most recently active first.
    #[default]
    LastActive,
    /// Alphabetical by display name (JID when unnamed).
    Name,
}

/// Parameters for [`list_chats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatQuery {
    /// Case-insensitive substring of the name or JID.
    pub query: Option<String>,
    /// Page size.
    pub limit: u32,
    /// Zero-based page number.
    pub page: u32,
    /// Attach each chat's most recent message.
    pub include_last_message: bool,
    /// Ordering.
    pub sort: ChatSort,
}

impl Default for ChatQuery {
    fn default() -> Self {
        Self {
            query: None,
            limit: DEFAULT_LIMIT,
            page: 0,
            include_last_message: true,
            sort: ChatSort::default(),
        }
    }
}

/// Neighbourhood to include around each matching message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    /// Messages before the match.
    pub before: u32,
    /// Messages after the match.
    pub after: u32,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self {
            before: 1,
            after: 1,
        }
    }
}

/// Parameters for [`list_messages`]. Every filter is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    /// Only messages strictly after this instant.
    pub after: Option<DateTime<Utc>>,
    /// Only messages strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Author JID, or a bare phone number matching any of its JIDs.
    pub sender: Option<String>,
    /// Restrict to one conversation.
    pub chat_jid: Option<String>,
    /// Case-insensitive substring of the text body.
    pub text: Option<String>,
    /// Restrict to one content kind.
    pub kind: Option<ContentKind>,
    /// Page size.
    pub limit: u32,
    /// Zero-based page number.
    pub page: u32,
    /// Expand each match with its neighbours.
    pub context: Option<ContextWindow>,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            sender: None,
            chat_jid: None,
            text: None,
            kind: None,
            limit: DEFAULT_LIMIT,
            page: 0,
            context: None,
        }
    }
}

impl MessageQuery {
    /// Messages of one chat, default paging.
    pub fn in_chat(chat_jid: impl Into<String>) -> Self {
        Self {
            chat_jid: Some(chat_jid.into()),
            ..Self::default()
        }
    }
}

/// A message and its neighbours, both sides in chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageContext {
    /// The target message.
    pub message: Message,
    /// Earlier messages, oldest first.
    pub before: Vec<Message>,
    /// Later messages, oldest first.
    pub after: Vec<Message>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lowercased `LIKE` pattern matching `needle` anywhere; use with `ESCAPE '\'`.
fn like_pattern(needle: &str) -> String {
    format!("%{}%", escape_like(&needle.to_lowercase()))
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Non-empty trimmed filter text.
fn filter_text(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn page_bounds(limit: u32, page: u32) -> (i64, i64) {
    let limit = i64::from(limit);
    (limit, limit.saturating_mul(i64::from(page)))
}

fn row_to_message(row: MessageRow) -> Result<Message, StoreError> {
    let (
        chat_jid,
        id,
        sender,
        timestamp,
        direction,
        kind,
        text,
        status,
        locator,
        mime_type,
        file_name,
        size,
        local_path,
    ) = row;
    let media = match (locator, mime_type) {
        (Some(locator), Some(mime_type)) => Some(MediaReference {
            locator,
            mime_type,
            file_name,
            size: size.and_then(|s| u64::try_from(s).ok()),
            local_path: local_path.map(Into::into),
        }),
        _ => None,
    };
    Ok(Message {
        chat_jid,
        id,
        sender,
        timestamp: parse_timestamp(&timestamp)?,
        direction: Direction::parse(&direction)?,
        kind: ContentKind::parse(&kind)?,
        text,
        media,
        status: DeliveryStatus::from_rank(status)?,
    })
}

fn row_to_chat(row: ChatRow) -> Result<Chat, StoreError> {
    let (jid, name, is_group, last_message_time, participants) = row;
    let last_activity = last_message_time
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;
    // A corrupt participant list is not worth failing the whole listing.
    let participants = serde_json::from_str(&participants).unwrap_or_default();
    Ok(Chat {
        jid,
        name,
        is_group: is_group != 0,
        last_activity,
        participants,
        last_message: None,
    })
}

async fn attach_last_message(db: &SqlitePool, chat: &mut Chat) -> Result<(), StoreError> {
    chat.last_message = last_message(db, &chat.jid).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Fetch one message by key.
pub async fn get_message(
    db: &SqlitePool,
    chat_jid: &str,
    message_id: &str,
) -> Result<Option<Message>, StoreError> {
    let sql = format!("{MESSAGE_SELECT} WHERE m.chat_jid = ?1 AND m.id = ?2");
    let row: Option<MessageRow> = sqlx::query_as(&sql)
        .bind(chat_jid)
        .bind(message_id)
        .fetch_optional(db)
        .await?;
    row.map(row_to_message).transpose()
}

/// Most recent message of a chat.
pub async fn last_message(db: &SqlitePool, chat_jid: &str) -> Result<Option<Message>, StoreError> {
    let sql = format!(
        "{MESSAGE_SELECT} WHERE m.chat_jid = ?1 ORDER BY m.timestamp DESC, m.id DESC LIMIT 1"
    );
    let row: Option<MessageRow> = sqlx::query_as(&sql)
        .bind(chat_jid)
        .fetch_optional(db)
        .await?;
    row.map(row_to_message).transpose()
}

/// List messages matching every supplied filter, newest first.
///
/// With a context window, each match is followed in the result by its
/// neighbours (earlier ones first); a message appears at most once.
pub async fn list_messages(
    db: &SqlitePool,
    query: &MessageQuery,
) -> Result<Vec<Message>, StoreError> {
    let mut qb = QueryBuilder::<Sqlite>::new(MESSAGE_SELECT);
    qb.push(" WHERE 1 = 1");
    if let Some(after) = &query.after {
        qb.push(" AND m.timestamp > ")
            .push_bind(format_timestamp(after));
    }
    if let Some(before) = &query.before {
        qb.push(" AND m.timestamp < ")
            .push_bind(format_timestamp(before));
    }
    if let Some(sender) = filter_text(query.sender.as_ref()) {
        if sender.contains('@') {
            qb.push(" AND m.sender = ").push_bind(sender.to_owned());
        } else {
            qb.push(" AND m.sender LIKE ")
                .push_bind(format!("{}@%", escape_like(sender)))
                .push(" ESCAPE '\\'");
        }
    }
    if let Some(chat_jid) = filter_text(query.chat_jid.as_ref()) {
        qb.push(" AND m.chat_jid = ").push_bind(chat_jid.to_owned());
    }
    if let Some(text) = filter_text(query.text.as_ref()) {
        qb.push(" AND LOWER(m.content) LIKE ")
            .push_bind(like_pattern(text))
            .push(" ESCAPE '\\'");
    }
    if let Some(kind) = query.kind {
        qb.push(" AND m.kind = ").push_bind(kind.as_str());
    }
    let (limit, offset) = page_bounds(query.limit, query.page);
    qb.push(" ORDER BY m.timestamp DESC, m.id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows: Vec<MessageRow> = qb.build_query_as().fetch_all(db).await?;
    let matches = rows
        .into_iter()
        .map(row_to_message)
        .collect::<Result<Vec<_>, _>>()?;

    let Some(window) = query.context else {
        return Ok(matches);
    };

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out = Vec::with_capacity(matches.len());
    for hit in matches {
        let Some(ctx) = message_context(db, &hit.chat_jid, &hit.id, window.before, window.after)
            .await?
        else {
            continue;
        };
        for msg in ctx
            .before
            .into_iter()
            .chain(std::iter::once(ctx.message))
            .chain(ctx.after)
        {
            if seen.insert((msg.chat_jid.clone(), msg.id.clone())) {
                out.push(msg);
            }
        }
    }
    Ok(out)
}

/// A message plus up to `before`/`after` neighbours in the same chat,
/// ordered by `(timestamp, id)`.
pub async fn message_context(
    db: &SqlitePool,
    chat_jid: &str,
    message_id: &str,
    before: u32,
    after: u32,
) -> Result<Option<MessageContext>, StoreError> {
    let Some(message) = get_message(db, chat_jid, message_id).await? else {
        return Ok(None);
    };
    let ts = format_timestamp(&message.timestamp);

    let sql = format!(
        "{MESSAGE_SELECT} WHERE m.chat_jid = ?1 \
           AND (m.timestamp < ?2 OR (m.timestamp = ?2 AND m.id < ?3)) \
         ORDER BY m.timestamp DESC, m.id DESC LIMIT ?4"
    );
    let rows: Vec<MessageRow> = sqlx::query_as(&sql)
        .bind(chat_jid)
        .bind(&ts)
        .bind(message_id)
        .bind(i64::from(before))
        .fetch_all(db)
        .await?;
    let mut earlier = rows
        .into_iter()
        .map(row_to_message)
        .collect::<Result<Vec<_>, _>>()?;
    earlier.reverse();

    let sql = format!(
        "{MESSAGE_SELECT} WHERE m.chat_jid = ?1 \
           AND (m.timestamp > ?2 OR (m.timestamp = ?2 AND m.id > ?3)) \
         ORDER BY m.timestamp ASC, m.id ASC LIMIT ?4"
    );
    let rows: Vec<MessageRow> = sqlx::query_as(&sql)
        .bind(chat_jid)
        .bind(&ts)
        .bind(message_id)
        .bind(i64::from(after))
        .fetch_all(db)
        .await?;
    let later = rows
        .into_iter()
        .map(row_to_message)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(MessageContext {
        message,
        before: earlier,
        after: later,
    }))
}

/// Most recent message the contact sent, or that was exchanged in their
/// direct chat.
pub async fn last_interaction(db: &SqlitePool, jid: &str) -> Result<Option<Message>, StoreError> {
    let sql = format!(
        "{MESSAGE_SELECT} WHERE m.sender = ?1 OR m.chat_jid = ?1 \
         ORDER BY m.timestamp DESC, m.id DESC LIMIT 1"
    );
    let row: Option<MessageRow> = sqlx::query_as(&sql)
        .bind(jid)
        .fetch_optional(db)
        .await?;
    row.map(row_to_message).transpose()
}

/// Media reference of a message, if any.
pub async fn media_reference(
    db: &SqlitePool,
    chat_jid: &str,
    message_id: &str,
) -> Result<Option<MediaReference>, StoreError> {
    let row: Option<(Vec<u8>, String, Option<String>, Option<i64>, Option<String>)> =
        sqlx::query_as(
            "SELECT locator, mime_type, file_name, size, local_path \
             FROM media WHERE chat_jid = ?1 AND message_id = ?2",
        )
        .bind(chat_jid)
        .bind(message_id)
        .fetch_optional(db)
        .await?;
    Ok(row.map(
        |(locator, mime_type, file_name, size, local_path)| MediaReference {
            locator,
            mime_type,
            file_name,
            size: size.and_then(|s| u64::try_from(s).ok()),
            local_path: local_path.map(Into::into),
        },
    ))
}

// ---------------------------------------------------------------------------
// Chats and contacts
// ---------------------------------------------------------------------------

/// List chats, optionally filtered by name or JID.
pub async fn list_chats(db: &SqlitePool, query: &ChatQuery) -> Result<Vec<Chat>, StoreError> {
    let mut qb = QueryBuilder::<Sqlite>::new(CHAT_SELECT);
    if let Some(needle) = filter_text(query.query.as_ref()) {
        let pattern = like_pattern(needle);
        qb.push(" WHERE (LOWER(COALESCE(c.name, '')) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(c.jid) LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
    match query.sort {
        ChatSort::LastActive => {
            qb.push(" ORDER BY c.last_message_time IS NULL, c.last_message_time DESC, c.jid")
        }
        ChatSort::Name => qb.push(" ORDER BY COALESCE(c.name, c.jid) COLLATE NOCASE, c.jid"),
    };
    let (limit, offset) = page_bounds(query.limit, query.page);
    qb.push(" LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows: Vec<ChatRow> = qb.build_query_as().fetch_all(db).await?;
    let mut chats = rows
        .into_iter()
        .map(row_to_chat)
        .collect::<Result<Vec<_>, _>>()?;
    if query.include_last_message {
        for chat in &mut chats {
            attach_last_message(db, chat).await?;
        }
    }
    Ok(chats)
}

/// Look up one chat by JID.
pub async fn get_chat(
    db: &SqlitePool,
    jid: &str,
    include_last_message: bool,
) -> Result<Option<Chat>, StoreError> {
    let sql = format!("{CHAT_SELECT} WHERE c.jid = ?1");
    let row: Option<ChatRow> = sqlx::query_as(&sql).bind(jid).fetch_optional(db).await?;
    let Some(mut chat) = row.map(row_to_chat).transpose()? else {
        return Ok(None);
    };
    if include_last_message {
        attach_last_message(db, &mut chat).await?;
    }
    Ok(Some(chat))
}

/// Individual chat for a phone number (or user JID).
pub async fn direct_chat_by_phone(
    db: &SqlitePool,
    phone: &str,
) -> Result<Option<Chat>, StoreError> {
    let Some(jid) = normalize_recipient(phone) else {
        return Ok(None);
    };
    match get_chat(db, &jid, true).await? {
        Some(chat) if !chat.is_group => Ok(Some(chat)),
        _ => Ok(None),
    }
}

/// Chats involving a contact: their direct chat plus every chat where they
/// authored a message. Most recently active first.
pub async fn contact_chats(
    db: &SqlitePool,
    jid: &str,
    limit: u32,
    page: u32,
) -> Result<Vec<Chat>, StoreError> {
    let (limit, offset) = page_bounds(limit, page);
    let sql = format!(
        "{CHAT_SELECT} WHERE c.jid = ?1 \
            OR c.jid IN (SELECT DISTINCT chat_jid FROM messages WHERE sender = ?1) \
         ORDER BY c.last_message_time IS NULL, c.last_message_time DESC, c.jid \
         LIMIT ?2 OFFSET ?3"
    );
    let rows: Vec<ChatRow> = sqlx::query_as(&sql)
        .bind(jid)
        .bind(limit)
        .bind(offset)
        .fetch_all(db)
        .await?;
    rows.into_iter().map(row_to_chat).collect()
}

/// Contacts and individual chats whose name or JID contains `query`.
pub async fn search_contacts(
    db: &SqlitePool,
    query: &str,
    limit: u32,
) -> Result<Vec<Contact>, StoreError> {
    let needle = query.trim();
    if needle.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT jid, MAX(name) FROM ( \
             SELECT jid, name FROM contacts \
             UNION ALL \
             SELECT jid, name FROM chats WHERE is_group = 0 \
         ) \
         WHERE LOWER(COALESCE(name, '')) LIKE ?1 ESCAPE '\\' OR LOWER(jid) LIKE ?1 ESCAPE '\\' \
         GROUP BY jid \
         ORDER BY COALESCE(MAX(name), jid) COLLATE NOCASE \
         LIMIT ?2",
    )
    .bind(like_pattern(needle))
    .bind(i64::from(limit))
    .fetch_all(db)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(jid, name)| Contact::new(jid, name))
        .collect())
}

/// Row counts for the `status` subcommand.
pub async fn stats(db: &SqlitePool) -> Result<StoreStats, StoreError> {
    let (chats, contacts, messages, media, downloaded): (i64, i64, i64, i64, i64) =
        sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM chats), \
                    (SELECT COUNT(*) FROM contacts), \
                    (SELECT COUNT(*) FROM messages), \
                    (SELECT COUNT(*) FROM media), \
                    (SELECT COUNT(*) FROM media WHERE local_path IS NOT NULL)",
        )
        .fetch_one(db)
        .await?;
    let count = |n: i64| u64::try_from(n).unwrap_or_default();
    Ok(StoreStats {
        chats: count(chats),
        contacts: count(contacts),
        messages: count(messages),
        media: count(media),
        media_downloaded: count(downloaded),
    })
}
