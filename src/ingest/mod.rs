//! Ingestion dispatcher: applies network events to the store.
//!
//! One task consumes the session's event queue, so events for a chat are
//! applied in arrival order. Every write is an idempotent upsert; the store's
//! forward-only status merge makes duplicate and out-of-order events
//! harmless. A failed write is logged and the event dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::network::{IncomingMessage, NetworkEvent};
use crate::store::{ChatUpsert, Store, StoreError, UpsertOutcome};
use crate::types::{jid_user, ContentKind, Contact, DeliveryStatus, Direction, MediaReference, Message};

/// Running totals, readable while the dispatcher runs.
#[derive(Debug, Default)]
pub struct IngestStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
}

impl IngestStats {
    /// Events that changed the store.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Events that were already fully recorded.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Events dropped after a storage failure.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record(&self, changed: bool) {
        let counter = if changed {
            &self.applied
        } else {
            &self.duplicates
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Applies [`NetworkEvent`]s to a [`Store`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Store,
    stats: Arc<IngestStats>,
}

impl Dispatcher {
    /// Dispatcher writing into `store`.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Run [`run`](Self::run) on a background task.
    pub fn spawn(self, events: mpsc::Receiver<NetworkEvent>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(events).await })
    }

    /// Consume events until the queue closes.
    pub async fn run(&self, mut events: mpsc::Receiver<NetworkEvent>) {
        info!("ingestion started");
        while let Some(event) = events.recv().await {
            self.apply(event).await;
        }
        info!(
            applied = self.stats.applied(),
            duplicates = self.stats.duplicates(),
            failed = self.stats.failed(),
            "ingestion stopped"
        );
    }

    /// Apply one event. Storage failures are logged, counted and swallowed.
    pub async fn apply(&self, event: NetworkEvent) {
        let kind = event_label(&event);
        if let Err(e) = self.try_apply(event).await {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(event = kind, error = %e, "failed to ingest event, dropping it");
        }
    }

    async fn try_apply(&self, event: NetworkEvent) -> Result<(), StoreError> {
        match event {
            NetworkEvent::Message(incoming) => {
                let changed = self.ingest_message(incoming).await?;
                self.stats.record(changed);
            }
            NetworkEvent::HistorySync { messages } => {
                debug!(count = messages.len(), "applying history sync batch");
                for incoming in messages {
                    let id = incoming.message_id.clone();
                    match self.ingest_message(incoming).await {
                        Ok(changed) => self.stats.record(changed),
                        // One bad row must not sink the rest of the batch.
                        Err(e) => {
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            error!(message_id = %id, error = %e, "failed to ingest history message");
                        }
                    }
                }
            }
            NetworkEvent::Receipt {
                chat_jid,
                message_ids,
                status,
            } => {
                let mut changed = false;
                for id in &message_ids {
                    changed |= self.store.merge_status(&chat_jid, id, status).await?;
                }
                self.stats.record(changed);
            }
            NetworkEvent::Contact { jid, name } => {
                self.store.upsert_contact(Contact::new(jid, name)).await?;
                self.stats.record(true);
            }
            NetworkEvent::Group {
                jid,
                name,
                participants,
            } => {
                self.store
                    .upsert_chat(ChatUpsert {
                        jid,
                        name,
                        last_activity: None,
                        participants: Some(participants),
                    })
                    .await?;
                self.stats.record(true);
            }
            NetworkEvent::Connected => info!("network connected"),
            NetworkEvent::Disconnected { reason } => {
                info!(reason = ?reason, "network disconnected");
            }
            NetworkEvent::LoggedOut { reason } => warn!(reason = ?reason, "network logged out"),
            NetworkEvent::CredentialsRotated { .. } => {
                // Persisted by the session manager; nothing to store here.
                debug!("ignoring credential rotation event");
            }
        }
        Ok(())
    }

    async fn ingest_message(&self, incoming: IncomingMessage) -> Result<bool, StoreError> {
        let chat_name = incoming.chat_name.clone();
        if let Some(name) = incoming.sender_name.as_deref().filter(|n| !n.trim().is_empty()) {
            if !incoming.from_me {
                let contact = Contact::new(bare_jid(&incoming.sender), Some(name.to_owned()));
                self.store.upsert_contact(contact).await?;
            }
        }
        let message = normalize(incoming);
        let outcome = self.store.upsert_message(message, chat_name).await?;
        Ok(outcome != UpsertOutcome::Unchanged)
    }
}

/// Strip the device suffix from a JID (`123:4@s.whatsapp.net` → `123@s.whatsapp.net`).
fn bare_jid(jid: &str) -> String {
    match jid.split_once('@') {
        Some((_, server)) => format!("{}@{server}", jid_user(jid)),
        None => jid.to_owned(),
    }
}

/// Map a network message onto the stored shape.
fn normalize(incoming: IncomingMessage) -> Message {
    let direction = if incoming.from_me {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    // An inbound message reached us, so it was at least delivered.
    let status = incoming.status.unwrap_or(match direction {
        Direction::Outbound => DeliveryStatus::Sent,
        Direction::Inbound => DeliveryStatus::Delivered,
    });
    let kind = match (&incoming.media, incoming.kind) {
        (Some(media), ContentKind::Text) => ContentKind::from_mime(&media.mime_type),
        (_, kind) => kind,
    };
    let media = incoming.media.map(|m| MediaReference {
        locator: m.locator,
        mime_type: m.mime_type,
        file_name: m.file_name,
        size: m.size,
        local_path: None,
    });
    Message {
        chat_jid: incoming.chat_jid,
        id: incoming.message_id,
        sender: bare_jid(&incoming.sender),
        timestamp: incoming.timestamp,
        direction,
        kind,
        text: incoming.text.filter(|t| !t.is_empty()),
        media,
        status,
    }
}

fn event_label(event: &NetworkEvent) -> &'static str {
    match event {
        NetworkEvent::Message(_) => "message",
        NetworkEvent::Receipt { .. } => "receipt",
        NetworkEvent::Contact { .. } => "contact",
        NetworkEvent::Group { .. } => "group",
        NetworkEvent::HistorySync { .. } => "history_sync",
        NetworkEvent::CredentialsRotated { .. } => "credentials_rotated",
        NetworkEvent::Connected => "connected",
        NetworkEvent::Disconnected { .. } => "disconnected",
        NetworkEvent::LoggedOut { .. } => "logged_out",
    }
}
