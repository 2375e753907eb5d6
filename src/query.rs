//! Query surface: read-only access to the mirrored history for the agent
//! layer. No method here can mutate the store.

use crate::store::{ChatQuery, MessageContext, MessageQuery, Store, StoreError};
use crate::types::{Chat, Contact, Message};

/// Read-only view over a [`Store`].
#[derive(Debug, Clone)]
pub struct QueryService {
    store: Store,
}

impl QueryService {
    /// View over `store`.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Chats, most recently active first unless another order is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn list_chats(&self, query: &ChatQuery) -> Result<Vec<Chat>, StoreError> {
        self.store.list_chats(query).await
    }

    /// One chat with its last message; `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_chat(&self, jid: &str) -> Result<Option<Chat>, StoreError> {
        self.store.get_chat(jid, true).await
    }

    /// The individual chat with a phone number.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_direct_chat_by_contact(&self, phone: &str) -> Result<Option<Chat>, StoreError> {
        self.store.get_direct_chat_by_contact(phone).await
    }

    /// Chats a contact takes part in.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_contact_chats(
        &self,
        jid: &str,
        limit: u32,
        page: u32,
    ) -> Result<Vec<Chat>, StoreError> {
        self.store.get_contact_chats(jid, limit, page).await
    }

    /// Most recent message exchanged with a contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_last_interaction(&self, jid: &str) -> Result<Option<Message>, StoreError> {
        self.store.get_last_interaction(jid).await
    }

    /// Messages matching the filters, newest first. An empty chat yields an
    /// empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        self.store.list_messages(query).await
    }

    /// A message with its neighbours; `None` if the message is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn get_message_context(
        &self,
        chat_jid: &str,
        message_id: &str,
        before: u32,
        after: u32,
    ) -> Result<Option<MessageContext>, StoreError> {
        self.store
            .get_message_context(chat_jid, message_id, before, after)
            .await
    }

    /// Contacts whose name or number contains `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn search_contacts(&self, query: &str, limit: u32) -> Result<Vec<Contact>, StoreError> {
        self.store.search_contacts(query, limit).await
    }
}
