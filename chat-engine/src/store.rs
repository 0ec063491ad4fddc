//! Entity Store
//!
//! Canonical collections of contacts, chats and messages. The store enforces the identity
//! and referential invariants:
//!
//! - contact, chat and message ids are unique
//! - at most one chat per contact
//! - every message belongs to exactly one existing chat
//! - delivery states only move forward
//!
//! Every mutation updates the [`DerivationEngine`] in the same call, so summaries are never
//! observed out of date.

use crate::clock::Clock;
use crate::derive::{DerivationEngine, DerivationMismatch};
use crate::model::{
    new_chat_id, new_message_id, Chat, ChatId, ChatSummary, Contact, ContactId, DeliveryState,
    Direction, Message, MessageId, Profile,
};
use crate::{ChatError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Owner of all conversation state
pub struct EntityStore {
    contacts: HashMap<ContactId, Contact>,
    /// Contact ids in first-insertion order
    contact_order: Vec<ContactId>,
    chats: HashMap<ChatId, Chat>,
    /// Chat ids in creation order
    chat_order: Vec<ChatId>,
    chat_by_contact: HashMap<ContactId, ChatId>,
    message_chat: HashMap<MessageId, ChatId>,
    derivations: DerivationEngine,
    profile: Profile,
    max_message_length: usize,
    clock: Arc<dyn Clock>,
}

impl EntityStore {
    /// Create an empty store
    pub fn new(max_message_length: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            contacts: HashMap::new(),
            contact_order: Vec::new(),
            chats: HashMap::new(),
            chat_order: Vec::new(),
            chat_by_contact: HashMap::new(),
            message_chat: HashMap::new(),
            derivations: DerivationEngine::new(),
            profile: Profile::default(),
            max_message_length,
            clock,
        }
    }

    /// Current time according to the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ----- contacts -----

    /// Insert or replace a contact by id
    pub fn upsert_contact(&mut self, contact: Contact) -> Result<()> {
        if contact.id.trim().is_empty() {
            return Err(ChatError::validation("contact id is empty"));
        }
        if contact.name.trim().is_empty() {
            return Err(ChatError::validation("contact name is empty"));
        }

        if !self.contacts.contains_key(&contact.id) {
            self.contact_order.push(contact.id.clone());
        }
        debug!(contact_id = %contact.id, "Upserted contact");
        self.contacts.insert(contact.id.clone(), contact);
        Ok(())
    }

    /// Update a contact's presence
    pub fn set_presence(
        &mut self,
        contact_id: &str,
        online: bool,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let contact = self
            .contacts
            .get_mut(contact_id)
            .ok_or_else(|| ChatError::ContactNotFound(contact_id.to_string()))?;
        contact.online = online;
        contact.last_seen_at = last_seen_at;
        Ok(())
    }

    pub fn contact(&self, contact_id: &str) -> Option<&Contact> {
        self.contacts.get(contact_id)
    }

    /// Contacts in the order they were first added
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contact_order
            .iter()
            .filter_map(|id| self.contacts.get(id))
    }

    // ----- profile -----

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn set_profile(&mut self, profile: Profile) -> Result<()> {
        if profile.id.trim().is_empty() || profile.name.trim().is_empty() {
            return Err(ChatError::validation("profile id and name must not be empty"));
        }
        self.profile = profile;
        Ok(())
    }

    // ----- chats -----

    /// Existing chat for the contact, or a newly created empty one
    pub fn get_or_create_chat(&mut self, contact_id: &str) -> Result<ChatId> {
        if let Some(chat_id) = self.chat_by_contact.get(contact_id) {
            return Ok(chat_id.clone());
        }
        if !self.contacts.contains_key(contact_id) {
            return Err(ChatError::ContactNotFound(contact_id.to_string()));
        }

        let chat = Chat::new(new_chat_id(), contact_id.to_string(), self.clock.now());
        let chat_id = chat.id.clone();
        self.insert_chat(chat);
        debug!(%chat_id, %contact_id, "Created chat");
        Ok(chat_id)
    }

    pub fn chat(&self, chat_id: &str) -> Option<&Chat> {
        self.chats.get(chat_id)
    }

    pub fn chat_for_contact(&self, contact_id: &str) -> Option<&Chat> {
        self.chat_by_contact
            .get(contact_id)
            .and_then(|id| self.chats.get(id))
    }

    /// Chats in creation order
    pub fn chats(&self) -> impl Iterator<Item = &Chat> {
        self.chat_order.iter().filter_map(|id| self.chats.get(id))
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    // ----- messages -----

    /// Trim and validate message text
    pub fn validate_text(&self, text: &str) -> Result<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::validation("message text is empty"));
        }
        let length = trimmed.chars().count();
        if length > self.max_message_length {
            return Err(ChatError::validation(format!(
                "message text is {} characters (max {})",
                length, self.max_message_length
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Append a new message to a chat with a generated id
    pub fn append_message(
        &mut self,
        chat_id: &str,
        text: &str,
        direction: Direction,
    ) -> Result<Message> {
        self.append_message_with_id(chat_id, new_message_id(), text, direction)
    }

    /// Append a new message with a caller-chosen id
    pub fn append_message_with_id(
        &mut self,
        chat_id: &str,
        message_id: MessageId,
        text: &str,
        direction: Direction,
    ) -> Result<Message> {
        let text = self.validate_text(text)?;
        if message_id.trim().is_empty() {
            return Err(ChatError::validation("message id is empty"));
        }
        if !self.chats.contains_key(chat_id) {
            return Err(ChatError::ChatNotFound(chat_id.to_string()));
        }
        if self.message_chat.contains_key(&message_id) {
            return Err(ChatError::validation(format!(
                "message id {} already exists",
                message_id
            )));
        }

        let message = Message {
            id: message_id,
            chat_id: chat_id.to_string(),
            text,
            created_at: self.clock.now(),
            direction,
            delivery_state: direction.initial_state(),
        };
        self.insert_message(message.clone())?;
        trace!(message_id = %message.id, %chat_id, ?direction, "Appended message");
        Ok(message)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        let chat_id = self.message_chat.get(message_id)?;
        self.chats
            .get(chat_id)?
            .messages
            .iter()
            .find(|m| m.id == message_id)
    }

    /// Move a message's delivery state forward
    ///
    /// Returns `Ok(false)` when the transition is not forward; such updates are ignored.
    pub fn set_delivery_state(
        &mut self,
        message_id: &str,
        new_state: DeliveryState,
    ) -> Result<bool> {
        let chat_id = self
            .message_chat
            .get(message_id)
            .cloned()
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        let chat = self
            .chats
            .get_mut(&chat_id)
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.clone()))?;
        let message = chat
            .message_mut(message_id)
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;

        if !message.delivery_state.can_advance_to(new_state) {
            debug!(
                %message_id,
                current = ?message.delivery_state,
                requested = ?new_state,
                "Ignoring non-forward delivery state"
            );
            return Ok(false);
        }

        let before = message.clone();
        message.delivery_state = new_state;
        let after = message.clone();
        self.derivations.delivery_changed(&chat_id, &before, &after);
        Ok(true)
    }

    /// Mark every incoming message of the chat as read
    ///
    /// Returns how many messages changed state.
    pub fn mark_chat_read(&mut self, chat_id: &str) -> Result<usize> {
        let chat = self
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| ChatError::ChatNotFound(chat_id.to_string()))?;

        let mut changed = 0;
        for message in chat.messages.iter_mut() {
            if message.direction == Direction::Incoming
                && message.delivery_state != DeliveryState::Read
            {
                message.delivery_state = DeliveryState::Read;
                changed += 1;
            }
        }
        self.derivations.chat_read(chat_id);
        Ok(changed)
    }

    // ----- derived views -----

    pub fn derivations(&self) -> &DerivationEngine {
        &self.derivations
    }

    /// Chat summaries, most recent activity first
    pub fn summaries(&self) -> Vec<ChatSummary> {
        self.derivations
            .ordered_chat_ids()
            .filter_map(|id| self.summary(id))
            .collect()
    }

    /// Summary of one chat
    pub fn summary(&self, chat_id: &str) -> Option<ChatSummary> {
        let chat = self.chats.get(chat_id)?;
        let derived = self.derivations.summary(chat_id)?;
        let contact = self.contacts.get(&chat.contact_id);
        let last_message = derived
            .last_message_id
            .as_deref()
            .and_then(|id| chat.last_message().filter(|m| m.id == id))
            .cloned();

        Some(ChatSummary {
            chat_id: chat.id.clone(),
            contact_id: chat.contact_id.clone(),
            contact_name: contact.map(|c| c.name.clone()).unwrap_or_default(),
            contact_online: contact.map(|c| c.online).unwrap_or(false),
            last_message,
            unread_count: derived.unread_count,
            last_activity_at: derived.last_activity_at,
            created_at: chat.created_at,
        })
    }

    /// Check incremental summaries against a full rescan
    pub fn verify(&self) -> std::result::Result<(), Vec<DerivationMismatch>> {
        self.derivations.verify(self.chats.values())
    }

    // ----- restore -----

    /// Insert a chat read back from storage
    pub fn restore_chat(
        &mut self,
        chat_id: ChatId,
        contact_id: ContactId,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        if chat_id.trim().is_empty() {
            return Err(ChatError::validation("chat id is empty"));
        }
        if !self.contacts.contains_key(&contact_id) {
            return Err(ChatError::ContactNotFound(contact_id));
        }
        if self.chats.contains_key(&chat_id) {
            return Err(ChatError::validation(format!("duplicate chat id {}", chat_id)));
        }
        if self.chat_by_contact.contains_key(&contact_id) {
            return Err(ChatError::validation(format!(
                "contact {} already has a chat",
                contact_id
            )));
        }
        self.insert_chat(Chat::new(chat_id, contact_id, created_at));
        Ok(())
    }

    /// Insert a message read back from storage, keeping its timestamp and state
    pub fn restore_message(&mut self, message: Message) -> Result<()> {
        if message.id.trim().is_empty() {
            return Err(ChatError::validation("message id is empty"));
        }
        if message.text.trim().is_empty() {
            return Err(ChatError::validation("message text is empty"));
        }
        if self.message_chat.contains_key(&message.id) {
            return Err(ChatError::validation(format!(
                "duplicate message id {}",
                message.id
            )));
        }
        self.insert_message(message)
    }

    fn insert_chat(&mut self, chat: Chat) {
        self.derivations.track(&chat);
        self.chat_by_contact
            .insert(chat.contact_id.clone(), chat.id.clone());
        self.chat_order.push(chat.id.clone());
        self.chats.insert(chat.id.clone(), chat);
    }

    fn insert_message(&mut self, message: Message) -> Result<()> {
        let chat = self
            .chats
            .get_mut(&message.chat_id)
            .ok_or_else(|| ChatError::ChatNotFound(message.chat_id.clone()))?;
        self.message_chat
            .insert(message.id.clone(), message.chat_id.clone());
        let index = chat.insert_ordered(message);
        self.derivations.message_inserted(chat, index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn setup() -> (EntityStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
        ));
        let mut store = EntityStore::new(10, clock.clone());
        store.upsert_contact(Contact::new("c1", "Alice")).unwrap();
        store.upsert_contact(Contact::new("c2", "Bob")).unwrap();
        (store, clock)
    }

    #[test]
    fn test_upsert_contact_validation() {
        let (mut store, _) = setup();
        assert!(store.upsert_contact(Contact::new("", "x")).unwrap_err().is_validation());
        assert!(store.upsert_contact(Contact::new("c3", "  ")).unwrap_err().is_validation());

        store.upsert_contact(Contact::new("c1", "Alice B.")).unwrap();
        let names: Vec<_> = store.contacts().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Alice B.", "Bob"]);
    }

    #[test]
    fn test_get_or_create_chat_is_idempotent() {
        let (mut store, _) = setup();
        let a = store.get_or_create_chat("c1").unwrap();
        let b = store.get_or_create_chat("c1").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.chat_count(), 1);

        let err = store.get_or_create_chat("nobody").unwrap_err();
        assert!(matches!(err, ChatError::ContactNotFound(_)));
    }

    #[test]
    fn test_append_message_validation() {
        let (mut store, _) = setup();
        let chat_id = store.get_or_create_chat("c1").unwrap();

        assert!(store
            .append_message(&chat_id, "   ", Direction::Outgoing)
            .unwrap_err()
            .is_validation());
        assert!(store
            .append_message(&chat_id, "01234567890", Direction::Outgoing)
            .unwrap_err()
            .is_validation());
        // Ten code points, multi-byte
        assert!(store
            .append_message(&chat_id, "éééééééééé", Direction::Outgoing)
            .is_ok());
        assert!(matches!(
            store.append_message("missing", "hi", Direction::Outgoing),
            Err(ChatError::ChatNotFound(_))
        ));
        assert_eq!(store.chat(&chat_id).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_append_sets_initial_state_and_trims() {
        let (mut store, _) = setup();
        let chat_id = store.get_or_create_chat("c1").unwrap();

        let out = store
            .append_message(&chat_id, "  hi  ", Direction::Outgoing)
            .unwrap();
        assert_eq!(out.text, "hi");
        assert_eq!(out.delivery_state, DeliveryState::Sent);

        let inc = store
            .append_message(&chat_id, "yo", Direction::Incoming)
            .unwrap();
        assert_eq!(inc.delivery_state, DeliveryState::Delivered);
        assert_eq!(store.derivations().summary(&chat_id).unwrap().unread_count, 1);
    }

    #[test]
    fn test_delivery_state_forward_only() {
        let (mut store, _) = setup();
        let chat_id = store.get_or_create_chat("c1").unwrap();
        let m = store
            .append_message(&chat_id, "hi", Direction::Outgoing)
            .unwrap();

        assert!(store.set_delivery_state(&m.id, DeliveryState::Read).unwrap());
        assert!(!store.set_delivery_state(&m.id, DeliveryState::Sent).unwrap());
        assert!(!store.set_delivery_state(&m.id, DeliveryState::Delivered).unwrap());
        assert_eq!(store.message(&m.id).unwrap().delivery_state, DeliveryState::Read);

        assert!(matches!(
            store.set_delivery_state("nope", DeliveryState::Read),
            Err(ChatError::MessageNotFound(_))
        ));
    }

    #[test]
    fn test_mark_chat_read_is_idempotent() {
        let (mut store, _) = setup();
        let chat_id = store.get_or_create_chat("c1").unwrap();
        store.append_message(&chat_id, "a", Direction::Incoming).unwrap();
        store.append_message(&chat_id, "b", Direction::Incoming).unwrap();
        store.append_message(&chat_id, "c", Direction::Outgoing).unwrap();

        assert_eq!(store.mark_chat_read(&chat_id).unwrap(), 2);
        assert_eq!(store.mark_chat_read(&chat_id).unwrap(), 0);
        assert_eq!(store.derivations().summary(&chat_id).unwrap().unread_count, 0);
        assert!(store.verify().is_ok());
    }

    #[test]
    fn test_clock_skew_keeps_order() {
        let (mut store, clock) = setup();
        let chat_id = store.get_or_create_chat("c1").unwrap();
        clock.advance(Duration::seconds(60));
        store.append_message(&chat_id, "later", Direction::Outgoing).unwrap();
        clock.advance(Duration::seconds(-30));
        store.append_message(&chat_id, "skewed", Direction::Incoming).unwrap();

        let chat = store.chat(&chat_id).unwrap();
        let texts: Vec<_> = chat.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["skewed", "later"]);
        let summary = store.summary(&chat_id).unwrap();
        assert_eq!(summary.last_message.unwrap().text, "later");
        assert!(store.verify().is_ok());
    }

    #[test]
    fn test_restore_rejects_bad_references() {
        let (mut store, clock) = setup();
        let now = clock.now();
        assert!(store
            .restore_chat("chat-x".into(), "ghost".into(), now)
            .is_err());
        store.restore_chat("chat-1".into(), "c1".into(), now).unwrap();
        assert!(store.restore_chat("chat-2".into(), "c1".into(), now).is_err());
        assert!(store.restore_chat("chat-1".into(), "c2".into(), now).is_err());

        let message = Message {
            id: "m1".into(),
            chat_id: "chat-1".into(),
            text: "hello".into(),
            created_at: now,
            direction: Direction::Incoming,
            delivery_state: DeliveryState::Read,
        };
        store.restore_message(message.clone()).unwrap();
        assert!(store.restore_message(message.clone()).is_err());

        let orphan = Message {
            id: "m2".into(),
            chat_id: "chat-9".into(),
            ..message
        };
        assert!(matches!(
            store.restore_message(orphan),
            Err(ChatError::ChatNotFound(_))
        ));
        assert!(store.message("m2").is_none());
        assert!(store.verify().is_ok());
    }
}
