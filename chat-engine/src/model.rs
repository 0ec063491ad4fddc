//! Domain model
//!
//! Contacts, chats and messages as owned by the entity store. Everything handed to
//! callers is a clone; nothing here exposes interior mutability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Contact identifier
pub type ContactId = String;

/// Chat identifier
pub type ChatId = String;

/// Message identifier
pub type MessageId = String;

/// Default maximum message length in Unicode scalar values
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1000;

/// Generate a fresh chat id
pub fn new_chat_id() -> ChatId {
    format!("chat-{}", Uuid::new_v4())
}

/// Generate a fresh message id
pub fn new_message_id() -> MessageId {
    format!("msg-{}", Uuid::new_v4())
}

/// Addressable peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Stable, immutable identifier
    pub id: ContactId,
    /// Display name
    pub name: String,
    /// Presence
    pub online: bool,
    /// When the contact was last seen online
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// Create an offline contact with no presence history
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            online: false,
            last_seen_at: None,
        }
    }

    /// Builder-style presence setter
    pub fn with_presence(mut self, online: bool, last_seen_at: Option<DateTime<Utc>>) -> Self {
        self.online = online;
        self.last_seen_at = last_seen_at;
        self
    }
}

/// The local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            id: "me".to_string(),
            name: "Me".to_string(),
        }
    }
}

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Written by the local user
    Outgoing,
    /// Written by the contact
    Incoming,
}

impl Direction {
    /// Delivery state a freshly appended message starts in
    pub fn initial_state(self) -> DeliveryState {
        match self {
            Direction::Outgoing => DeliveryState::Sent,
            Direction::Incoming => DeliveryState::Delivered,
        }
    }
}

/// Delivery lifecycle stage
///
/// The declaration order is the lifecycle order; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    /// Whether moving from `self` to `next` is a forward transition
    ///
    /// ```rust
    /// use chat_engine::DeliveryState;
    ///
    /// assert!(DeliveryState::Sent.can_advance_to(DeliveryState::Read));
    /// assert!(!DeliveryState::Read.can_advance_to(DeliveryState::Sent));
    /// assert!(!DeliveryState::Delivered.can_advance_to(DeliveryState::Delivered));
    /// ```
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        next > self
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Owning chat
    pub chat_id: ChatId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub direction: Direction,
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Whether this message counts towards the chat's unread counter
    pub fn is_unread(&self) -> bool {
        self.direction == Direction::Incoming && self.delivery_state != DeliveryState::Read
    }
}

/// Conversation with one contact
///
/// The unread counter is a derived value and lives in the derivation engine, see
/// [`crate::derive::ChatDerivation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub contact_id: ContactId,
    /// Ordered by `created_at` ascending, ties by insertion order
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    /// Create an empty chat
    pub fn new(id: ChatId, contact_id: ContactId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            contact_id,
            messages: Vec::new(),
            created_at,
        }
    }

    /// Most recent message
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Insert keeping `created_at` order; equal timestamps go after existing ones.
    ///
    /// Returns the insertion index.
    pub(crate) fn insert_ordered(&mut self, message: Message) -> usize {
        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(index, message);
        index
    }

    pub(crate) fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }

    pub(crate) fn contains_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }
}

/// Read-only summary of a chat for list screens
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub contact_id: ContactId,
    pub contact_name: String,
    pub contact_online: bool,
    pub last_message: Option<Message>,
    pub unread_count: usize,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Options for an incoming message
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Idempotency key; a message with this id that already exists in the chat is not
    /// appended again
    pub message_id: Option<MessageId>,
}

impl ReceiveOptions {
    pub fn with_message_id(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
        }
    }
}
