//! Serialized state
//!
//! The plain structural encoding handed to a [`crate::persistence::PersistenceAdapter`].
//!
//! ## Format
//!
//! ```json
//! {
//!     "version": 1,
//!     "saved_at": "2024-06-01T10:00:00Z",
//!     "profile": { "id": "me", "name": "Me" },
//!     "contacts": [
//!         { "id": "1", "name": "Alice Johnson", "online": true, "last_seen_at": null }
//!     ],
//!     "chats": [
//!         {
//!             "id": "chat-1",
//!             "contact_id": "1",
//!             "created_at": "2024-06-01T08:00:00Z",
//!             "unread_count": 1,
//!             "messages": [
//!                 {
//!                     "id": "msg-1",
//!                     "chat_id": "chat-1",
//!                     "text": "Hey there!",
//!                     "created_at": "2024-06-01T08:00:00Z",
//!                     "direction": "incoming",
//!                     "delivery_state": "delivered"
//!                 }
//!             ]
//!         }
//!     ]
//! }
//! ```
//!
//! Timestamps are RFC 3339 strings. Contacts, chats and messages are kept as raw JSON values
//! so that decoding can reject one record without rejecting the file.

use crate::model::{Contact, Direction, DeliveryState, Message, Profile};
use crate::store::EntityStore;
use crate::{ChatError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Current format version
pub const STATE_VERSION: u32 = 1;

/// Whole persisted state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedState {
    pub version: u32,
    pub saved_at: String,
    #[serde(default)]
    pub profile: Option<Value>,
    #[serde(default)]
    pub contacts: Vec<Value>,
    #[serde(default)]
    pub chats: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContactRecord {
    id: String,
    name: String,
    #[serde(default)]
    online: bool,
    #[serde(default)]
    last_seen_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatRecord {
    id: String,
    contact_id: String,
    created_at: String,
    /// Informational; recomputed from the messages on load
    #[serde(default)]
    unread_count: usize,
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageRecord {
    id: String,
    chat_id: String,
    text: String,
    created_at: String,
    direction: Direction,
    delivery_state: DeliveryState,
}

/// Outcome of decoding a [`SerializedState`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Whether stored state existed at all
    pub found: bool,
    pub contacts_loaded: usize,
    pub chats_loaded: usize,
    pub messages_loaded: usize,
    pub dropped_contacts: usize,
    pub dropped_chats: usize,
    pub dropped_messages: usize,
    /// Set when the adapter failed or the state could not be used at all
    pub load_error: Option<String>,
    /// Whether the store was populated from seed data
    pub seeded: bool,
}

impl LoadReport {
    /// Total number of records skipped
    pub fn dropped(&self) -> usize {
        self.dropped_contacts + self.dropped_chats + self.dropped_messages
    }

    /// Whether anything was skipped or failed
    pub fn is_clean(&self) -> bool {
        self.dropped() == 0 && self.load_error.is_none()
    }
}

/// Format a timestamp for the wire
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a wire timestamp
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ChatError::validation(format!("invalid timestamp '{}': {}", raw, e)))
}

/// Encode the whole store
pub fn encode(store: &EntityStore) -> Result<SerializedState> {
    let contacts = store
        .contacts()
        .map(|contact| {
            serde_json::to_value(ContactRecord {
                id: contact.id.clone(),
                name: contact.name.clone(),
                online: contact.online,
                last_seen_at: contact.last_seen_at.as_ref().map(format_timestamp),
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut chats = Vec::with_capacity(store.chat_count());
    for chat in store.chats() {
        let messages = chat
            .messages
            .iter()
            .map(|m| {
                serde_json::to_value(MessageRecord {
                    id: m.id.clone(),
                    chat_id: m.chat_id.clone(),
                    text: m.text.clone(),
                    created_at: format_timestamp(&m.created_at),
                    direction: m.direction,
                    delivery_state: m.delivery_state,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let unread_count = store
            .derivations()
            .summary(&chat.id)
            .map(|d| d.unread_count)
            .unwrap_or(0);

        chats.push(serde_json::to_value(ChatRecord {
            id: chat.id.clone(),
            contact_id: chat.contact_id.clone(),
            created_at: format_timestamp(&chat.created_at),
            unread_count,
            messages,
        })?);
    }

    Ok(SerializedState {
        version: STATE_VERSION,
        saved_at: format_timestamp(&store.now()),
        profile: Some(serde_json::to_value(store.profile())?),
        contacts,
        chats,
    })
}

/// Decode into `store`, skipping records that are malformed or break an invariant
///
/// Only a version mismatch fails the whole decode; everything else is counted in the
/// returned report.
pub fn decode_into(state: &SerializedState, store: &mut EntityStore) -> Result<LoadReport> {
    if state.version > STATE_VERSION {
        return Err(ChatError::UnsupportedVersion(state.version));
    }

    let mut report = LoadReport {
        found: true,
        ..LoadReport::default()
    };

    if let Some(raw) = &state.profile {
        match serde_json::from_value::<Profile>(raw.clone()) {
            Ok(profile) => {
                if let Err(e) = store.set_profile(profile) {
                    warn!("Ignoring stored profile: {}", e);
                }
            }
            Err(e) => warn!("Ignoring malformed stored profile: {}", e),
        }
    }

    for raw in &state.contacts {
        let restored = decode_contact(raw).and_then(|contact| {
            if store.contact(&contact.id).is_some() {
                return Err(ChatError::validation(format!(
                    "duplicate contact id {}",
                    contact.id
                )));
            }
            store.upsert_contact(contact)
        });
        match restored {
            Ok(()) => report.contacts_loaded += 1,
            Err(e) => {
                warn!("Dropping stored contact: {}", e);
                report.dropped_contacts += 1;
            }
        }
    }

    for raw in &state.chats {
        let record = match serde_json::from_value::<ChatRecord>(raw.clone()) {
            Ok(record) => record,
            Err(e) => {
                warn!("Dropping malformed stored chat: {}", e);
                report.dropped_chats += 1;
                continue;
            }
        };
        let restored = parse_timestamp(&record.created_at).and_then(|created_at| {
            store.restore_chat(record.id.clone(), record.contact_id.clone(), created_at)
        });
        if let Err(e) = restored {
            warn!(chat_id = %record.id, "Dropping stored chat: {}", e);
            report.dropped_chats += 1;
            // Its messages go with it.
            report.dropped_messages += record.messages.len();
            continue;
        }
        report.chats_loaded += 1;

        for raw_message in &record.messages {
            let result = decode_message(raw_message).and_then(|message| {
                if message.chat_id != record.id {
                    return Err(ChatError::validation(format!(
                        "message {} claims chat {} inside chat {}",
                        message.id, message.chat_id, record.id
                    )));
                }
                store.restore_message(message)
            });
            match result {
                Ok(()) => report.messages_loaded += 1,
                Err(e) => {
                    warn!(chat_id = %record.id, "Dropping stored message: {}", e);
                    report.dropped_messages += 1;
                }
            }
        }
    }

    debug!(
        contacts = report.contacts_loaded,
        chats = report.chats_loaded,
        messages = report.messages_loaded,
        dropped = report.dropped(),
        "Decoded stored state"
    );
    Ok(report)
}

fn decode_contact(raw: &Value) -> Result<Contact> {
    let record: ContactRecord = serde_json::from_value(raw.clone())?;
    let last_seen_at = record
        .last_seen_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()?;
    Ok(Contact {
        id: record.id,
        name: record.name,
        online: record.online,
        last_seen_at,
    })
}

fn decode_message(raw: &Value) -> Result<Message> {
    let record: MessageRecord = serde_json::from_value(raw.clone())?;
    Ok(Message {
        created_at: parse_timestamp(&record.created_at)?,
        id: record.id,
        chat_id: record.chat_id,
        text: record.text,
        direction: record.direction,
        delivery_state: record.delivery_state,
    })
}
