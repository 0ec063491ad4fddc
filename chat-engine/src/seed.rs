//! Demo data for a first start with nothing stored

use crate::model::{Contact, DeliveryState, Direction, Message};
use crate::store::EntityStore;
use crate::Result;
use chrono::Duration;

/// Fill an empty store with three contacts and one conversation
///
/// Timestamps are relative to the store's clock. Both incoming messages are left unread.
pub fn populate(store: &mut EntityStore) -> Result<()> {
    let now = store.now();

    store.upsert_contact(Contact::new("1", "Alice Johnson").with_presence(true, Some(now)))?;
    store.upsert_contact(
        Contact::new("2", "Bob Smith").with_presence(false, Some(now - Duration::hours(1))),
    )?;
    store.upsert_contact(Contact::new("3", "Carol Williams").with_presence(true, Some(now)))?;

    let started = now - Duration::hours(2);
    store.restore_chat("chat-1".to_string(), "1".to_string(), started)?;

    let messages = [
        (
            "msg-1",
            "Hey there! How are you?",
            started,
            Direction::Incoming,
            DeliveryState::Delivered,
        ),
        (
            "msg-2",
            "I'm doing great, thanks! How about you?",
            now - Duration::hours(1),
            Direction::Outgoing,
            DeliveryState::Delivered,
        ),
        (
            "msg-3",
            "Awesome! Want to grab coffee later?",
            now - Duration::minutes(30),
            Direction::Incoming,
            DeliveryState::Delivered,
        ),
    ];
    for (id, text, created_at, direction, delivery_state) in messages {
        store.restore_message(Message {
            id: id.to_string(),
            chat_id: "chat-1".to_string(),
            text: text.to_string(),
            created_at,
            direction,
            delivery_state,
        })?;
    }

    Ok(())
}
