//! Derivation Engine
//!
//! Keeps per-chat summaries (last message, unread counter, last activity) and the chat
//! ordering in sync with every store mutation without rescanning message lists.
//!
//! ## Ordering
//!
//! Chats are ordered by most recent activity first. Ties are broken by chat creation time
//! (newest first) and finally by chat id so the order is total and stable across reads.
//!
//! ## Cross-check
//!
//! [`DerivationEngine::rescan`] recomputes a summary from the message list. The store is
//! correct exactly when [`DerivationEngine::verify`] finds no chat whose incremental summary
//! differs from its rescan.

use crate::model::{Chat, ChatId, Message, MessageId};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Derived values for one chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDerivation {
    pub last_message_id: Option<MessageId>,
    pub unread_count: usize,
    /// `created_at` of the last message, or of the chat itself when empty
    pub last_activity_at: DateTime<Utc>,
    pub chat_created_at: DateTime<Utc>,
}

type OrderKey = (Reverse<DateTime<Utc>>, Reverse<DateTime<Utc>>, ChatId);

fn order_key(chat_id: &str, derivation: &ChatDerivation) -> OrderKey {
    (
        Reverse(derivation.last_activity_at),
        Reverse(derivation.chat_created_at),
        chat_id.to_string(),
    )
}

/// Disagreement between incremental state and a full rescan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationMismatch {
    /// A chat's summary (or its ordering entry) differs from its rescan
    Summary {
        chat_id: ChatId,
        incremental: Option<ChatDerivation>,
        rescanned: ChatDerivation,
    },
    /// The engine tracks a different number of chats than the store holds
    ChatCount { tracked: usize, indexed: usize, chats: usize },
}

impl fmt::Display for DerivationMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivationMismatch::Summary {
                chat_id,
                incremental,
                rescanned,
            } => write!(
                f,
                "chat {}: incremental {:?} != rescan {:?}",
                chat_id, incremental, rescanned
            ),
            DerivationMismatch::ChatCount {
                tracked,
                indexed,
                chats,
            } => write!(
                f,
                "tracking {} summaries and {} order entries for {} chats",
                tracked, indexed, chats
            ),
        }
    }
}

/// Incrementally maintained summaries keyed by chat id
#[derive(Debug, Default)]
pub struct DerivationEngine {
    summaries: HashMap<ChatId, ChatDerivation>,
    order: BTreeSet<OrderKey>,
}

impl DerivationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute a chat's summary by scanning its messages
    pub fn rescan(chat: &Chat) -> ChatDerivation {
        let last = chat.messages.last();
        ChatDerivation {
            last_message_id: last.map(|m| m.id.clone()),
            unread_count: chat.messages.iter().filter(|m| m.is_unread()).count(),
            last_activity_at: last.map(|m| m.created_at).unwrap_or(chat.created_at),
            chat_created_at: chat.created_at,
        }
    }

    /// Register a chat, computing its summary from scratch
    ///
    /// Used for new (empty) chats and for chats restored from storage.
    pub fn track(&mut self, chat: &Chat) {
        self.replace(&chat.id, Self::rescan(chat));
    }

    /// Account for `chat.messages[index]`, which was just inserted
    pub fn message_inserted(&mut self, chat: &Chat, index: usize) {
        let Some(message) = chat.messages.get(index) else {
            return;
        };
        let Some(mut derivation) = self.summaries.get(&chat.id).cloned() else {
            self.track(chat);
            return;
        };

        if index + 1 == chat.messages.len() {
            derivation.last_message_id = Some(message.id.clone());
            derivation.last_activity_at = message.created_at;
        }
        if message.is_unread() {
            derivation.unread_count += 1;
        }
        self.replace(&chat.id, derivation);
    }

    /// Account for a delivery state change of one message
    pub fn delivery_changed(&mut self, chat_id: &str, before: &Message, after: &Message) {
        let Some(derivation) = self.summaries.get_mut(chat_id) else {
            return;
        };
        match (before.is_unread(), after.is_unread()) {
            (true, false) => derivation.unread_count = derivation.unread_count.saturating_sub(1),
            (false, true) => derivation.unread_count += 1,
            _ => {}
        }
    }

    /// All incoming messages of the chat became read
    pub fn chat_read(&mut self, chat_id: &str) {
        if let Some(derivation) = self.summaries.get_mut(chat_id) {
            derivation.unread_count = 0;
        }
    }

    /// Summary for one chat
    pub fn summary(&self, chat_id: &str) -> Option<&ChatDerivation> {
        self.summaries.get(chat_id)
    }

    /// Chat ids, most recent activity first
    pub fn ordered_chat_ids(&self) -> impl Iterator<Item = &ChatId> {
        self.order.iter().map(|(_, _, id)| id)
    }

    /// Sum of all unread counters
    pub fn total_unread(&self) -> usize {
        self.summaries.values().map(|d| d.unread_count).sum()
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    /// Compare every incremental summary against a rescan of `chats`
    pub fn verify<'a>(
        &self,
        chats: impl IntoIterator<Item = &'a Chat>,
    ) -> Result<(), Vec<DerivationMismatch>> {
        let mut mismatches = Vec::new();
        let mut seen = 0;

        for chat in chats {
            seen += 1;
            let rescanned = Self::rescan(chat);
            let incremental = self.summaries.get(&chat.id);
            let indexed = self.order.contains(&order_key(&chat.id, &rescanned));
            if incremental != Some(&rescanned) || !indexed {
                mismatches.push(DerivationMismatch::Summary {
                    chat_id: chat.id.clone(),
                    incremental: incremental.cloned(),
                    rescanned,
                });
            }
        }

        if seen != self.summaries.len() || seen != self.order.len() {
            mismatches.push(DerivationMismatch::ChatCount {
                tracked: self.summaries.len(),
                indexed: self.order.len(),
                chats: seen,
            });
        }

        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(mismatches)
        }
    }

    fn replace(&mut self, chat_id: &str, derivation: ChatDerivation) {
        if let Some(old) = self.summaries.get(chat_id) {
            self.order.remove(&order_key(chat_id, old));
        }
        self.order.insert(order_key(chat_id, &derivation));
        self.summaries.insert(chat_id.to_string(), derivation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryState, Direction};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn push(chat: &mut Chat, id: &str, at: DateTime<Utc>, direction: Direction) -> usize {
        chat.insert_ordered(Message {
            id: id.to_string(),
            chat_id: chat.id.clone(),
            text: id.to_string(),
            created_at: at,
            direction,
            delivery_state: direction.initial_state(),
        })
    }

    #[test]
    fn test_incremental_matches_rescan() {
        let mut engine = DerivationEngine::new();
        let mut chat = Chat::new("chat-a".into(), "c1".into(), t(0));
        engine.track(&chat);

        let i = push(&mut chat, "m1", t(5), Direction::Incoming);
        engine.message_inserted(&chat, i);
        let i = push(&mut chat, "m2", t(6), Direction::Outgoing);
        engine.message_inserted(&chat, i);
        let i = push(&mut chat, "m3", t(7), Direction::Incoming);
        engine.message_inserted(&chat, i);

        let summary = engine.summary("chat-a").unwrap();
        assert_eq!(summary.unread_count, 2);
        assert_eq!(summary.last_message_id.as_deref(), Some("m3"));
        assert_eq!(summary.last_activity_at, t(7));
        assert!(engine.verify([&chat]).is_ok());
    }

    #[test]
    fn test_out_of_order_insert_keeps_last_message() {
        let mut engine = DerivationEngine::new();
        let mut chat = Chat::new("chat-a".into(), "c1".into(), t(0));
        engine.track(&chat);

        let i = push(&mut chat, "late", t(10), Direction::Outgoing);
        engine.message_inserted(&chat, i);
        let i = push(&mut chat, "early", t(3), Direction::Incoming);
        engine.message_inserted(&chat, i);

        let summary = engine.summary("chat-a").unwrap();
        assert_eq!(summary.last_message_id.as_deref(), Some("late"));
        assert_eq!(summary.unread_count, 1);
        assert!(engine.verify([&chat]).is_ok());
    }

    #[test]
    fn test_delivery_change_and_read() {
        let mut engine = DerivationEngine::new();
        let mut chat = Chat::new("chat-a".into(), "c1".into(), t(0));
        engine.track(&chat);
        let i = push(&mut chat, "m1", t(1), Direction::Incoming);
        engine.message_inserted(&chat, i);
        let i = push(&mut chat, "m2", t(2), Direction::Incoming);
        engine.message_inserted(&chat, i);

        let before = chat.messages[0].clone();
        chat.messages[0].delivery_state = DeliveryState::Read;
        let after = chat.messages[0].clone();
        engine.delivery_changed("chat-a", &before, &after);
        assert_eq!(engine.summary("chat-a").unwrap().unread_count, 1);

        for m in chat.messages.iter_mut() {
            m.delivery_state = DeliveryState::Read;
        }
        engine.chat_read("chat-a");
        assert_eq!(engine.summary("chat-a").unwrap().unread_count, 0);
        assert!(engine.verify([&chat]).is_ok());
    }

    #[test]
    fn test_ordering_most_recent_first_with_tie_breaks() {
        let mut engine = DerivationEngine::new();
        let mut old = Chat::new("chat-old".into(), "c1".into(), t(0));
        let quiet = Chat::new("chat-quiet".into(), "c2".into(), t(20));
        let twin = Chat::new("chat-twin".into(), "c3".into(), t(10));
        engine.track(&old);
        engine.track(&quiet);
        engine.track(&twin);

        let order: Vec<_> = engine.ordered_chat_ids().cloned().collect();
        assert_eq!(order, vec!["chat-quiet", "chat-twin", "chat-old"]);

        // Activity at the same instant as chat-quiet's creation: the newer chat wins the tie.
        let i = push(&mut old, "m1", t(20), Direction::Outgoing);
        engine.message_inserted(&old, i);
        let order: Vec<_> = engine.ordered_chat_ids().cloned().collect();
        assert_eq!(order, vec!["chat-quiet", "chat-old", "chat-twin"]);

        let i = push(&mut old, "m2", t(30), Direction::Outgoing);
        engine.message_inserted(&old, i);
        let order: Vec<_> = engine.ordered_chat_ids().cloned().collect();
        assert_eq!(order, vec!["chat-old", "chat-quiet", "chat-twin"]);
        assert!(engine.verify([&old, &quiet, &twin]).is_ok());
    }

    #[test]
    fn test_verify_reports_drift() {
        let mut engine = DerivationEngine::new();
        let mut chat = Chat::new("chat-a".into(), "c1".into(), t(0));
        engine.track(&chat);

        // Mutate behind the engine's back.
        push(&mut chat, "m1", t(1), Direction::Incoming);

        let mismatches = engine.verify([&chat]).unwrap_err();
        assert_eq!(mismatches.len(), 1);
        match &mismatches[0] {
            DerivationMismatch::Summary {
                chat_id, rescanned, ..
            } => {
                assert_eq!(chat_id, "chat-a");
                assert_eq!(rescanned.unread_count, 1);
            }
            other => panic!("unexpected mismatch: {}", other),
        }

        // A chat the engine never saw.
        let stranger = Chat::new("chat-b".into(), "c2".into(), t(0));
        let mismatches = engine.verify([&stranger]).unwrap_err();
        assert!(mismatches
            .iter()
            .any(|m| matches!(m, DerivationMismatch::Summary { incremental: None, .. })));
    }
}
