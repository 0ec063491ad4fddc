//! Chat Engine
//!
//! The mutation and query surface used by screens and background tasks.
//!
//! ## Overview
//!
//! [`ChatEngine`] is a cheap clonable handle. All state lives behind one lock; every mutation
//! runs synchronously and atomically under it, updating the entity store, the derived views
//! and emitting [`EngineEvent`]s before the lock is released.
//!
//! Persistence is fire-and-forget. Mutations queue a save for a background writer task which
//! coalesces queued saves, snapshots the state under a read lock and hands it to the
//! [`PersistenceAdapter`]. A failed save never rolls back memory; it is retried with backoff,
//! on the next mutation, or on [`ChatEngine::on_foreground`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use chat_engine::{ChatEngine, Contact, EngineConfig, MemoryAdapter, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn example() -> chat_engine::Result<()> {
//! let (engine, report) = ChatEngine::open(
//!     EngineConfig::default(),
//!     Arc::new(MemoryAdapter::new()),
//!     Arc::new(SystemClock),
//! )
//! .await?;
//! assert!(report.load_error.is_none());
//!
//! engine.upsert_contact(Contact::new("c1", "Alice"))?;
//! engine.send_message("c1", "Hello!")?;
//! assert_eq!(engine.list_chats().len(), 1);
//!
//! engine.flush().await?;
//! # Ok(())
//! # }
//! ```

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::derive::DerivationMismatch;
use crate::model::{
    Chat, ChatId, ChatSummary, Contact, ContactId, DeliveryState, Direction, Message, MessageId,
    Profile, ReceiveOptions,
};
use crate::persistence::{PersistenceAdapter, RetryBackoff};
use crate::seed;
use crate::snapshot::{self, LoadReport, SerializedState};
use crate::store::EntityStore;
use crate::{ChatError, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notifications
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A contact was added or changed
    ContactUpdated { contact_id: ContactId },
    /// The local profile changed
    ProfileUpdated,
    /// A chat was created for a contact
    ChatCreated { chat_id: ChatId, contact_id: ContactId },
    /// A message was appended
    MessageAdded { chat_id: ChatId, message: Message },
    /// A message moved forward in its delivery lifecycle
    DeliveryStateChanged {
        chat_id: ChatId,
        message_id: MessageId,
        state: DeliveryState,
    },
    /// Incoming messages of a chat were marked read
    ChatRead { chat_id: ChatId, count: usize },
    /// Saving the state failed; it stays in memory and will be retried
    PersistenceFailed { error: String },
}

/// Save bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStatus {
    pub saves_succeeded: u64,
    pub saves_failed: u64,
    /// Error of the most recent failed save, cleared by the next success
    pub last_error: Option<String>,
    /// Changes exist that have not been saved yet
    pub pending: bool,
    pub last_saved_at: Option<DateTime<Utc>>,
}

enum WriterCommand {
    Save,
    Foreground,
    Flush(oneshot::Sender<Result<()>>),
}

struct EngineInner {
    store: RwLock<EntityStore>,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    status: Mutex<PersistenceStatus>,
}

/// Handle to the chat state
///
/// The background writer stops once every handle is dropped, after saving any change
/// still pending.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl std::fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEngine")
            .field("chats", &self.read().chat_count())
            .field("persistence", &self.persistence_status())
            .finish()
    }
}

impl ChatEngine {
    /// Build an engine and restore its state from `adapter`
    ///
    /// Only an invalid configuration fails. A failed or partial load leaves whatever could
    /// be restored (possibly nothing) and is described by the returned [`LoadReport`].
    pub async fn open(
        config: EngineConfig,
        adapter: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, LoadReport)> {
        config.validate()?;

        let mut store = EntityStore::new(config.limits.max_message_length, clock);
        let report = restore(&mut store, adapter.as_ref(), &config).await;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (writer, commands) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            store: RwLock::new(store),
            config,
            events,
            status: Mutex::new(PersistenceStatus::default()),
        });

        let backoff = RetryBackoff::from_config(&inner.config.persistence);
        tokio::spawn(run_writer(inner.clone(), commands, adapter, backoff));

        let engine = Self { inner, writer };
        if report.seeded {
            engine.schedule_save();
        }

        info!(
            contacts = report.contacts_loaded,
            chats = report.chats_loaded,
            messages = report.messages_loaded,
            dropped = report.dropped(),
            seeded = report.seeded,
            "Chat engine ready"
        );
        Ok((engine, report))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ----- mutations -----

    /// Append an outgoing message to the contact's chat, creating the chat if needed
    pub fn send_message(&self, contact_id: &str, text: &str) -> Result<MessageId> {
        let mark_read = self.inner.config.behavior.mark_read_on_send;
        self.mutate(|store, events| {
            store.validate_text(text)?;
            let chat_id = ensure_chat(store, contact_id, events)?;
            let message = store.append_message(&chat_id, text, Direction::Outgoing)?;
            let message_id = message.id.clone();
            debug!(%chat_id, %message_id, "Sent message");
            events.push(EngineEvent::MessageAdded {
                chat_id: chat_id.clone(),
                message,
            });

            if mark_read {
                let count = store.mark_chat_read(&chat_id)?;
                if count > 0 {
                    events.push(EngineEvent::ChatRead { chat_id, count });
                }
            }
            Ok(message_id)
        })
    }

    /// Append an incoming message to the contact's chat, creating the chat if needed
    ///
    /// With [`ReceiveOptions::message_id`] set, a message already stored under that id in
    /// this chat is not appended again and its id is returned.
    pub fn receive_message(
        &self,
        contact_id: &str,
        text: &str,
        opts: ReceiveOptions,
    ) -> Result<MessageId> {
        self.mutate(|store, events| {
            store.validate_text(text)?;

            if let Some(id) = opts.message_id.as_deref() {
                if id.trim().is_empty() {
                    return Err(ChatError::validation("message id is empty"));
                }
                if let Some(existing) = store.message(id) {
                    let same_chat = store
                        .chat_for_contact(contact_id)
                        .is_some_and(|chat| chat.id == existing.chat_id);
                    if !same_chat {
                        return Err(ChatError::validation(format!(
                            "message id {} belongs to another chat",
                            id
                        )));
                    }
                    debug!(message_id = %id, "Duplicate incoming message ignored");
                    return Ok(id.to_string());
                }
            }

            let chat_id = ensure_chat(store, contact_id, events)?;
            let message = match opts.message_id {
                Some(id) => store.append_message_with_id(&chat_id, id, text, Direction::Incoming)?,
                None => store.append_message(&chat_id, text, Direction::Incoming)?,
            };
            let message_id = message.id.clone();
            debug!(%chat_id, %message_id, "Received message");
            events.push(EngineEvent::MessageAdded { chat_id, message });
            Ok(message_id)
        })
    }

    /// Mark all incoming messages from the contact as read
    ///
    /// Returns how many messages changed. A contact without a chat is a no-op.
    pub fn mark_read(&self, contact_id: &str) -> Result<usize> {
        self.mutate(|store, events| {
            if store.contact(contact_id).is_none() {
                return Err(ChatError::ContactNotFound(contact_id.to_string()));
            }
            let Some(chat_id) = store.chat_for_contact(contact_id).map(|c| c.id.clone()) else {
                return Ok(0);
            };
            let count = store.mark_chat_read(&chat_id)?;
            if count > 0 {
                debug!(%chat_id, count, "Marked chat read");
                events.push(EngineEvent::ChatRead { chat_id, count });
            }
            Ok(count)
        })
    }

    /// Move a message's delivery state forward; backward or repeated updates are ignored
    pub fn set_delivery_state(&self, message_id: &str, state: DeliveryState) -> Result<bool> {
        self.mutate(|store, events| {
            let changed = store.set_delivery_state(message_id, state)?;
            if changed {
                if let Some(message) = store.message(message_id) {
                    events.push(EngineEvent::DeliveryStateChanged {
                        chat_id: message.chat_id.clone(),
                        message_id: message_id.to_string(),
                        state,
                    });
                }
            }
            Ok(changed)
        })
    }

    /// Chat with the contact, created empty if it does not exist yet
    pub fn open_conversation(&self, contact_id: &str) -> Result<ChatId> {
        self.mutate(|store, events| ensure_chat(store, contact_id, events))
    }

    pub fn upsert_contact(&self, contact: Contact) -> Result<()> {
        self.mutate(|store, events| {
            let contact_id = contact.id.clone();
            store.upsert_contact(contact)?;
            events.push(EngineEvent::ContactUpdated { contact_id });
            Ok(())
        })
    }

    pub fn set_presence(
        &self,
        contact_id: &str,
        online: bool,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.mutate(|store, events| {
            store.set_presence(contact_id, online, last_seen_at)?;
            events.push(EngineEvent::ContactUpdated {
                contact_id: contact_id.to_string(),
            });
            Ok(())
        })
    }

    pub fn set_profile(&self, profile: Profile) -> Result<()> {
        self.mutate(|store, events| {
            store.set_profile(profile)?;
            events.push(EngineEvent::ProfileUpdated);
            Ok(())
        })
    }

    /// Check message text against the configured limits without storing anything
    pub fn validate_text(&self, text: &str) -> Result<String> {
        self.read().validate_text(text)
    }

    // ----- queries -----

    /// Chat summaries, most recent activity first
    pub fn list_chats(&self) -> Vec<ChatSummary> {
        self.read().summaries()
    }

    /// Messages exchanged with the contact, oldest first
    pub fn list_messages(&self, contact_id: &str) -> Result<Vec<Message>> {
        let store = self.read();
        if store.contact(contact_id).is_none() {
            return Err(ChatError::ContactNotFound(contact_id.to_string()));
        }
        Ok(store
            .chat_for_contact(contact_id)
            .map(|chat| chat.messages.clone())
            .unwrap_or_default())
    }

    pub fn get_chat(&self, contact_id: &str) -> Option<Chat> {
        self.read().chat_for_contact(contact_id).cloned()
    }

    /// Summary of the contact's chat
    pub fn chat_summary(&self, contact_id: &str) -> Option<ChatSummary> {
        let store = self.read();
        let chat_id = store.chat_for_contact(contact_id)?.id.clone();
        store.summary(&chat_id)
    }

    pub fn get_contact(&self, contact_id: &str) -> Option<Contact> {
        self.read().contact(contact_id).cloned()
    }

    /// Contacts in the order they were first added
    pub fn list_contacts(&self) -> Vec<Contact> {
        self.read().contacts().cloned().collect()
    }

    pub fn profile(&self) -> Profile {
        self.read().profile().clone()
    }

    /// Unread messages across all chats
    pub fn total_unread(&self) -> usize {
        self.read().derivations().total_unread()
    }

    /// Check every derived summary against a rescan of its chat
    pub fn verify(&self) -> std::result::Result<(), Vec<DerivationMismatch>> {
        self.read().verify()
    }

    /// Encode the current state as it would be saved
    pub fn snapshot(&self) -> Result<SerializedState> {
        snapshot::encode(&self.read())
    }

    // ----- events and persistence -----

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Save the current state now and wait for the outcome
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.writer
            .send(WriterCommand::Flush(tx))
            .map_err(|_| ChatError::persistence("state writer has stopped"))?;
        rx.await
            .map_err(|_| ChatError::persistence("state writer has stopped"))?
    }

    /// The app came back to the foreground; retry a pending save right away
    pub fn on_foreground(&self) {
        if self.writer.send(WriterCommand::Foreground).is_err() {
            warn!("State writer has stopped; foreground retry skipped");
        }
    }

    pub fn persistence_status(&self) -> PersistenceStatus {
        lock_status(&self.inner).clone()
    }

    // ----- internals -----

    fn read(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.inner.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityStore> {
        self.inner.store.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` under the write lock, publish its events, and queue a save if anything changed
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut EntityStore, &mut Vec<EngineEvent>) -> Result<T>,
    ) -> Result<T> {
        let mut store = self.write();
        let mut events = Vec::new();
        let result = f(&mut *store, &mut events);

        let changed = !events.is_empty();
        for event in events {
            // No subscribers is fine
            let _ = self.inner.events.send(event);
        }
        drop(store);

        if changed {
            self.schedule_save();
        }
        result
    }

    fn schedule_save(&self) {
        lock_status(&self.inner).pending = true;
        if self.writer.send(WriterCommand::Save).is_err() {
            warn!("State writer has stopped; change will not be saved");
        }
    }
}

fn lock_status(inner: &EngineInner) -> MutexGuard<'_, PersistenceStatus> {
    inner.status.lock().unwrap_or_else(|e| e.into_inner())
}

/// Existing chat for the contact, or a new one announced through `events`
fn ensure_chat(
    store: &mut EntityStore,
    contact_id: &str,
    events: &mut Vec<EngineEvent>,
) -> Result<ChatId> {
    if let Some(chat) = store.chat_for_contact(contact_id) {
        return Ok(chat.id.clone());
    }
    let chat_id = store.get_or_create_chat(contact_id)?;
    events.push(EngineEvent::ChatCreated {
        chat_id: chat_id.clone(),
        contact_id: contact_id.to_string(),
    });
    Ok(chat_id)
}

async fn restore(
    store: &mut EntityStore,
    adapter: &dyn PersistenceAdapter,
    config: &EngineConfig,
) -> LoadReport {
    let mut report = match adapter.load().await {
        Ok(Some(state)) => match snapshot::decode_into(&state, store) {
            Ok(report) => {
                if !report.is_clean() {
                    warn!(dropped = report.dropped(), "Stored state partially restored");
                }
                report
            }
            Err(e) => {
                error!("Stored state unusable: {}", e);
                LoadReport {
                    found: true,
                    load_error: Some(e.to_string()),
                    ..LoadReport::default()
                }
            }
        },
        Ok(None) => LoadReport::default(),
        Err(e) => {
            error!("Failed to load stored state: {}", e);
            LoadReport {
                load_error: Some(e.to_string()),
                ..LoadReport::default()
            }
        }
    };

    if !report.found && report.load_error.is_none() && config.behavior.seed_demo_data {
        match seed::populate(store) {
            Ok(()) => {
                info!("No stored state; started from demo data");
                report.seeded = true;
            }
            Err(e) => warn!("Failed to seed demo data: {}", e),
        }
    }
    report
}

/// Background save loop
///
/// Runs until every engine handle is gone. Changes still unsaved at that point get one
/// last save attempt.
async fn run_writer(
    engine: Arc<EngineInner>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    adapter: Arc<dyn PersistenceAdapter>,
    mut backoff: RetryBackoff,
) {
    let mut dirty = false;
    let mut retry_at: Option<Instant> = None;

    loop {
        let first = match retry_at {
            Some(at) => tokio::select! {
                command = commands.recv() => command,
                _ = tokio::time::sleep_until(at) => {
                    retry_at = None;
                    debug!("Retrying save ({})", backoff.status());
                    Some(WriterCommand::Save)
                }
            },
            None => commands.recv().await,
        };
        let Some(first) = first else {
            if dirty {
                debug!("Engine dropped with unsaved changes; final save");
                if let Err(e) = save_once(&engine, adapter.as_ref()).await {
                    error!("Final save failed; last changes are lost: {}", e);
                }
            }
            break;
        };

        // Coalesce everything already queued into one save
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                WriterCommand::Save => dirty = true,
                WriterCommand::Foreground => {
                    backoff.reset();
                }
                WriterCommand::Flush(tx) => {
                    dirty = true;
                    waiters.push(tx);
                }
            }
            next = commands.try_recv().ok();
        }

        if !dirty {
            continue;
        }

        let result = save_once(&engine, adapter.as_ref()).await;

        match &result {
            Ok(()) => {
                dirty = false;
                retry_at = None;
                backoff.reset();
            }
            Err(e) => {
                warn!("Failed to save state: {}", e);
                let _ = engine.events.send(EngineEvent::PersistenceFailed {
                    error: e.to_string(),
                });
                retry_at = backoff.next_delay().map(|delay| Instant::now() + delay);
                if retry_at.is_none() {
                    warn!("Save retries exhausted; waiting for the next change");
                }
            }
        }

        for waiter in waiters {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(ChatError::persistence(e.to_string())),
            };
            let _ = waiter.send(reply);
        }
    }

    debug!("State writer stopped");
}

async fn save_once(engine: &EngineInner, adapter: &dyn PersistenceAdapter) -> Result<()> {
    let (state, saved_at) = {
        let store = engine.store.read().unwrap_or_else(|e| e.into_inner());
        lock_status(engine).pending = false;
        (snapshot::encode(&store), store.now())
    };

    let result = match state {
        Ok(state) => adapter.save(&state).await,
        Err(e) => Err(e),
    };

    let mut status = lock_status(engine);
    match &result {
        Ok(()) => {
            status.saves_succeeded += 1;
            status.last_error = None;
            status.last_saved_at = Some(saved_at);
        }
        Err(e) => {
            status.saves_failed += 1;
            status.last_error = Some(e.to_string());
            status.pending = true;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryAdapter;
    use chrono::{Duration, TimeZone};

    async fn engine_with(config: EngineConfig) -> (ChatEngine, Arc<ManualClock>, Arc<MemoryAdapter>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
        ));
        let adapter = Arc::new(MemoryAdapter::new());
        let (engine, _) = ChatEngine::open(config, adapter.clone(), clock.clone())
            .await
            .unwrap();
        engine.upsert_contact(Contact::new("c1", "Alice")).unwrap();
        engine.upsert_contact(Contact::new("c2", "Bob")).unwrap();
        (engine, clock, adapter)
    }

    async fn engine() -> (ChatEngine, Arc<ManualClock>, Arc<MemoryAdapter>) {
        engine_with(EngineConfig::default()).await
    }

    #[tokio::test]
    async fn test_send_creates_chat_without_unread() {
        let (engine, _, _) = engine().await;
        let id = engine.send_message("c1", "hello").unwrap();

        let summary = engine.chat_summary("c1").unwrap();
        assert_eq!(summary.unread_count, 0);
        assert_eq!(summary.last_message.unwrap().id, id);
        assert_eq!(engine.list_messages("c1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_text_creates_nothing() {
        let (engine, _, _) = engine().await;
        let err = engine.send_message("c1", "   ").unwrap_err();
        assert!(err.is_validation());
        assert!(engine.get_chat("c1").is_none());
        assert!(engine.list_chats().is_empty());

        let err = engine.receive_message("nobody", "hi", ReceiveOptions::default());
        assert!(matches!(err, Err(ChatError::ContactNotFound(_))));
    }

    #[tokio::test]
    async fn test_receive_is_idempotent_with_message_id() {
        let (engine, _, _) = engine().await;
        let opts = ReceiveOptions::with_message_id("remote-1");
        let a = engine.receive_message("c1", "hi", opts.clone()).unwrap();
        let b = engine.receive_message("c1", "hi", opts.clone()).unwrap();

        assert_eq!(a, "remote-1");
        assert_eq!(a, b);
        assert_eq!(engine.list_messages("c1").unwrap().len(), 1);
        assert_eq!(engine.total_unread(), 1);

        // Same id in another chat is a conflict, not a duplicate
        let err = engine.receive_message("c2", "hi", opts).unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_rejected_receive_creates_no_chat() {
        let (engine, _, _) = engine().await;
        let mut events = engine.subscribe();

        let err = engine
            .receive_message("c1", "hello", ReceiveOptions::with_message_id("  "))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(engine.get_chat("c1").is_none());
        assert!(engine.list_chats().is_empty());
        assert!(events.try_recv().is_err());

        // Conflicting id is rejected before the chat exists too
        engine
            .receive_message("c2", "hi", ReceiveOptions::with_message_id("remote-7"))
            .unwrap();
        let err = engine
            .receive_message("c1", "hi", ReceiveOptions::with_message_id("remote-7"))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(engine.get_chat("c1").is_none());
    }

    #[tokio::test]
    async fn test_mark_read() {
        let (engine, _, _) = engine().await;
        assert_eq!(engine.mark_read("c1").unwrap(), 0);
        assert!(matches!(
            engine.mark_read("nobody"),
            Err(ChatError::ContactNotFound(_))
        ));

        engine.receive_message("c1", "a", ReceiveOptions::default()).unwrap();
        engine.receive_message("c1", "b", ReceiveOptions::default()).unwrap();
        assert_eq!(engine.total_unread(), 2);
        assert_eq!(engine.mark_read("c1").unwrap(), 2);
        assert_eq!(engine.mark_read("c1").unwrap(), 0);
        assert_eq!(engine.total_unread(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_on_send() {
        let mut config = EngineConfig::default();
        config.behavior.mark_read_on_send = true;
        let (engine, _, _) = engine_with(config).await;

        engine.receive_message("c1", "ping", ReceiveOptions::default()).unwrap();
        assert_eq!(engine.total_unread(), 1);
        engine.send_message("c1", "pong").unwrap();
        assert_eq!(engine.total_unread(), 0);
    }

    #[tokio::test]
    async fn test_ordering_follows_activity() {
        let (engine, clock, _) = engine().await;
        engine.send_message("c1", "first").unwrap();
        clock.advance(Duration::seconds(1));
        engine.receive_message("c2", "second", ReceiveOptions::default()).unwrap();

        let order: Vec<_> = engine.list_chats().into_iter().map(|s| s.contact_id).collect();
        assert_eq!(order, vec!["c2", "c1"]);

        clock.advance(Duration::seconds(1));
        engine.send_message("c1", "third").unwrap();
        let order: Vec<_> = engine.list_chats().into_iter().map(|s| s.contact_id).collect();
        assert_eq!(order, vec!["c1", "c2"]);
        assert!(engine.verify().is_ok());
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let (engine, _, _) = engine().await;
        let mut events = engine.subscribe();

        let id = engine.send_message("c1", "hello").unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::ChatCreated { .. }
        ));
        match events.recv().await.unwrap() {
            EngineEvent::MessageAdded { message, .. } => assert_eq!(message.id, id),
            other => panic!("unexpected event {:?}", other),
        }

        engine.set_delivery_state(&id, DeliveryState::Delivered).unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::DeliveryStateChanged {
                state: DeliveryState::Delivered,
                ..
            }
        ));

        // Ignored transition publishes nothing
        assert!(!engine.set_delivery_state(&id, DeliveryState::Sent).unwrap());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_saves_current_state() {
        let (engine, _, adapter) = engine().await;
        engine.send_message("c1", "hello").unwrap();
        engine.flush().await.unwrap();

        let saved = adapter.saved().unwrap();
        assert_eq!(saved.contacts.len(), 2);
        assert_eq!(saved.chats.len(), 1);

        let status = engine.persistence_status();
        assert!(status.saves_succeeded >= 1);
        assert!(!status.pending);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_memory() {
        let (engine, _, adapter) = engine().await;
        engine.flush().await.unwrap();

        adapter.fail_next_saves(1);
        engine.send_message("c1", "hello").unwrap();
        assert!(engine.flush().await.is_err());

        let status = engine.persistence_status();
        assert_eq!(status.saves_failed, 1);
        assert!(status.last_error.is_some());
        assert_eq!(engine.list_messages("c1").unwrap().len(), 1);

        engine.flush().await.unwrap();
        assert!(engine.persistence_status().last_error.is_none());
        assert_eq!(adapter.saved().unwrap().chats.len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_engine_saves_pending_changes() {
        let (engine, _, adapter) = engine().await;
        engine.send_message("c1", "last words").unwrap();
        drop(engine);

        for _ in 0..100 {
            if adapter.saved().is_some_and(|s| s.chats.len() == 1) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let saved = adapter.saved().unwrap();
        assert_eq!(saved.contacts.len(), 2);
        assert_eq!(saved.chats.len(), 1);
    }
}
