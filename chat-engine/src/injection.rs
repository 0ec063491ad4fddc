//! Async message injection
//!
//! Incoming messages that arrive outside a caller's synchronous path, such as a simulated
//! reply or a delayed push. Each injection moves exactly once from
//! [`InjectionState::Scheduled`] to either [`InjectionState::Delivered`] or
//! [`InjectionState::Cancelled`].
//!
//! The transition and the delivery into the engine happen under the injection's own lock.
//! A [`InjectionHandle::cancel`] racing the timer therefore either revokes the message before
//! it is appended or observes that it was delivered; it never sees a half-done delivery.
//! Lock order is injection first, engine second.

use crate::engine::ChatEngine;
use crate::model::{new_message_id, ContactId, MessageId, ReceiveOptions};
use crate::{ChatError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of one injection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionState {
    /// Waiting for its delay to elapse
    Scheduled,
    /// Appended to the chat under this message id
    Delivered(MessageId),
    /// Revoked, or the contact disappeared before delivery
    Cancelled,
}

impl InjectionState {
    pub fn is_final(&self) -> bool {
        !matches!(self, InjectionState::Scheduled)
    }
}

struct Slot {
    state: watch::Sender<InjectionState>,
    task: Option<JoinHandle<()>>,
}

type Registry = Arc<Mutex<HashMap<u64, InjectionHandle>>>;

/// Cancellable reference to a scheduled injection
#[derive(Clone)]
pub struct InjectionHandle {
    id: u64,
    contact_id: ContactId,
    slot: Arc<Mutex<Slot>>,
    updates: watch::Receiver<InjectionState>,
    registry: Registry,
}

impl std::fmt::Debug for InjectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionHandle")
            .field("id", &self.id)
            .field("contact_id", &self.contact_id)
            .field("state", &self.state())
            .finish()
    }
}

impl InjectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }

    /// Current state
    pub fn state(&self) -> InjectionState {
        self.updates.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        !self.state().is_final()
    }

    /// Revoke a scheduled injection
    ///
    /// Returns `true` if this call cancelled it, `false` if it was already delivered or
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut slot = lock(&self.slot);
            if slot.state.borrow().is_final() {
                false
            } else {
                slot.state.send_replace(InjectionState::Cancelled);
                if let Some(task) = slot.task.take() {
                    task.abort();
                }
                true
            }
        };

        if cancelled {
            debug!(injection = self.id, contact_id = %self.contact_id, "Cancelled injection");
            lock(&self.registry).remove(&self.id);
        }
        cancelled
    }

    /// Wait until the injection is delivered or cancelled
    pub async fn finished(&self) -> InjectionState {
        let mut updates = self.updates.clone();
        loop {
            let current = updates.borrow_and_update().clone();
            if current.is_final() {
                return current;
            }
            if updates.changed().await.is_err() {
                return updates.borrow().clone();
            }
        }
    }

    /// Timer fired: deliver unless cancelled first
    fn deliver(&self, engine: &ChatEngine, text: &str, message_id: MessageId) {
        {
            let slot = lock(&self.slot);
            if slot.state.borrow().is_final() {
                return;
            }

            let next = if engine.get_contact(&self.contact_id).is_none() {
                debug!(injection = self.id, contact_id = %self.contact_id, "Contact gone; injection dropped");
                InjectionState::Cancelled
            } else {
                match engine.receive_message(
                    &self.contact_id,
                    text,
                    ReceiveOptions::with_message_id(message_id),
                ) {
                    Ok(id) => {
                        debug!(injection = self.id, message_id = %id, "Delivered injection");
                        InjectionState::Delivered(id)
                    }
                    Err(e) => {
                        warn!(injection = self.id, "Injection not delivered: {}", e);
                        InjectionState::Cancelled
                    }
                }
            };
            slot.state.send_replace(next);
        }
        lock(&self.registry).remove(&self.id);
    }
}

/// Schedules delayed incoming messages into an engine
#[derive(Clone)]
pub struct InjectionScheduler {
    engine: ChatEngine,
    next_id: Arc<AtomicU64>,
    pending: Registry,
}

impl InjectionScheduler {
    pub fn new(engine: ChatEngine) -> Self {
        Self {
            engine,
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &ChatEngine {
        &self.engine
    }

    /// Deliver `text` from `contact_id` after `delay`
    ///
    /// Fails at once if the contact is unknown or the text is invalid. Must be called from
    /// within a Tokio runtime.
    pub fn schedule(
        &self,
        contact_id: &str,
        text: impl Into<String>,
        delay: Duration,
    ) -> Result<InjectionHandle> {
        let text = text.into();
        if self.engine.get_contact(contact_id).is_none() {
            return Err(ChatError::ContactNotFound(contact_id.to_string()));
        }
        self.engine.validate_text(&text)?;

        let (state, updates) = watch::channel(InjectionState::Scheduled);
        let handle = InjectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            contact_id: contact_id.to_string(),
            slot: Arc::new(Mutex::new(Slot { state, task: None })),
            updates,
            registry: self.pending.clone(),
        };
        lock(&self.pending).insert(handle.id, handle.clone());

        // Fixed up front so a delivery can never append twice
        let message_id = new_message_id();
        let task = {
            let handle = handle.clone();
            let engine = self.engine.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                handle.deliver(&engine, &text, message_id);
            })
        };

        {
            let mut slot = lock(&handle.slot);
            if slot.state.borrow().is_final() {
                // Delivered or cancelled before we got here
                drop(task);
            } else {
                slot.task = Some(task);
            }
        }

        debug!(
            injection = handle.id,
            %contact_id,
            delay_ms = delay.as_millis() as u64,
            "Scheduled injection"
        );
        Ok(handle)
    }

    /// Cancel every pending injection for the contact; returns how many were cancelled
    pub fn cancel_for_contact(&self, contact_id: &str) -> usize {
        let handles: Vec<InjectionHandle> = lock(&self.pending)
            .values()
            .filter(|h| h.contact_id == contact_id)
            .cloned()
            .collect();
        handles.iter().filter(|h| h.cancel()).count()
    }

    /// Cancel everything still pending
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<InjectionHandle> = lock(&self.pending).values().cloned().collect();
        let count = handles.iter().filter(|h| h.cancel()).count();
        if count > 0 {
            debug!(count, "Cancelled all pending injections");
        }
        count
    }

    /// Injections still waiting to fire
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
