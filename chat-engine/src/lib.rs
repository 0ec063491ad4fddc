//! Chat State Engine
//!
//! Client-side state for one-to-one messaging: contacts, chats and messages, the derived
//! views a chat list needs (last message, unread count, ordering), a pluggable persistence
//! adapter, and cancellable delivery of asynchronous incoming messages.

pub mod auto_reply;
pub mod clock;
pub mod config;
pub mod derive;
pub mod engine;
pub mod fs_utils;
pub mod injection;
pub mod model;
pub mod persistence;
pub mod seed;
pub mod snapshot;
pub mod store;

mod error;

pub use auto_reply::AutoResponder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AutoReplyConfig, BehaviorConfig, EngineConfig, LimitsConfig, PersistenceConfig};
pub use derive::{ChatDerivation, DerivationEngine, DerivationMismatch};
pub use engine::{ChatEngine, EngineEvent, PersistenceStatus};
pub use error::{ChatError, Result};
pub use injection::{InjectionHandle, InjectionScheduler, InjectionState};
pub use model::{
    Chat, ChatId, ChatSummary, Contact, ContactId, DeliveryState, Direction, Message, MessageId,
    Profile, ReceiveOptions, DEFAULT_MAX_MESSAGE_LENGTH,
};
pub use persistence::{JsonFileAdapter, MemoryAdapter, PersistenceAdapter, RetryBackoff};
pub use snapshot::{LoadReport, SerializedState, STATE_VERSION};
pub use store::EntityStore;
