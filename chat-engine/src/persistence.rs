//! Persistence
//!
//! Storage backends for [`SerializedState`] and the backoff used to retry failed saves.
//!
//! The engine never blocks a mutation on storage; see [`crate::engine`] for the writer task
//! that drives these adapters.

use crate::config::PersistenceConfig;
use crate::fs_utils;
use crate::snapshot::SerializedState;
use crate::{ChatError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// State file name inside the state directory
pub const STATE_FILE_NAME: &str = "chat_state.json";

/// Storage backend for the engine state
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Read the stored state; `Ok(None)` when nothing has been stored yet
    async fn load(&self) -> Result<Option<SerializedState>>;

    /// Replace the stored state
    async fn save(&self, state: &SerializedState) -> Result<()>;
}

/// JSON file on local disk
#[derive(Debug, Clone)]
pub struct JsonFileAdapter {
    path: PathBuf,
}

impl JsonFileAdapter {
    /// Adapter storing `chat_state.json` inside `state_dir`
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(STATE_FILE_NAME),
        }
    }

    /// Adapter for the configured state directory
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self::new(&config.state_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersistenceAdapter for JsonFileAdapter {
    async fn load(&self) -> Result<Option<SerializedState>> {
        let Some(data) = fs_utils::read_if_exists(&self.path).await? else {
            debug!("No state file at {}", self.path.display());
            return Ok(None);
        };
        let state: SerializedState = serde_json::from_slice(&data)?;
        info!(
            "Loaded state from {} ({} contacts, {} chats)",
            self.path.display(),
            state.contacts.len(),
            state.chats.len()
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &SerializedState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)?;
        fs_utils::write_atomic(&self.path, &data).await?;
        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: Option<SerializedState>,
    fail_saves: usize,
    fail_load: bool,
    save_count: usize,
}

/// In-memory adapter with failure injection, for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    inner: Mutex<MemoryInner>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter that starts out holding `state`
    pub fn with_state(state: SerializedState) -> Self {
        let adapter = Self::default();
        adapter.lock().state = Some(state);
        adapter
    }

    /// Make the next `count` saves fail
    pub fn fail_next_saves(&self, count: usize) {
        self.lock().fail_saves = count;
    }

    /// Make every load fail until cleared
    pub fn set_fail_load(&self, fail: bool) {
        self.lock().fail_load = fail;
    }

    /// Last successfully saved state
    pub fn saved(&self) -> Option<SerializedState> {
        self.lock().state.clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.lock().save_count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn load(&self) -> Result<Option<SerializedState>> {
        let inner = self.lock();
        if inner.fail_load {
            return Err(ChatError::persistence("injected load failure"));
        }
        Ok(inner.state.clone())
    }

    async fn save(&self, state: &SerializedState) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_saves > 0 {
            inner.fail_saves -= 1;
            return Err(ChatError::persistence("injected save failure"));
        }
        inner.state = Some(state.clone());
        inner.save_count += 1;
        Ok(())
    }
}

/// Exponential backoff for failed saves
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    /// Current attempt number
    pub attempt: u32,
    /// Maximum number of timed attempts
    pub max_attempts: u32,
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
}

impl RetryBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            initial_delay,
            current_delay: initial_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self::new(
            config.retry_initial_delay(),
            config.retry_max_delay(),
            config.retry_max_attempts,
        )
    }

    /// Reset after a successful save
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Next delay, doubling each time up to the cap; `None` once attempts run out
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }

        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = std::cmp::min(self.current_delay * 2, self.max_delay);

        Some(delay)
    }

    /// Get human-readable status
    pub fn status(&self) -> String {
        format!(
            "Attempt {}/{}, next delay: {:?}",
            self.attempt, self.max_attempts, self.current_delay
        )
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from_config(&PersistenceConfig::default())
    }
}
