//! Engine Configuration
//!
//! Configuration management for the chat engine.

use crate::model::DEFAULT_MAX_MESSAGE_LENGTH;
use crate::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "engine.toml";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Input limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Behavior switches
    #[serde(default)]
    pub behavior: BehaviorConfig,

    /// State storage and save retries
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Simulated replies
    #[serde(default)]
    pub auto_reply: AutoReplyConfig,
}

/// Input limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message length in characters, after trimming
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

/// Behavior switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Mark the chat read after the local user sends into it
    #[serde(default = "default_false")]
    pub mark_read_on_send: bool,

    /// Start from demo contacts and messages when nothing is stored yet
    #[serde(default = "default_false")]
    pub seed_demo_data: bool,
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding the state file
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// First retry delay after a failed save, in milliseconds
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    /// Upper bound for the retry delay, in milliseconds
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Timed retries before waiting for the next mutation or foreground event
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

/// Auto-reply configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoReplyConfig {
    /// Reply to every sent message with a canned response
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Shortest reply delay in milliseconds
    #[serde(default = "default_reply_delay")]
    pub min_delay_ms: u64,

    /// Longest reply delay in milliseconds
    #[serde(default = "default_reply_delay")]
    pub max_delay_ms: u64,

    /// Canned responses, one is picked at random per reply
    #[serde(default = "default_responses")]
    pub responses: Vec<String>,
}

// Default value functions
fn default_false() -> bool {
    false
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("chat-engine")
}

fn default_retry_initial_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_reply_delay() -> u64 {
    1000
}

fn default_responses() -> Vec<String> {
    [
        "Thanks for your message!",
        "That sounds great!",
        "I agree with you.",
        "Let me think about it.",
        "Sure, no problem!",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
        }
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            mark_read_on_send: default_false(),
            seed_demo_data: default_false(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

impl PersistenceConfig {
    /// Get the first retry delay as Duration
    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    /// Get the retry delay cap as Duration
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for AutoReplyConfig {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            min_delay_ms: default_reply_delay(),
            max_delay_ms: default_reply_delay(),
            responses: default_responses(),
        }
    }
}

impl AutoReplyConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            behavior: BehaviorConfig::default(),
            persistence: PersistenceConfig::default(),
            auto_reply: AutoReplyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("chat-engine")
    }

    /// Default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join(CONFIG_FILE_NAME)
    }

    /// Load configuration from the default path, creating it if not found
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from `path`, creating a default file if it does not exist
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ChatError::configuration(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let config: EngineConfig = toml::from_str(&contents).map_err(|e| {
                ChatError::configuration(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            config.validate()?;
            tracing::info!("Loaded engine configuration from {}", path.display());
            Ok(config)
        } else {
            let config = EngineConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path())
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ChatError::configuration(format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| {
            ChatError::configuration(format!("Failed to serialize config: {}", e))
        })?;
        fs::write(path, contents).map_err(|e| {
            ChatError::configuration(format!("Failed to write {}: {}", path.display(), e))
        })?;

        tracing::debug!("Saved engine configuration to {}", path.display());
        Ok(())
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_message_length == 0 {
            return Err(ChatError::configuration(
                "limits.max_message_length must be greater than zero",
            ));
        }
        if self.persistence.retry_initial_delay_ms > self.persistence.retry_max_delay_ms {
            return Err(ChatError::configuration(
                "persistence.retry_initial_delay_ms exceeds retry_max_delay_ms",
            ));
        }
        if self.auto_reply.min_delay_ms > self.auto_reply.max_delay_ms {
            return Err(ChatError::configuration(
                "auto_reply.min_delay_ms exceeds max_delay_ms",
            ));
        }
        if self.auto_reply.enabled
            && self
                .auto_reply
                .responses
                .iter()
                .all(|r| r.trim().is_empty())
        {
            return Err(ChatError::configuration(
                "auto_reply is enabled but has no responses",
            ));
        }
        Ok(())
    }

    /// Path of the state file inside the configured state directory
    pub fn state_file_path(&self) -> PathBuf {
        self.persistence
            .state_dir
            .join(crate::persistence::STATE_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_message_length, 1000);
        assert!(!config.behavior.mark_read_on_send);
        assert!(!config.behavior.seed_demo_data);
        assert!(!config.auto_reply.enabled);
        assert_eq!(config.auto_reply.responses.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = EngineConfig::default();
        config.behavior.mark_read_on_send = true;
        config.auto_reply.max_delay_ms = 2500;

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let parsed: EngineConfig = toml::from_str(
            r#"
            [behavior]
            seed_demo_data = true

            [auto_reply]
            enabled = true
            "#,
        )
        .unwrap();

        assert!(parsed.behavior.seed_demo_data);
        assert!(!parsed.behavior.mark_read_on_send);
        assert_eq!(parsed.limits.max_message_length, 1000);
        assert_eq!(parsed.persistence.retry_max_attempts, 5);
        assert_eq!(parsed.auto_reply.min_delay(), Duration::from_secs(1));
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.limits.max_message_length = 0;
        assert!(matches!(config.validate(), Err(ChatError::Configuration(_))));

        let mut config = EngineConfig::default();
        config.auto_reply.min_delay_ms = 5000;
        config.auto_reply.max_delay_ms = 100;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.auto_reply.enabled = true;
        config.auto_reply.responses = vec!["  ".to_string()];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.persistence.retry_initial_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_default_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/engine.toml");

        let config = EngineConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, EngineConfig::default());

        let reloaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("engine.toml");
        fs::write(&path, "[limits]\nmax_message_length = 0\n").unwrap();
        assert!(EngineConfig::load_from(&path).is_err());

        fs::write(&path, "not toml at all [").unwrap();
        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(ChatError::Configuration(_))
        ));
    }

    #[test]
    fn test_state_file_path() {
        let mut config = EngineConfig::default();
        config.persistence.state_dir = PathBuf::from("/tmp/chat");
        assert_eq!(
            config.state_file_path(),
            PathBuf::from("/tmp/chat/chat_state.json")
        );
    }
}
