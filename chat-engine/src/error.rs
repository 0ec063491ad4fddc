//! Error handling for the chat engine
//!
//! This module provides a single error type for all engine operations.
//! Errors from the underlying libraries are converted using `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! ### Basic Usage
//!
//! ```rust
//! use chat_engine::Result;
//!
//! fn parse_state(data: &[u8]) -> Result<serde_json::Value> {
//!     // serde_json errors convert automatically
//!     let value: serde_json::Value = serde_json::from_slice(data)?;
//!     Ok(value)
//! }
//! ```
//!
//! ### Error Matching
//!
//! User-triggered input problems come back as typed failures the UI can check:
//!
//! ```rust
//! use chat_engine::ChatError;
//!
//! fn describe(result: Result<String, ChatError>) -> String {
//!     match result {
//!         Ok(id) => format!("sent {}", id),
//!         Err(e) if e.is_validation() => "nothing to send".to_string(),
//!         Err(ChatError::ContactNotFound(id)) => format!("no contact {}", id),
//!         Err(e) => e.user_message(),
//!     }
//! }
//! ```
//!
//! ## Error Categories
//!
//! ### Validation Errors
//! Bad input such as empty or oversized text, or empty ids. Recovered locally.
//!
//! ### Not Found Errors
//! An operation referenced a contact, chat or message the store does not hold.
//!
//! ### Persistence Errors
//! Storage failures. These are logged and retried and never roll back in-memory state.
//!
//! ### Configuration Errors
//! Unreadable or inconsistent engine configuration.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors that can occur during engine operations
///
/// # Examples
///
/// ```rust
/// use chat_engine::ChatError;
///
/// let error = ChatError::ContactNotFound("c1".to_string());
/// assert_eq!(error.to_string(), "Contact not found: c1");
///
/// let error = ChatError::Validation("message text is empty".to_string());
/// assert_eq!(error.to_string(), "Validation error: message text is empty");
/// ```
#[derive(Error, Debug)]
pub enum ChatError {
    /// Invalid user input (empty text, text too long, empty id or name)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Contact not known to the store
    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    /// Chat not known to the store
    #[error("Chat not found: {0}")]
    ChatNotFound(String),

    /// Message not known to the store
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Persistence adapter failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O error
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored state was written by a newer format version
    #[error("Unsupported state version: {0}")]
    UnsupportedVersion(u32),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ChatError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        ChatError::Persistence(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        ChatError::Configuration(msg.into())
    }

    /// Convert an I/O error into a persistence error with context
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chat_engine::ChatError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::PermissionDenied, "read-only");
    /// let error = ChatError::from_io_error(io_error, "writing state file");
    /// assert!(matches!(error, ChatError::Persistence(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        ChatError::Persistence(format!("{}: {}", context, error))
    }

    /// Whether the error came from bad caller input
    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::Validation(_))
    }

    /// Whether the error refers to a missing contact, chat or message
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChatError::ContactNotFound(_)
                | ChatError::ChatNotFound(_)
                | ChatError::MessageNotFound(_)
        )
    }

    /// Check if this error is transient and the operation can be retried
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chat_engine::ChatError;
    ///
    /// assert!(ChatError::persistence("disk full").is_recoverable());
    /// assert!(!ChatError::validation("empty").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChatError::Persistence(_) | ChatError::Io(_))
    }

    /// Get a user-friendly error message suitable for display in UI
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Validation(msg) => format!("Cannot send: {}.", msg),
            ChatError::ContactNotFound(id) => {
                format!("Contact '{}' not found. It may have been removed.", id)
            }
            ChatError::ChatNotFound(id) => format!("Conversation '{}' not found.", id),
            ChatError::MessageNotFound(id) => format!("Message '{}' not found.", id),
            ChatError::Persistence(msg) => {
                format!("Could not save conversations: {}. Will retry.", msg)
            }
            ChatError::Io(e) => format!("I/O error: {}.", e),
            ChatError::Json(e) => format!("Stored data format error: {}.", e),
            ChatError::UnsupportedVersion(v) => format!(
                "Stored conversations use format version {}. Update the application.",
                v
            ),
            ChatError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
        }
    }
}
