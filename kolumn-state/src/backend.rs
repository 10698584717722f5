//! State backend trait and error types

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::StateDocument;

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// No state stored under this name
    #[error("State not found: {0}")]
    NotFound(String),

    /// The state is locked by another process
    #[error("State {name} is locked by {who} (lock ID: {lock_id}, operation: {operation})")]
    Locked {
        name: String,
        lock_id: String,
        who: String,
        operation: String,
    },

    /// The lock was not found (for release operations)
    #[error("No lock held on state {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch on state {name}: expected {expected}, got {actual}")]
    LockMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// State document is malformed
    #[error("Invalid state: {0}")]
    Validation(String),

    /// State lineage mismatch (prevents accidental cross-state overwrites)
    #[error("State lineage mismatch on {name}: expected {expected}, got {actual}")]
    LineageMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// The write was based on an outdated copy of the state
    #[error(
        "Conflicting write to state {name}: stored serial is {stored}, write was based on serial {attempted}"
    )]
    Conflict {
        name: String,
        stored: u64,
        attempted: u64,
    },

    /// Network or I/O failure, retryable at the caller's discretion
    #[error("{backend} backend unavailable during {operation}: {message}")]
    Unavailable {
        backend: String,
        operation: String,
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A state migration failed; the stored state is unchanged
    #[error("Migration of state {name} from v{from} to v{to} failed: {reason}")]
    Migration {
        name: String,
        from: u32,
        to: u32,
        reason: String,
    },
}

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            name: lock.state_name.clone(),
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Wrap an I/O or network failure with the backend and operation
    pub fn unavailable(
        backend: &str,
        operation: &str,
        error: impl std::fmt::Display,
    ) -> Self {
        Self::Unavailable {
            backend: backend.to_string(),
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// What a backend can guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// `lock`/`unlock` provide real mutual exclusion across processes
    pub distributed_locking: bool,
    /// Readers never observe a partially written document
    pub atomic_writes: bool,
}

/// Trait for state storage backends
///
/// This trait defines the interface for storing and retrieving named state
/// documents, as well as managing advisory locks for concurrent access
/// control. Lock acquisition never waits: a held lock fails immediately.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short backend name (e.g., "local", "s3")
    fn backend_type(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Read a state document. Fails with `NotFound` if none exists.
    async fn get(&self, name: &str) -> BackendResult<StateDocument>;

    /// Replace the whole state document stored under `name`
    async fn put(&self, name: &str, state: &StateDocument) -> BackendResult<()>;

    /// Delete a state document. Fails with `NotFound` if none exists.
    async fn delete(&self, name: &str) -> BackendResult<()>;

    /// Names of all stored states, sorted
    async fn list(&self) -> BackendResult<Vec<String>>;

    /// Acquire the lock described by `info` on `info.state_name`
    async fn lock(&self, info: &LockInfo) -> BackendResult<()>;

    /// Release the lock on `name` if its ID matches `lock_id`
    async fn unlock(&self, name: &str, lock_id: &str) -> BackendResult<()>;

    /// The lock currently held on `name`, if any
    async fn current_lock(&self, name: &str) -> BackendResult<Option<LockInfo>>;
}

/// Check that a state name is safe to use as a file name or object key
pub fn validate_state_name(name: &str) -> BackendResult<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if name.is_empty() || !valid_chars || name.starts_with('.') || name.contains("..") {
        return Err(BackendError::validation(format!(
            "invalid state name '{}': use letters, digits, '-', '_' and single dots",
            name
        )));
    }
    Ok(())
}

/// Configuration for a state backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend type (e.g., "memory", "local", "sql", "s3")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, serde_json::Value>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(serde_json::Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get a required string attribute
    pub fn require_string(&self, key: &str) -> BackendResult<&str> {
        self.get_string(key).ok_or_else(|| {
            BackendError::configuration(format!(
                "{} backend requires attribute: {}",
                self.backend_type, key
            ))
        })
    }

    /// Get a boolean attribute value (`true`/`false` strings are accepted)
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key) {
            Some(serde_json::Value::Bool(b)) => Some(*b),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Get an unsigned integer attribute (numeric strings are accepted)
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.attributes.get(key) {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}
