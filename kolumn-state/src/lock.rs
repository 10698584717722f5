//! Lock information for state backend locking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Information about a state lock
///
/// Locks are advisory and never expire: a lock stays in place until its
/// holder releases it with the matching ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// Name of the locked state
    pub state_name: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// The operation being performed (e.g., "apply", "migrate")
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the lock was created
    pub created: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock for an operation on a state
    pub fn new(state_name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state_name: state_name.into(),
            who: get_lock_owner(),
            operation: operation.into(),
            reason: None,
            created: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_who(mut self, who: impl Into<String>) -> Self {
        self.who = who.into();
        self
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_info_new() {
        let lock = LockInfo::new("prod", "apply");
        assert_eq!(lock.state_name, "prod");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.id.is_empty());
        assert!(lock.reason.is_none());
    }

    #[test]
    fn test_lock_ids_are_unique() {
        let a = LockInfo::new("prod", "apply");
        let b = LockInfo::new("prod", "apply");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_lock_owner_format() {
        let who = get_lock_owner();
        assert!(who.contains('@'));
    }

    #[test]
    fn test_lock_info_serialization() {
        let lock = LockInfo::new("prod", "migrate")
            .with_reason("upgrade to v2")
            .with_who("ci@runner");
        let json = serde_json::to_string_pretty(&lock).unwrap();
        let deserialized: LockInfo = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, lock);
        assert_eq!(deserialized.who, "ci@runner");
        assert_eq!(deserialized.reason.as_deref(), Some("upgrade to v2"));
    }
}
