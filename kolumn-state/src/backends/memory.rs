//! In-memory backend
//!
//! Keeps documents and locks in process memory. Every read and write clones,
//! so callers never share a document with the backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{
    BackendCapabilities, BackendError, BackendResult, StateBackend, validate_state_name,
};
use crate::lock::LockInfo;
use crate::state::StateDocument;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    states: Mutex<BTreeMap<String, StateDocument>>,
    locks: Mutex<BTreeMap<String, LockInfo>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            distributed_locking: false,
            atomic_writes: true,
        }
    }

    async fn get(&self, name: &str) -> BackendResult<StateDocument> {
        self.states
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn put(&self, name: &str, state: &StateDocument) -> BackendResult<()> {
        validate_state_name(name)?;
        self.states.lock().insert(name.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> BackendResult<()> {
        self.states
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn list(&self) -> BackendResult<Vec<String>> {
        Ok(self.states.lock().keys().cloned().collect())
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<()> {
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&info.state_name) {
            return Err(BackendError::locked(existing));
        }
        locks.insert(info.state_name.clone(), info.clone());
        Ok(())
    }

    async fn unlock(&self, name: &str, lock_id: &str) -> BackendResult<()> {
        let mut locks = self.locks.lock();
        match locks.get(name) {
            None => Err(BackendError::LockNotFound(name.to_string())),
            Some(existing) if existing.id != lock_id => Err(BackendError::LockMismatch {
                name: name.to_string(),
                expected: lock_id.to_string(),
                actual: existing.id.clone(),
            }),
            Some(_) => {
                locks.remove(name);
                Ok(())
            }
        }
    }

    async fn current_lock(&self, name: &str) -> BackendResult<Option<LockInfo>> {
        Ok(self.locks.lock().get(name).cloned())
    }
}
