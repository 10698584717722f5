//! State manager
//!
//! The manager is the entry point for reading and writing states. It adds
//! the checks a raw backend does not perform: document validation, lineage
//! protection, serial-based conflict detection, checksums, backups and
//! format migrations.

use std::collections::VecDeque;
use std::future::Future;

use chrono::Utc;
use parking_lot::Mutex;

use crate::backend::{
    BackendCapabilities, BackendError, BackendResult, StateBackend, validate_state_name,
};
use crate::lock::LockInfo;
use crate::migration::{MigrationRecord, MigrationRegistry, MigrationStatus};
use crate::state::StateDocument;

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// State manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Workspace recorded on states that do not name one
    pub workspace: String,
    /// Environment recorded on states that do not name one
    pub environment: String,
    /// Maximum number of migration log entries kept
    pub max_migration_log: usize,
    /// Reject writes based on an outdated serial
    pub enforce_serial: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workspace: "default".to_string(),
            environment: "default".to_string(),
            max_migration_log: 100,
            enforce_serial: true,
        }
    }
}

pub struct StateManager {
    backend: Box<dyn StateBackend>,
    config: ManagerConfig,
    migrations: MigrationRegistry,
    migration_log: Mutex<VecDeque<MigrationRecord>>,
}

impl StateManager {
    pub fn new(backend: Box<dyn StateBackend>, config: ManagerConfig) -> Self {
        Self {
            backend,
            config,
            migrations: MigrationRegistry::default(),
            migration_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Replace the built-in migration steps
    pub fn with_migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn backend(&self) -> &dyn StateBackend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    /// Read a state
    pub async fn get(&self, name: &str) -> BackendResult<StateDocument> {
        let state = self.backend.get(name).await?;
        let mismatched = state.verify_checksums()?;
        if !mismatched.is_empty() {
            log::warn!(
                "Checksum mismatch in state {} for: {}",
                name,
                mismatched.join(", ")
            );
        }
        Ok(state)
    }

    async fn get_existing(&self, name: &str) -> BackendResult<Option<StateDocument>> {
        match self.backend.get(name).await {
            Ok(state) => Ok(Some(state)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write a state and return the stored document
    ///
    /// `state.serial` must equal the stored serial (the copy was read from
    /// the latest version); the stored document gets the next serial.
    pub async fn put(&self, name: &str, mut state: StateDocument) -> BackendResult<StateDocument> {
        validate_state_name(name)?;
        state.validate()?;

        let now = Utc::now();
        match self.get_existing(name).await? {
            Some(stored) => {
                if stored.lineage != state.lineage {
                    return Err(BackendError::LineageMismatch {
                        name: name.to_string(),
                        expected: stored.lineage,
                        actual: state.lineage,
                    });
                }
                if self.config.enforce_serial && stored.serial != state.serial {
                    return Err(BackendError::Conflict {
                        name: name.to_string(),
                        stored: stored.serial,
                        attempted: state.serial,
                    });
                }
                state.serial = stored.serial.max(state.serial) + 1;
                state.created_at = stored.created_at.or(state.created_at);
            }
            None => {
                state.serial += 1;
            }
        }

        state.created_at.get_or_insert(now);
        state.updated_at = Some(now);
        if state.metadata.workspace.is_empty() {
            state.metadata.workspace = self.config.workspace.clone();
        }
        if state.metadata.environment.is_empty() {
            state.metadata.environment = self.config.environment.clone();
        }
        state.metadata.tool_version = env!("CARGO_PKG_VERSION").to_string();
        state.refresh_checksums()?;

        self.backend.put(name, &state).await?;
        log::info!("Saved state {} (serial {})", name, state.serial);
        Ok(state)
    }

    pub async fn delete(&self, name: &str) -> BackendResult<()> {
        self.backend.delete(name).await?;
        log::info!("Deleted state {}", name);
        Ok(())
    }

    pub async fn list(&self) -> BackendResult<Vec<String>> {
        self.backend.list().await
    }

    /// Acquire the lock on a state. Fails immediately if it is held.
    pub async fn lock(
        &self,
        name: &str,
        operation: &str,
        reason: Option<&str>,
    ) -> BackendResult<LockInfo> {
        validate_state_name(name)?;
        let mut info = LockInfo::new(name, operation);
        if let Some(reason) = reason {
            info = info.with_reason(reason);
        }
        self.backend.lock(&info).await?;
        log::debug!("Locked state {} for {} ({})", name, operation, info.id);
        Ok(info)
    }

    pub async fn unlock(&self, lock: &LockInfo) -> BackendResult<()> {
        self.backend.unlock(&lock.state_name, &lock.id).await?;
        log::debug!("Unlocked state {} ({})", lock.state_name, lock.id);
        Ok(())
    }

    pub async fn current_lock(&self, name: &str) -> BackendResult<Option<LockInfo>> {
        self.backend.current_lock(name).await
    }

    /// Run `f` while holding the lock on `name`. The lock is released
    /// whether or not `f` succeeds.
    pub async fn with_lock<F, Fut, T, E>(&self, name: &str, operation: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BackendError>,
    {
        let lock = self.lock(name, operation, None).await?;
        let result = f().await;
        let released = self.unlock(&lock).await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), released) => {
                if let Err(unlock_err) = released {
                    log::warn!("Failed to release lock on {}: {}", name, unlock_err);
                }
                Err(e)
            }
        }
    }

    /// Serialize a state as pretty JSON
    pub async fn export(&self, name: &str) -> BackendResult<Vec<u8>> {
        let state = self.get(name).await?;
        serde_json::to_vec_pretty(&state)
            .map_err(|e| BackendError::Serialization(format!("Failed to export {}: {}", name, e)))
    }

    /// Store an exported document under `name`
    ///
    /// A new name keeps the document's lineage. An existing name keeps its
    /// own lineage and the import replaces its content.
    pub async fn import(&self, name: &str, bytes: &[u8]) -> BackendResult<StateDocument> {
        let mut state: StateDocument = serde_json::from_slice(bytes).map_err(|e| {
            BackendError::Serialization(format!("Failed to parse imported state: {}", e))
        })?;
        if state.version > StateDocument::CURRENT_VERSION {
            return Err(BackendError::validation(format!(
                "state version {} is newer than the supported version {}",
                state.version,
                StateDocument::CURRENT_VERSION
            )));
        }
        state.validate()?;

        if let Some(stored) = self.get_existing(name).await? {
            state.lineage = stored.lineage;
            state.serial = stored.serial;
        }
        self.put(name, state).await
    }

    /// Copy a state to `<name>.backup.<timestamp>` and return the backup name
    pub async fn backup(&self, name: &str) -> BackendResult<String> {
        let state = self.backend.get(name).await?;
        let base = format!("{}.backup.{}", name, Utc::now().format(BACKUP_TIMESTAMP_FORMAT));

        let mut backup = base.clone();
        let mut attempt = 1;
        while self.get_existing(&backup).await?.is_some() {
            backup = format!("{}-{}", base, attempt);
            attempt += 1;
        }

        self.backend.put(&backup, &state).await?;
        log::info!("Backed up state {} to {}", name, backup);
        Ok(backup)
    }

    /// Overwrite `target` with the content of `backup`
    pub async fn restore(&self, backup: &str, target: &str) -> BackendResult<StateDocument> {
        let mut state = self.backend.get(backup).await?;
        if let Some(stored) = self.get_existing(target).await? {
            state.lineage = stored.lineage;
            state.serial = stored.serial;
        }
        let restored = self.put(target, state).await?;
        log::info!("Restored state {} from {}", target, backup);
        Ok(restored)
    }

    /// Upgrade a state to `target_version` (default: the current version)
    ///
    /// A backup is taken first. If any step fails the stored state is left
    /// unchanged. Returns `None` if the state is already at the target.
    pub async fn migrate(
        &self,
        name: &str,
        target_version: Option<u32>,
    ) -> BackendResult<Option<MigrationRecord>> {
        let target = target_version.unwrap_or(StateDocument::CURRENT_VERSION);

        self.with_lock(name, "migrate", || async move {
            let state = self.get(name).await?;
            let from = state.version;
            if from == target {
                return Ok(None);
            }

            let backup = self.backup(name).await?;
            let mut migrated = state;
            let outcome = match self.migrations.apply(name, &mut migrated, target) {
                Ok(()) => self.put(name, migrated).await.map(|_| ()),
                Err(e) => Err(e),
            };

            let status = match &outcome {
                Ok(()) => MigrationStatus::Succeeded,
                Err(e) => MigrationStatus::Failed {
                    reason: e.to_string(),
                },
            };
            let record = MigrationRecord {
                state_name: name.to_string(),
                from_version: from,
                to_version: target,
                backup: Some(backup),
                status,
                at: Utc::now(),
            };
            self.record_migration(record.clone());

            outcome.map(|()| Some(record))
        })
        .await
    }

    fn record_migration(&self, record: MigrationRecord) {
        let mut log = self.migration_log.lock();
        log.push_back(record);
        while log.len() > self.config.max_migration_log {
            log.pop_front();
        }
    }

    /// Migration log, oldest first
    pub fn migration_log(&self) -> Vec<MigrationRecord> {
        self.migration_log.lock().iter().cloned().collect()
    }
}
