//! Local file backend for state storage
//!
//! Each state lives in `<dir>/<name>.klstate` as pretty-printed JSON. Writes
//! go to a temporary file that is renamed over the target. While a state is
//! locked a `<name>.klstate.lock` file holds the lock info. Every overwrite
//! first copies the previous document into `<dir>/backups/`, keeping at most
//! `backup_count` copies per state.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};

use crate::backend::{
    BackendCapabilities, BackendConfig, BackendError, BackendResult, StateBackend,
    validate_state_name,
};
use crate::lock::LockInfo;
use crate::state::StateDocument;

const STATE_EXTENSION: &str = ".klstate";
const LOCK_EXTENSION: &str = ".klstate.lock";
const BACKUP_DIR: &str = "backups";
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6f";

/// Local file backend for development and single-host use
#[derive(Debug, Clone)]
pub struct LocalBackend {
    dir: PathBuf,
    backup_count: usize,
}

impl LocalBackend {
    /// Default state directory
    pub const DEFAULT_DIR: &'static str = ".kolumn";
    /// Default number of backups kept per state
    pub const DEFAULT_BACKUP_COUNT: usize = 10;

    /// Create a LocalBackend storing states under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            backup_count: Self::DEFAULT_BACKUP_COUNT,
        }
    }

    pub fn with_backup_count(mut self, backup_count: usize) -> Self {
        self.backup_count = backup_count;
        self
    }

    /// Create a LocalBackend from configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let dir = config.get_string("path").unwrap_or(Self::DEFAULT_DIR);
        if dir.trim().is_empty() {
            return Err(BackendError::configuration("local backend path is empty"));
        }

        let backup_count = match config.attributes.get("backup_count") {
            None => Self::DEFAULT_BACKUP_COUNT,
            Some(_) => config.get_u64("backup_count").ok_or_else(|| {
                BackendError::configuration("backup_count must be a non-negative integer")
            })? as usize,
        };

        Ok(Self::new(dir).with_backup_count(backup_count))
    }

    /// Directory holding the state files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backup_count(&self) -> usize {
        self.backup_count
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, STATE_EXTENSION))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, LOCK_EXTENSION))
    }

    fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    /// Backup files for `name`, oldest first
    pub fn backups(&self, name: &str) -> BackendResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(self.backup_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::unavailable("local", "list backups", e)),
        };

        let prefix = format!("{}.", name);
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackendError::unavailable("local", "list backups", e))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let timestamp = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(STATE_EXTENSION));
            // "prod.x.<ts>.klstate" belongs to "prod.x", not "prod"
            if timestamp.is_some_and(|ts| {
                NaiveDateTime::parse_from_str(ts, BACKUP_TIMESTAMP_FORMAT).is_ok()
            }) {
                backups.push(entry.path());
            }
        }
        backups.sort();
        Ok(backups)
    }

    fn backup_existing(&self, name: &str) -> BackendResult<()> {
        let current = self.state_path(name);
        if self.backup_count == 0 || !current.exists() {
            return Ok(());
        }

        let backup_dir = self.backup_dir();
        fs::create_dir_all(&backup_dir)
            .map_err(|e| BackendError::unavailable("local", "backup", e))?;

        let timestamp = Utc::now().format(BACKUP_TIMESTAMP_FORMAT);
        let backup = backup_dir.join(format!("{}.{}{}", name, timestamp, STATE_EXTENSION));
        fs::copy(&current, &backup).map_err(|e| BackendError::unavailable("local", "backup", e))?;

        let backups = self.backups(name)?;
        let excess = backups.len().saturating_sub(self.backup_count);
        for old in &backups[..excess] {
            log::debug!("Pruning backup {}", old.display());
            fs::remove_file(old).map_err(|e| BackendError::unavailable("local", "prune", e))?;
        }
        Ok(())
    }

    fn read_lock(&self, name: &str) -> BackendResult<Option<LockInfo>> {
        let content = match fs::read_to_string(self.lock_path(name)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::unavailable("local", "read lock", e)),
        };
        let lock = serde_json::from_str(&content).map_err(|e| {
            BackendError::Serialization(format!("Failed to parse lock file for {}: {}", name, e))
        })?;
        Ok(Some(lock))
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIR)
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            distributed_locking: false,
            atomic_writes: true,
        }
    }

    async fn get(&self, name: &str) -> BackendResult<StateDocument> {
        validate_state_name(name)?;
        let content = match fs::read_to_string(self.state_path(name)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackendError::NotFound(name.to_string()));
            }
            Err(e) => return Err(BackendError::unavailable("local", "get", e)),
        };

        serde_json::from_str(&content).map_err(|e| {
            BackendError::Serialization(format!("Failed to parse state file {}: {}", name, e))
        })
    }

    async fn put(&self, name: &str, state: &StateDocument) -> BackendResult<()> {
        validate_state_name(name)?;
        let content = serde_json::to_string_pretty(state).map_err(|e| {
            BackendError::Serialization(format!("Failed to serialize state: {}", e))
        })?;

        fs::create_dir_all(&self.dir).map_err(|e| BackendError::unavailable("local", "put", e))?;
        self.backup_existing(name)?;

        let target = self.state_path(name);
        let temp = self.dir.join(format!("{}{}.tmp", name, STATE_EXTENSION));
        fs::write(&temp, content).map_err(|e| BackendError::unavailable("local", "put", e))?;
        fs::rename(&temp, &target).map_err(|e| BackendError::unavailable("local", "put", e))?;

        log::debug!("Wrote state {} to {}", name, target.display());
        Ok(())
    }

    async fn delete(&self, name: &str) -> BackendResult<()> {
        validate_state_name(name)?;
        match fs::remove_file(self.state_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BackendError::NotFound(name.to_string()))
            }
            Err(e) => Err(BackendError::unavailable("local", "delete", e)),
        }
    }

    async fn list(&self) -> BackendResult<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::unavailable("local", "list", e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackendError::unavailable("local", "list", e))?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(name) = file_name
                .to_str()
                .and_then(|f| f.strip_suffix(STATE_EXTENSION))
                && validate_state_name(name).is_ok()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<()> {
        validate_state_name(&info.state_name)?;
        fs::create_dir_all(&self.dir).map_err(|e| BackendError::unavailable("local", "lock", e))?;

        let content = serde_json::to_string_pretty(info)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        let lock_path = self.lock_path(&info.state_name);
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(match self.read_lock(&info.state_name) {
                    Ok(Some(existing)) => BackendError::locked(&existing),
                    _ => BackendError::Locked {
                        name: info.state_name.clone(),
                        lock_id: "unknown".to_string(),
                        who: "unknown".to_string(),
                        operation: "unknown".to_string(),
                    },
                });
            }
            Err(e) => return Err(BackendError::unavailable("local", "lock", e)),
        };

        fill_lock_file(&lock_path, file, content.as_bytes())
    }

    async fn unlock(&self, name: &str, lock_id: &str) -> BackendResult<()> {
        validate_state_name(name)?;
        let existing = self
            .read_lock(name)?
            .ok_or_else(|| BackendError::LockNotFound(name.to_string()))?;

        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                name: name.to_string(),
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        fs::remove_file(self.lock_path(name))
            .map_err(|e| BackendError::unavailable("local", "unlock", e))
    }

    async fn current_lock(&self, name: &str) -> BackendResult<Option<LockInfo>> {
        validate_state_name(name)?;
        self.read_lock(name)
    }
}

/// Write lock info into a freshly created lock file, removing the file if
/// the write fails so the state is not left locked by an unreadable lock.
fn fill_lock_file(path: &Path, mut file: impl Write, content: &[u8]) -> BackendResult<()> {
    if let Err(e) = file.write_all(content).and_then(|_| file.flush()) {
        drop(file);
        if let Err(remove_err) = fs::remove_file(path) {
            log::warn!("Failed to remove partial lock file {}: {}", path.display(), remove_err);
        }
        return Err(BackendError::unavailable("local", "lock", e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolumn_core::resource::Resource;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_backend_read_write() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        assert!(matches!(
            backend.get("prod").await,
            Err(BackendError::NotFound(_))
        ));

        let mut state = StateDocument::new();
        state.serial = 1;
        state.upsert_resource(Resource::new("pg", "table", "users"));
        backend.put("prod", &state).await.unwrap();

        assert!(dir.path().join("prod.klstate").exists());
        let read_state = backend.get("prod").await.unwrap();
        assert_eq!(read_state, state);
    }

    #[tokio::test]
    async fn test_local_backend_list_and_delete() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        backend.put("staging", &StateDocument::new()).await.unwrap();
        backend.put("prod", &StateDocument::new()).await.unwrap();
        backend.lock(&LockInfo::new("prod", "apply")).await.unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(backend.list().await.unwrap(), vec!["prod", "staging"]);

        backend.delete("staging").await.unwrap();
        assert_eq!(backend.list().await.unwrap(), vec!["prod"]);
        assert!(matches!(
            backend.delete("staging").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_backend_locking() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        let lock = LockInfo::new("prod", "apply");
        backend.lock(&lock).await.unwrap();

        // Try to acquire again - should fail
        match backend.lock(&LockInfo::new("prod", "plan")).await {
            Err(BackendError::Locked { lock_id, .. }) => assert_eq!(lock_id, lock.id),
            other => panic!("Expected Locked error, got {:?}", other),
        }

        assert!(matches!(
            backend.unlock("prod", "wrong-id").await,
            Err(BackendError::LockMismatch { .. })
        ));
        assert_eq!(backend.current_lock("prod").await.unwrap(), Some(lock.clone()));

        backend.unlock("prod", &lock.id).await.unwrap();
        assert!(backend.current_lock("prod").await.unwrap().is_none());

        // Now can acquire again
        let lock2 = LockInfo::new("prod", "destroy");
        backend.lock(&lock2).await.unwrap();
        backend.unlock("prod", &lock2.id).await.unwrap();
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_lock_write_releases_the_lock_file() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let lock_path = backend.lock_path("prod");
        fs::write(&lock_path, b"").unwrap();

        let result = fill_lock_file(&lock_path, BrokenWriter, b"{}");
        assert!(matches!(result, Err(BackendError::Unavailable { .. })));
        assert!(!lock_path.exists());

        let lock = LockInfo::new("prod", "apply");
        backend.lock(&lock).await.unwrap();
        assert_eq!(backend.current_lock("prod").await.unwrap(), Some(lock));
    }

    #[tokio::test]
    async fn test_local_backend_prunes_backups() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).with_backup_count(2);

        let mut state = StateDocument::new();
        for serial in 1..=4 {
            state.serial = serial;
            backend.put("prod", &state).await.unwrap();
        }
        backend.put("prod.eu", &state).await.unwrap();
        backend.put("prod.eu", &state).await.unwrap();

        let backups = backend.backups("prod").unwrap();
        assert_eq!(backups.len(), 2);

        // Oldest backups were removed: the remaining ones hold serials 2 and 3
        let serials: Vec<u64> = backups
            .iter()
            .map(|path| {
                let content = fs::read_to_string(path).unwrap();
                serde_json::from_str::<StateDocument>(&content).unwrap().serial
            })
            .collect();
        assert_eq!(serials, vec![2, 3]);
        assert_eq!(backend.backups("prod.eu").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_backend_rejects_unsafe_names() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        assert!(matches!(
            backend.put("../escape", &StateDocument::new()).await,
            Err(BackendError::Validation(_))
        ));
    }

    #[test]
    fn test_local_backend_from_config() {
        let backend = LocalBackend::from_config(&BackendConfig::new("local")).unwrap();
        assert_eq!(backend.dir(), Path::new(".kolumn"));
        assert_eq!(backend.backup_count(), 10);

        let config = BackendConfig::new("local")
            .with("path", "/var/lib/kolumn")
            .with("backup_count", "3");
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.dir(), Path::new("/var/lib/kolumn"));
        assert_eq!(backend.backup_count(), 3);

        let config = BackendConfig::new("local").with("backup_count", "many");
        assert!(matches!(
            LocalBackend::from_config(&config),
            Err(BackendError::Configuration(_))
        ));
    }
}
