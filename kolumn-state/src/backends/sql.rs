//! SQL table backend (SQLite via sqlx)
//!
//! States are rows of one table keyed by name, with the document stored as
//! JSON text next to its serial and lineage. Locks are rows of a second
//! table keyed by state name, so the primary key enforces a single holder.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::backend::{
    BackendCapabilities, BackendConfig, BackendError, BackendResult, StateBackend,
    validate_state_name,
};
use crate::lock::LockInfo;
use crate::state::StateDocument;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// SQL table backend
#[derive(Debug, Clone)]
pub struct SqlBackend {
    pool: SqlitePool,
    table: String,
    lock_table: String,
}

impl SqlBackend {
    pub const DEFAULT_TABLE: &'static str = "kolumn_states";
    pub const DEFAULT_LOCK_TABLE: &'static str = "kolumn_locks";
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

    /// Create a SqlBackend from configuration
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let url = config.require_string("url")?;
        let table = config.get_string("table").unwrap_or(Self::DEFAULT_TABLE);
        let lock_table = config
            .get_string("lock_table")
            .unwrap_or(Self::DEFAULT_LOCK_TABLE);
        let max_connections = match config.attributes.get("max_connections") {
            None => Self::DEFAULT_MAX_CONNECTIONS,
            Some(_) => config
                .get_u64("max_connections")
                .filter(|n| *n > 0)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    BackendError::configuration("max_connections must be a positive integer")
                })?,
        };

        Self::connect(url, table, lock_table, max_connections).await
    }

    /// Open a pool on `url` and create the tables if needed
    pub async fn connect(
        url: &str,
        table: &str,
        lock_table: &str,
        max_connections: u32,
    ) -> BackendResult<Self> {
        validate_identifier(table)?;
        validate_identifier(lock_table)?;
        if table == lock_table {
            return Err(BackendError::configuration(
                "table and lock_table must be different",
            ));
        }

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| BackendError::configuration(format!("invalid SQL url {}: {}", url, e)))?
            .create_if_missing(true);

        // Every connection to an in-memory database sees its own database,
        // so such pools are pinned to one long-lived connection.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(ACQUIRE_TIMEOUT);
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(max_connections)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| BackendError::unavailable("sql", "connect", e))?;

        let backend = Self {
            pool,
            table: table.to_string(),
            lock_table: lock_table.to_string(),
        };
        backend.create_tables().await?;
        log::debug!("Connected SQL backend (tables {}, {})", table, lock_table);
        Ok(backend)
    }

    async fn create_tables(&self) -> BackendResult<()> {
        let states = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                serial INTEGER NOT NULL,
                lineage TEXT NOT NULL,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            self.table
        );
        let locks = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                lock_id TEXT NOT NULL,
                info TEXT NOT NULL
            )",
            self.lock_table
        );

        for statement in [states, locks] {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| BackendError::unavailable("sql", "create tables", e))?;
        }
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn lock_table(&self) -> &str {
        &self.lock_table
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass
fn validate_identifier(name: &str) -> BackendResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(BackendError::configuration(format!(
            "invalid SQL table name '{}'",
            name
        )))
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl StateBackend for SqlBackend {
    fn backend_type(&self) -> &'static str {
        "sql"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            distributed_locking: true,
            atomic_writes: true,
        }
    }

    async fn get(&self, name: &str) -> BackendResult<StateDocument> {
        let query = format!("SELECT document FROM {} WHERE name = ?", self.table);
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::unavailable("sql", "get", e))?
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;

        let document: String = row
            .try_get("document")
            .map_err(|e| BackendError::unavailable("sql", "get", e))?;

        serde_json::from_str(&document).map_err(|e| {
            BackendError::Serialization(format!("Failed to parse state {}: {}", name, e))
        })
    }

    async fn put(&self, name: &str, state: &StateDocument) -> BackendResult<()> {
        validate_state_name(name)?;
        let document = serde_json::to_string(state).map_err(|e| {
            BackendError::Serialization(format!("Failed to serialize state: {}", e))
        })?;
        let serial = i64::try_from(state.serial)
            .map_err(|_| BackendError::validation("serial does not fit in a SQL integer"))?;
        let now = Utc::now().to_rfc3339();

        let query = format!(
            "INSERT INTO {} (name, serial, lineage, document, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                serial = excluded.serial,
                lineage = excluded.lineage,
                document = excluded.document,
                updated_at = excluded.updated_at",
            self.table
        );

        sqlx::query(&query)
            .bind(name)
            .bind(serial)
            .bind(&state.lineage)
            .bind(document)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::unavailable("sql", "put", e))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> BackendResult<()> {
        let query = format!("DELETE FROM {} WHERE name = ?", self.table);
        let result = sqlx::query(&query)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::unavailable("sql", "delete", e))?;

        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn list(&self) -> BackendResult<Vec<String>> {
        let query = format!("SELECT name FROM {} ORDER BY name", self.table);
        sqlx::query_scalar::<_, String>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::unavailable("sql", "list", e))
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<()> {
        let encoded = serde_json::to_string(info)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        let query = format!(
            "INSERT INTO {} (name, lock_id, info) VALUES (?, ?, ?)",
            self.lock_table
        );
        let result = sqlx::query(&query)
            .bind(&info.state_name)
            .bind(&info.id)
            .bind(encoded)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                let existing = self.current_lock(&info.state_name).await?;
                Err(match existing {
                    Some(existing) => BackendError::locked(&existing),
                    None => BackendError::Locked {
                        name: info.state_name.clone(),
                        lock_id: "unknown".to_string(),
                        who: "unknown".to_string(),
                        operation: "unknown".to_string(),
                    },
                })
            }
            Err(e) => Err(BackendError::unavailable("sql", "lock", e)),
        }
    }

    async fn unlock(&self, name: &str, lock_id: &str) -> BackendResult<()> {
        let query = format!("SELECT lock_id FROM {} WHERE name = ?", self.lock_table);
        let held: Option<String> = sqlx::query_scalar(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::unavailable("sql", "unlock", e))?;

        match held {
            None => {
                log::debug!("Lock on {} already released", name);
                Ok(())
            }
            Some(held) if held != lock_id => Err(BackendError::LockMismatch {
                name: name.to_string(),
                expected: lock_id.to_string(),
                actual: held,
            }),
            Some(_) => {
                let query = format!(
                    "DELETE FROM {} WHERE name = ? AND lock_id = ?",
                    self.lock_table
                );
                sqlx::query(&query)
                    .bind(name)
                    .bind(lock_id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| BackendError::unavailable("sql", "unlock", e))?;
                Ok(())
            }
        }
    }

    async fn current_lock(&self, name: &str) -> BackendResult<Option<LockInfo>> {
        let query = format!("SELECT info FROM {} WHERE name = ?", self.lock_table);
        let info: Option<String> = sqlx::query_scalar(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::unavailable("sql", "current lock", e))?;

        info.map(|info| {
            serde_json::from_str(&info).map_err(|e| {
                BackendError::Serialization(format!("Failed to parse lock for {}: {}", name, e))
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolumn_core::resource::Resource;
    use tempfile::tempdir;

    async fn memory_backend() -> SqlBackend {
        SqlBackend::connect(
            "sqlite::memory:",
            SqlBackend::DEFAULT_TABLE,
            SqlBackend::DEFAULT_LOCK_TABLE,
            4,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_sql_backend_round_trip() {
        let backend = memory_backend().await;
        assert!(matches!(
            backend.get("prod").await,
            Err(BackendError::NotFound(_))
        ));

        let mut state = StateDocument::new();
        state.serial = 7;
        state.upsert_resource(Resource::new("pg", "table", "users"));
        backend.put("prod", &state).await.unwrap();
        assert_eq!(backend.get("prod").await.unwrap(), state);

        state.serial = 8;
        backend.put("prod", &state).await.unwrap();
        assert_eq!(backend.get("prod").await.unwrap().serial, 8);

        backend.put("dev", &StateDocument::new()).await.unwrap();
        assert_eq!(backend.list().await.unwrap(), vec!["dev", "prod"]);

        backend.delete("dev").await.unwrap();
        assert!(matches!(
            backend.delete("dev").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sql_backend_locking() {
        let backend = memory_backend().await;
        let lock = LockInfo::new("prod", "apply");
        backend.lock(&lock).await.unwrap();

        match backend.lock(&LockInfo::new("prod", "plan")).await {
            Err(BackendError::Locked { lock_id, operation, .. }) => {
                assert_eq!(lock_id, lock.id);
                assert_eq!(operation, "apply");
            }
            other => panic!("Expected Locked error, got {:?}", other),
        }

        assert!(matches!(
            backend.unlock("prod", "other").await,
            Err(BackendError::LockMismatch { .. })
        ));
        assert_eq!(backend.current_lock("prod").await.unwrap(), Some(lock.clone()));

        backend.unlock("prod", &lock.id).await.unwrap();
        // Releasing an already-released lock is tolerated
        backend.unlock("prod", &lock.id).await.unwrap();
        assert!(backend.current_lock("prod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sql_backend_file_database_persists() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());

        let backend = SqlBackend::connect(&url, "states", "locks", 2).await.unwrap();
        backend.put("prod", &StateDocument::new()).await.unwrap();
        drop(backend);

        let reopened = SqlBackend::connect(&url, "states", "locks", 2).await.unwrap();
        assert_eq!(reopened.list().await.unwrap(), vec!["prod"]);
    }

    #[tokio::test]
    async fn test_sql_backend_config_errors() {
        let missing_url = SqlBackend::from_config(&BackendConfig::new("sql")).await;
        assert!(matches!(missing_url, Err(BackendError::Configuration(_))));

        let bad_table = BackendConfig::new("sql")
            .with("url", "sqlite::memory:")
            .with("table", "states; DROP TABLE x");
        assert!(matches!(
            SqlBackend::from_config(&bad_table).await,
            Err(BackendError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("kolumn_states").is_ok());
        assert!(validate_identifier("_t1").is_ok());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a-b").is_err());
    }
}
