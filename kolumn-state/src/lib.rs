//! Kolumn State Management
//!
//! This crate stores Kolumn state documents in pluggable backends with
//! advisory locking, backups and format migrations.
//!
//! # Overview
//!
//! The state management system consists of:
//!
//! - **StateDocument**: resources, dependencies, providers and collections of one state
//! - **StateBackend**: a trait for storage backends (memory, local files, SQL, S3)
//! - **StateManager**: validation, lineage and serial checks, backups, migrations
//! - **CollectionManager**: named resource groups persisted inside a state
//! - **StateResolver**: applies drift resolutions to a state document
//! - **LockInfo**: information about state locks for concurrent access control
//!
//! # Example
//!
//! ```ignore
//! use kolumn_state::{BackendConfig, ManagerConfig, StateManager, create_backend};
//!
//! let config = BackendConfig::new("local").with("path", ".kolumn");
//! let manager = StateManager::new(create_backend(&config).await?, ManagerConfig::default());
//!
//! manager
//!     .with_lock("prod", "apply", || async {
//!         let mut state = manager.get("prod").await?;
//!         // ... modify resources ...
//!         manager.put("prod", state).await
//!     })
//!     .await?;
//! ```

pub mod backend;
pub mod backends;
pub mod collections;
pub mod drift;
pub mod lock;
pub mod manager;
pub mod migration;
pub mod state;

// Re-export main types for convenience
pub use backend::{
    BackendCapabilities, BackendConfig, BackendError, BackendResult, StateBackend,
    validate_state_name,
};
pub use backends::create_backend;
pub use collections::{CollectionError, CollectionManager, CollectionResult, DeleteMode};
pub use drift::StateResolver;
pub use lock::LockInfo;
pub use manager::{ManagerConfig, StateManager};
pub use migration::{MigrationRecord, MigrationRegistry, MigrationStatus, MigrationStep};
pub use state::{ProviderState, StateDocument, StateMetadata};
