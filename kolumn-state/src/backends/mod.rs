//! Backend implementations for state storage

mod local;
mod memory;
mod s3;
mod sql;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use s3::S3Backend;
pub use sql::SqlBackend;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend_type in the configuration.
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    log::debug!("Creating {} backend", config.backend_type);
    match config.backend_type.as_str() {
        "memory" => Ok(Box::new(MemoryBackend::new())),
        "local" => Ok(Box::new(LocalBackend::from_config(config)?)),
        "sql" | "sqlite" => Ok(Box::new(SqlBackend::from_config(config).await?)),
        "s3" => Ok(Box::new(S3Backend::from_config(config).await?)),
        other => Err(BackendError::unsupported_backend(other)),
    }
}
