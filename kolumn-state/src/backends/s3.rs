//! S3 backend for state storage
//!
//! Each state is one object `<prefix><name>.klstate`. Object storage offers
//! no conditional create here, so this backend does not lock: `lock` logs a
//! warning and succeeds, and `capabilities()` reports
//! `distributed_locking: false`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;

use crate::backend::{
    BackendCapabilities, BackendConfig, BackendError, BackendResult, StateBackend,
    validate_state_name,
};
use crate::lock::LockInfo;
use crate::state::StateDocument;

const STATE_EXTENSION: &str = ".klstate";

/// S3-based state backend
pub struct S3Backend {
    /// S3 client
    client: Client,
    /// Bucket name
    bucket: String,
    /// Key prefix, empty or ending in '/'
    prefix: String,
    /// Whether to encrypt state objects (default: true)
    encrypt: bool,
}

impl S3Backend {
    pub const DEFAULT_PREFIX: &'static str = "kolumn/";

    /// Create a new S3Backend from configuration
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let bucket = config.require_string("bucket")?.to_string();
        let region = config.require_string("region")?.to_string();
        let prefix = normalize_prefix(config.get_string("prefix").unwrap_or(Self::DEFAULT_PREFIX));
        let encrypt = config.get_bool_or("encrypt", true);

        // Load AWS config with the specified region
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .load()
            .await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = config.get_string("endpoint") {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        if config.get_bool_or("force_path_style", false) {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config.build()),
            bucket,
            prefix,
            encrypt,
        })
    }

    /// Get the bucket name
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn state_key(&self, name: &str) -> String {
        state_key(&self.prefix, name)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

fn state_key(prefix: &str, name: &str) -> String {
    format!("{}{}{}", prefix, name, STATE_EXTENSION)
}

/// Inverse of [`state_key`]; keys in nested "directories" are not states
fn name_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let name = key.strip_prefix(prefix)?.strip_suffix(STATE_EXTENSION)?;
    validate_state_name(name).ok().map(|_| name)
}

/// Check if an S3 error is a "not found" error
fn is_not_found_error<E: std::fmt::Debug>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    // Check the raw HTTP response status
    if let Some(raw) = err.raw_response() {
        return raw.status().as_u16() == 404;
    }
    false
}

fn s3_error<E>(operation: &str, err: aws_sdk_s3::error::SdkError<E>) -> BackendError
where
    E: std::error::Error + 'static,
{
    BackendError::unavailable("s3", operation, DisplayErrorContext(&err))
}

#[async_trait]
impl StateBackend for S3Backend {
    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            distributed_locking: false,
            atomic_writes: true,
        }
    }

    async fn get(&self, name: &str) -> BackendResult<StateDocument> {
        validate_state_name(name)?;
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.state_key(name))
            .send()
            .await;

        match result {
            Ok(output) => {
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| BackendError::unavailable("s3", "get", e))?;
                let bytes = body.into_bytes();
                serde_json::from_slice(&bytes).map_err(|e| {
                    BackendError::Serialization(format!("Failed to parse state {}: {}", name, e))
                })
            }
            Err(err) if is_not_found_error(&err) => Err(BackendError::NotFound(name.to_string())),
            Err(err) => Err(s3_error("get", err)),
        }
    }

    async fn put(&self, name: &str, state: &StateDocument) -> BackendResult<()> {
        validate_state_name(name)?;
        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.state_key(name))
            .body(ByteStream::from(body))
            .content_type("application/json")
            .metadata("kolumn-version", state.version.to_string())
            .metadata("kolumn-serial", state.serial.to_string())
            .metadata("kolumn-lineage", state.lineage.clone());

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request.send().await.map_err(|e| s3_error("put", e))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> BackendResult<()> {
        validate_state_name(name)?;
        let key = self.state_key(name);

        // DeleteObject succeeds on missing keys, so check first
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => {}
            Err(err) if is_not_found_error(&err) => {
                return Err(BackendError::NotFound(name.to_string()));
            }
            Err(err) => return Err(s3_error("delete", err)),
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error("delete", e))?;
        Ok(())
    }

    async fn list(&self) -> BackendResult<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| s3_error("list", e))?;

            names.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(|key| name_from_key(&self.prefix, key))
                    .map(str::to_string),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    async fn lock(&self, info: &LockInfo) -> BackendResult<()> {
        log::warn!(
            "S3 backend does not support locking; proceeding without a lock on {} for {}",
            info.state_name,
            info.operation
        );
        Ok(())
    }

    async fn unlock(&self, _name: &str, _lock_id: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn current_lock(&self, _name: &str) -> BackendResult<Option<LockInfo>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("kolumn/"), "kolumn/");
        assert_eq!(normalize_prefix("kolumn"), "kolumn/");
        assert_eq!(normalize_prefix("/teams/data"), "teams/data/");
        assert_eq!(normalize_prefix(""), "");
    }

    #[test]
    fn test_state_key_round_trip() {
        let key = state_key("kolumn/", "prod");
        assert_eq!(key, "kolumn/prod.klstate");
        assert_eq!(name_from_key("kolumn/", &key), Some("prod"));
    }

    #[test]
    fn test_name_from_key_skips_foreign_objects() {
        assert_eq!(name_from_key("kolumn/", "kolumn/prod.klstate.lock"), None);
        assert_eq!(name_from_key("kolumn/", "kolumn/archive/prod.klstate"), None);
        assert_eq!(name_from_key("kolumn/", "other/prod.klstate"), None);
    }

    #[tokio::test]
    async fn test_from_config_requires_bucket_and_region() {
        let config = BackendConfig::new("s3").with("region", "eu-west-1");
        assert!(matches!(
            S3Backend::from_config(&config).await,
            Err(BackendError::Configuration(_))
        ));

        let config = BackendConfig::new("s3").with("bucket", "state");
        assert!(matches!(
            S3Backend::from_config(&config).await,
            Err(BackendError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_locking_is_a_no_op() {
        let config = BackendConfig::new("s3")
            .with("bucket", "state")
            .with("region", "eu-west-1")
            .with("prefix", "teams/data");
        let backend = S3Backend::from_config(&config).await.unwrap();
        assert_eq!(backend.prefix(), "teams/data/");
        assert!(!backend.capabilities().distributed_locking);

        let lock = LockInfo::new("prod", "apply");
        backend.lock(&lock).await.unwrap();
        backend.lock(&LockInfo::new("prod", "plan")).await.unwrap();
        backend.unlock("prod", &lock.id).await.unwrap();
        assert!(backend.current_lock("prod").await.unwrap().is_none());
    }
}
