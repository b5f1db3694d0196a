//! Storage configuration, read from environment-style key/value pairs.

use crate::acl::PropagationLimits;
use crate::storage::retry::RetryPolicy;
use crate::storage::StorageError;
use std::str::FromStr;
use std::time::Duration;

pub const ACCOUNT_NAME: &str = "storageAccountName";
pub const ACCOUNT_KEY: &str = "storageAccountKey";
pub const SERVICE_URI: &str = "storageServiceUri";
pub const ROOT_CONTAINER: &str = "storageRootContainer";
pub const MAX_RETRIES: &str = "storageMaxRetries";
pub const RETRY_BASE_DELAY_MS: &str = "storageRetryBaseDelayMs";
pub const REQUEST_TIMEOUT_SECS: &str = "storageRequestTimeoutSecs";
pub const REUSE_EXISTING: &str = "storageReuseExistingDirectories";
pub const ACL_MAX_ROUNDS: &str = "aclMaxContinuationRounds";
pub const ACL_BATCH_SIZE: &str = "aclBatchSize";

#[derive(Clone)]
pub struct StorageConfig {
    pub account_name: String,
    pub account_key: String,
    pub service_uri: String,
    /// Container tenant directories are provisioned in by default.
    pub root_container: String,
    pub retry: RetryPolicy,
    pub propagation: PropagationLimits,
    /// Treat an existing directory as created instead of failing.
    pub reuse_existing_directories: bool,
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("account_name", &self.account_name)
            .field("account_key", &"<redacted>")
            .field("service_uri", &self.service_uri)
            .field("root_container", &self.root_container)
            .field("retry", &self.retry)
            .field("propagation", &self.propagation)
            .field("reuse_existing_directories", &self.reuse_existing_directories)
            .finish()
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source. Required keys must be present and
    /// non-empty; optional keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, StorageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| StorageError::Configuration(format!("missing required key `{key}`")))
        };
        let account_name = required(ACCOUNT_NAME)?;
        let account_key = required(ACCOUNT_KEY)?;
        let service_uri = required(SERVICE_URI)?;
        let root_container = required(ROOT_CONTAINER)?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: optional(&lookup, MAX_RETRIES)?.unwrap_or(defaults.max_retries),
            base_delay: optional(&lookup, RETRY_BASE_DELAY_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: defaults.max_delay,
            timeout: optional(&lookup, REQUEST_TIMEOUT_SECS)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        };

        let limits = PropagationLimits::default();
        let propagation = PropagationLimits {
            max_continuation_rounds: optional(&lookup, ACL_MAX_ROUNDS)?
                .unwrap_or(limits.max_continuation_rounds),
            batch_size: optional(&lookup, ACL_BATCH_SIZE)?.unwrap_or(limits.batch_size),
        };
        if propagation.batch_size == 0 {
            return Err(StorageError::Configuration(format!("`{ACL_BATCH_SIZE}` must be positive")));
        }

        Ok(Self {
            account_name,
            account_key,
            service_uri,
            root_container,
            retry,
            propagation,
            reuse_existing_directories: optional(&lookup, REUSE_EXISTING)?.unwrap_or(false),
        })
    }
}

fn optional<F, T>(lookup: &F, key: &str) -> Result<Option<T>, StorageError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| StorageError::Configuration(format!("invalid value `{raw}` for `{key}`"))),
    }
}
