//! Storage client adapter.
//!
//! [`StorageService`] is the seam between the provisioning core and a
//! hierarchical, POSIX-ACL-capable object store. Two backends implement it:
//! - [`datalake::DataLakeClient`]: the Data Lake Storage Gen2 REST API
//! - [`memory::MemoryStorage`]: an in-process namespace used for tests and local runs

pub mod datalake;
pub mod memory;
pub mod retry;
mod shared_key;

use crate::acl::{AccessControlEntry, AclMode};
use crate::config::StorageConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Path of a container's root directory.
pub const ROOT_PATH: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid path `{0}`")]
    InvalidPath(String),
    #[error("`{path}` already exists in `{container}`")]
    AlreadyExists { container: String, path: String },
    #[error("`{path}` not found in `{container}`")]
    NotFound { container: String, path: String },
    #[error("permission denied ({status}): {message}")]
    Permission { status: u16, message: String },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("storage service returned {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl StorageError {
    /// Whether the remote-call layer may retry the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    /// Classify a non-success status returned for `container`/`path`.
    pub fn from_status(
        status: u16,
        code: Option<&str>,
        message: String,
        container: &str,
        path: &str,
    ) -> Self {
        match (status, code) {
            (409, Some("PathAlreadyExists")) | (409, Some("ContainerAlreadyExists")) => {
                StorageError::AlreadyExists {
                    container: container.to_string(),
                    path: path.to_string(),
                }
            }
            (404, _) => StorageError::NotFound {
                container: container.to_string(),
                path: path.to_string(),
            },
            (401, _) | (403, _) => StorageError::Permission { status, message },
            _ if is_transient_status(status) => {
                StorageError::Transient(format!("status {status}: {message}"))
            }
            _ => StorageError::Remote { status, message },
        }
    }
}

/// The service answers 200 (OK) or 201 (Created) on success; everything else is a failure.
pub fn is_success(status: u16) -> bool {
    status == 200 || status == 201
}

/// Statuses worth retrying: timeouts, throttling and server errors.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Normalize a slash-delimited path to `/a/b` form. The root is `/`.
pub fn normalize_path(path: &str) -> Result<String, StorageError> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return Err(StorageError::InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Top-level isolation unit (a file system in Data Lake terms).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageContainer {
    pub name: String,
}

/// A directory as reported by the service after creation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Directory {
    pub container: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

/// One entry of a path listing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathEntry {
    pub name: String,
    pub is_directory: bool,
    pub content_length: u64,
}

/// Properties of a single path.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathProperties {
    pub is_directory: bool,
    pub content_length: u64,
    pub access_tier: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// One page of a listing; `continuation` is present when more pages follow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclFailedEntry {
    pub name: String,
    pub is_directory: bool,
    pub error_message: String,
}

/// Result of one round of a recursive ACL update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclChangeBatch {
    pub status: u16,
    pub directories_successful: u64,
    pub files_successful: u64,
    pub failure_count: u64,
    pub failed_entries: Vec<AclFailedEntry>,
    pub continuation: Option<String>,
}

impl AclChangeBatch {
    pub fn entries_changed(&self) -> u64 {
        self.directories_successful + self.files_successful
    }
}

/// Primitives the provisioning core needs from the storage service.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Create `path`. Fails with [`StorageError::AlreadyExists`] when the path
    /// is occupied unless the backend was configured to reuse directories.
    async fn create_directory(&self, container: &str, path: &str)
        -> Result<Directory, StorageError>;

    async fn get_access_control(
        &self,
        container: &str,
        path: &str,
    ) -> Result<Vec<AccessControlEntry>, StorageError>;

    /// Apply `entries` to `path` and its subtree, processing at most
    /// `max_records` nodes per call.
    ///
    /// A missing path, a permission failure or a transport failure is an
    /// `Err`. Any other non-success status the service answers with comes
    /// back as `AclChangeBatch::status`, together with whatever counts and
    /// continuation it reported.
    async fn set_access_control_recursive(
        &self,
        container: &str,
        path: &str,
        entries: &[AccessControlEntry],
        mode: AclMode,
        continuation: Option<&str>,
        max_records: u32,
    ) -> Result<AclChangeBatch, StorageError>;

    async fn write_metadata(
        &self,
        container: &str,
        path: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError>;

    async fn get_properties(&self, container: &str, path: &str)
        -> Result<PathProperties, StorageError>;

    async fn list_containers(
        &self,
        continuation: Option<&str>,
    ) -> Result<Page<StorageContainer>, StorageError>;

    /// List `directory` (the container root when `None`), descending when `recursive`.
    async fn list_paths(
        &self,
        container: &str,
        directory: Option<&str>,
        recursive: bool,
        continuation: Option<&str>,
    ) -> Result<Page<PathEntry>, StorageError>;
}

/// Open a connection to the configured Data Lake account.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn StorageService>, StorageError> {
    let client = datalake::DataLakeClient::connect(config).await?;
    Ok(Arc::new(client))
}
