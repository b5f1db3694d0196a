//! Tenant directory provisioning.
//!
//! Creating a tenant is three remote writes with no transaction around them:
//! create the directory, grant the owner traversal from the container root,
//! tag the directory with the tenant code. [`Provisioner`] runs them as a
//! staged state machine. A failure leaves whatever was already written in
//! place and reports the stage that failed, so the caller can
//! [`Provisioner::resume`] from there. Directory creation is never repeated
//! on resume.

use crate::acl::{traversal_entry, AclEngine, AclError, AclScope, PropagationLimits, PropagationReport};
use crate::cancel::Cancellation;
use crate::storage::{normalize_path, StorageError, StorageService, ROOT_PATH};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Metadata key holding the tenant code on a provisioned directory.
pub const TENANT_CODE_KEY: &str = "tenantCode";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ProvisionStage {
    Requested,
    DirectoryCreated,
    AclGranted,
    MetadataTagged,
    Committed,
}

impl ProvisionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStage::Requested => "requested",
            ProvisionStage::DirectoryCreated => "directoryCreated",
            ProvisionStage::AclGranted => "aclGranted",
            ProvisionStage::MetadataTagged => "metadataTagged",
            ProvisionStage::Committed => "committed",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            ProvisionStage::Requested => Some(ProvisionStage::DirectoryCreated),
            ProvisionStage::DirectoryCreated => Some(ProvisionStage::AclGranted),
            ProvisionStage::AclGranted => Some(ProvisionStage::MetadataTagged),
            ProvisionStage::MetadataTagged => Some(ProvisionStage::Committed),
            ProvisionStage::Committed => None,
        }
    }

    pub fn previous(&self) -> Option<Self> {
        match self {
            ProvisionStage::Requested => None,
            ProvisionStage::DirectoryCreated => Some(ProvisionStage::Requested),
            ProvisionStage::AclGranted => Some(ProvisionStage::DirectoryCreated),
            ProvisionStage::MetadataTagged => Some(ProvisionStage::AclGranted),
            ProvisionStage::Committed => Some(ProvisionStage::MetadataTagged),
        }
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisionStage {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            ProvisionStage::Requested,
            ProvisionStage::DirectoryCreated,
            ProvisionStage::AclGranted,
            ProvisionStage::MetadataTagged,
            ProvisionStage::Committed,
        ]
        .into_iter()
        .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| ProvisionError::InvalidRequest(format!("unknown stage `{s}`")))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub container: String,
    pub path: String,
    /// Principal id of the tenant owner.
    pub owner: String,
    pub tenant_code: String,
    /// Grant as a default entry, inherited by children created later.
    #[serde(default)]
    pub default_scope: bool,
}

impl ProvisionRequest {
    pub fn scope(&self) -> AclScope {
        if self.default_scope {
            AclScope::Default
        } else {
            AclScope::Access
        }
    }

    /// Normalized directory path, after checking every field.
    fn validate(&self) -> Result<String, ProvisionError> {
        if self.container.trim().is_empty() {
            return Err(ProvisionError::InvalidRequest("container is required".into()));
        }
        let path = normalize_path(&self.path)
            .map_err(|_| ProvisionError::InvalidRequest(format!("invalid path `{}`", self.path)))?;
        if path == ROOT_PATH {
            return Err(ProvisionError::InvalidRequest(
                "a tenant cannot be provisioned at the container root".into(),
            ));
        }
        if self.tenant_code.trim().is_empty() {
            return Err(ProvisionError::InvalidRequest("tenant code is required".into()));
        }
        traversal_entry(&self.owner, self.scope())
            .map_err(|_| ProvisionError::InvalidRequest(format!("invalid owner `{}`", self.owner)))?;
        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid provisioning request: {0}")]
    InvalidRequest(String),
    #[error("{container}{path} is already provisioned")]
    DuplicateTenant { container: String, path: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Acl(#[from] AclError),
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("cancelled before the stage completed")]
    Cancelled,
}

impl ProvisionError {
    /// Stable label for callers that must not see raw error text.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::InvalidRequest(_) => "invalidRequest",
            ProvisionError::DuplicateTenant { .. } => "duplicateTenant",
            ProvisionError::NotImplemented(_) => "notImplemented",
            ProvisionError::Cancelled => "cancelled",
            ProvisionError::Acl(AclError::PartialPropagation(_)) => "partialPropagation",
            ProvisionError::Acl(AclError::Storage(err)) | ProvisionError::Storage(err) => {
                storage_kind(err)
            }
            ProvisionError::Acl(_) => "aclRejected",
        }
    }

    /// Whether resuming from the failed stage can succeed without operator action.
    pub fn is_resumable(&self) -> bool {
        match self {
            ProvisionError::Cancelled | ProvisionError::Acl(AclError::PartialPropagation(_)) => true,
            ProvisionError::Acl(AclError::Storage(err)) | ProvisionError::Storage(err) => {
                err.is_transient()
            }
            ProvisionError::Acl(AclError::Rejected { status }) => *status >= 500,
            _ => false,
        }
    }
}

fn storage_kind(err: &StorageError) -> &'static str {
    match err {
        StorageError::Configuration(_) => "configuration",
        StorageError::InvalidPath(_) => "invalidRequest",
        StorageError::AlreadyExists { .. } => "alreadyExists",
        StorageError::NotFound { .. } => "notFound",
        StorageError::Permission { .. } => "permission",
        StorageError::Transient(_) => "transient",
        StorageError::Remote { .. } | StorageError::Protocol(_) => "storage",
    }
}

/// The stage being attempted when the workflow stopped, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: ProvisionStage,
    pub cause: ProvisionError,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OwnerGrantOutcome {
    /// The workflow stopped before the grant step, or resumed past it.
    NotAttempted,
    /// No grant is configured.
    Skipped,
    Applied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResult {
    pub container: String,
    pub path: String,
    /// Last stage reached.
    pub stage: ProvisionStage,
    pub failure: Option<StageFailure>,
    /// Counts from the traversal grant, when it ran to completion.
    pub propagation: Option<PropagationReport>,
    pub owner_grant: OwnerGrantOutcome,
}

impl ProvisionResult {
    fn new(request: &ProvisionRequest, stage: ProvisionStage) -> Self {
        Self {
            container: request.container.clone(),
            path: normalize_path(&request.path).unwrap_or_else(|_| request.path.clone()),
            stage,
            failure: None,
            propagation: None,
            owner_grant: OwnerGrantOutcome::NotAttempted,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.stage == ProvisionStage::Committed
    }

    /// Stage to pass to [`Provisioner::resume`], if the run failed.
    pub fn failed_stage(&self) -> Option<ProvisionStage> {
        self.failure.as_ref().map(|f| f.stage)
    }

    fn fail(mut self, stage: ProvisionStage, cause: ProvisionError) -> Self {
        warn!(
            "provisioning {}{} failed at {stage} ({}): {cause}",
            self.container,
            self.path,
            cause.kind()
        );
        self.failure = Some(StageFailure { stage, cause });
        self
    }
}

/// Grants the owner read/write/execute on its own directory. Runs after the
/// traversal grant when configured.
#[async_trait]
pub trait OwnerContentGrant: Send + Sync {
    async fn grant(&self, container: &str, path: &str, owner: &str) -> Result<(), ProvisionError>;
}

/// Placeholder until the permission set for owner content is decided.
pub struct UnimplementedOwnerGrant;

#[async_trait]
impl OwnerContentGrant for UnimplementedOwnerGrant {
    async fn grant(&self, _container: &str, _path: &str, _owner: &str) -> Result<(), ProvisionError> {
        Err(ProvisionError::NotImplemented("owner content grant"))
    }
}

#[derive(Clone)]
pub struct Provisioner {
    storage: Arc<dyn StorageService>,
    engine: AclEngine,
    owner_grant: Option<Arc<dyn OwnerContentGrant>>,
}

impl Provisioner {
    pub fn new(storage: Arc<dyn StorageService>, limits: PropagationLimits) -> Self {
        Self {
            engine: AclEngine::new(storage.clone(), limits),
            storage,
            owner_grant: None,
        }
    }

    pub fn with_owner_grant(mut self, grant: Arc<dyn OwnerContentGrant>) -> Self {
        self.owner_grant = Some(grant);
        self
    }

    pub fn engine(&self) -> &AclEngine {
        &self.engine
    }

    pub async fn provision(&self, request: &ProvisionRequest, cancel: &Cancellation) -> ProvisionResult {
        info!(
            "provisioning tenant {} at {}{} for {}",
            request.tenant_code, request.container, request.path, request.owner
        );
        self.run(request, ProvisionStage::DirectoryCreated, cancel).await
    }

    /// Re-run the workflow from `failed_stage`. Stages after directory
    /// creation are idempotent; creation itself only runs again when it is the
    /// stage that failed.
    pub async fn resume(
        &self,
        request: &ProvisionRequest,
        failed_stage: ProvisionStage,
        cancel: &Cancellation,
    ) -> ProvisionResult {
        let from = match failed_stage {
            ProvisionStage::Requested => ProvisionStage::DirectoryCreated,
            ProvisionStage::Committed => {
                return ProvisionResult::new(request, ProvisionStage::Committed).fail(
                    ProvisionStage::Committed,
                    ProvisionError::InvalidRequest("nothing to resume after commit".into()),
                );
            }
            stage => stage,
        };
        info!(
            "resuming tenant {} at {}{} from {from}",
            request.tenant_code, request.container, request.path
        );
        self.run(request, from, cancel).await
    }

    async fn run(&self, request: &ProvisionRequest, from: ProvisionStage, cancel: &Cancellation) -> ProvisionResult {
        let mut result = ProvisionResult::new(request, from.previous().unwrap_or(ProvisionStage::Requested));
        let path = match request.validate() {
            Ok(path) => path,
            Err(cause) => return result.fail(from, cause),
        };
        let container = request.container.as_str();

        if from <= ProvisionStage::DirectoryCreated {
            // a path already tagged with a tenant code is never taken over,
            // even by a backend that reuses existing directories
            match guarded(cancel, self.storage.get_properties(container, &path)).await {
                Ok(props) if props.metadata.contains_key(TENANT_CODE_KEY) => {
                    return result.fail(
                        ProvisionStage::DirectoryCreated,
                        ProvisionError::DuplicateTenant {
                            container: container.to_string(),
                            path,
                        },
                    );
                }
                Ok(_) | Err(ProvisionError::Storage(StorageError::NotFound { .. })) => {}
                Err(cause) => return result.fail(ProvisionStage::DirectoryCreated, cause),
            }
            match guarded(cancel, self.storage.create_directory(container, &path)).await {
                Ok(dir) => info!("created {}{} at {}", dir.container, dir.path, dir.created_at),
                Err(ProvisionError::Storage(StorageError::AlreadyExists { container, path })) => {
                    return result.fail(
                        ProvisionStage::DirectoryCreated,
                        ProvisionError::DuplicateTenant { container, path },
                    );
                }
                Err(cause) => return result.fail(ProvisionStage::DirectoryCreated, cause),
            }
            result.stage = ProvisionStage::DirectoryCreated;
        } else {
            match guarded(cancel, self.storage.get_properties(container, &path)).await {
                Ok(props) if props.is_directory => {}
                Ok(_) => {
                    let cause = ProvisionError::InvalidRequest(format!("{path} is not a directory"));
                    return result.fail(from, cause);
                }
                Err(cause) => return result.fail(from, cause),
            }
        }

        if from <= ProvisionStage::AclGranted {
            match self
                .engine
                .grant_traversal(container, &request.owner, request.scope(), cancel)
                .await
            {
                Ok(report) => result.propagation = Some(report),
                Err(err) => return result.fail(ProvisionStage::AclGranted, err.into()),
            }
            result.owner_grant = match &self.owner_grant {
                None => OwnerGrantOutcome::Skipped,
                Some(grant) => match guarded(cancel, grant.grant(container, &path, &request.owner)).await {
                    Ok(()) => OwnerGrantOutcome::Applied,
                    Err(cause) => return result.fail(ProvisionStage::AclGranted, cause),
                },
            };
            result.stage = ProvisionStage::AclGranted;
        }

        // metadata is replaced wholesale, so merge with what is already there
        let mut metadata = match guarded(cancel, self.storage.get_properties(container, &path)).await {
            Ok(props) => props.metadata,
            Err(cause) => return result.fail(ProvisionStage::MetadataTagged, cause),
        };
        metadata.insert(TENANT_CODE_KEY.to_string(), request.tenant_code.clone());
        if let Err(cause) = guarded(cancel, self.storage.write_metadata(container, &path, &metadata)).await {
            return result.fail(ProvisionStage::MetadataTagged, cause);
        }
        result.stage = ProvisionStage::MetadataTagged;

        result.stage = ProvisionStage::Committed;
        info!(
            "tenant {} committed at {}{}",
            request.tenant_code, container, path
        );
        result
    }
}

/// Run one remote step unless `cancel` has fired, abandoning it if it fires
/// while the step is in flight.
async fn guarded<T, E, F>(cancel: &Cancellation, step: F) -> Result<T, ProvisionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ProvisionError>,
{
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled);
    }
    tokio::select! {
        outcome = step => outcome.map_err(Into::into),
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
    }
}

#[cfg(test)]
mod tests;
