//! POSIX-style access control entries and the recursive propagation engine.
//!
//! A tenant owner can only reach its directory if every ancestor carries the
//! execute bit for it, so grants are always propagated from the container
//! root over the whole subtree, never written on an isolated node.

use crate::cancel::Cancellation;
use crate::storage::{is_success, AclChangeBatch, StorageError, StorageService, ROOT_PATH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AclScope {
    /// Applies to the node itself.
    Access,
    /// Inherited by children created after the entry is set.
    Default,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Group,
    Mask,
    Other,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Group => "group",
            PrincipalKind::Mask => "mask",
            PrincipalKind::Other => "other",
        }
    }
}

/// A subset of {read, write, execute}.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const NONE: Permissions = Permissions::new(false, false, false);
    pub const EXECUTE: Permissions = Permissions::new(false, false, true);
    pub const READ_EXECUTE: Permissions = Permissions::new(true, false, true);
    pub const ALL: Permissions = Permissions::new(true, true, true);

    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        Self { read, write, execute }
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.read { 'r' } else { '-' };
        let w = if self.write { 'w' } else { '-' };
        let x = if self.execute { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

impl FromStr for Permissions {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 {
            return Err(AclError::InvalidEntry(s.to_string()));
        }
        let flag = |b: u8, on: u8| match b {
            b'-' => Ok(false),
            b if b == on => Ok(true),
            _ => Err(AclError::InvalidEntry(s.to_string())),
        };
        Ok(Permissions {
            read: flag(bytes[0], b'r')?,
            write: flag(bytes[1], b'w')?,
            execute: flag(bytes[2], b'x')?,
        })
    }
}

/// One entry in short form: `[default:]user|group|mask|other:[id]:rwx`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessControlEntry {
    pub scope: AclScope,
    pub kind: PrincipalKind,
    /// `None` addresses the owning user/group (or mask/other).
    pub principal: Option<String>,
    pub permissions: Permissions,
}

impl AccessControlEntry {
    pub fn new(
        scope: AclScope,
        kind: PrincipalKind,
        principal: Option<String>,
        permissions: Permissions,
    ) -> Self {
        Self {
            scope,
            kind,
            principal,
            permissions,
        }
    }

    /// Identity of the entry regardless of its permissions.
    pub fn key(&self) -> (AclScope, PrincipalKind, Option<&str>) {
        (self.scope, self.kind, self.principal.as_deref())
    }

    pub fn is_default(&self) -> bool {
        self.scope == AclScope::Default
    }

    /// Same entry with access scope, as inherited by a new child.
    pub fn as_access(&self) -> Self {
        Self {
            scope: AclScope::Access,
            ..self.clone()
        }
    }

    /// Parse a comma-separated ACL as returned in `x-ms-acl`.
    pub fn parse_list(acl: &str) -> Result<Vec<Self>, AclError> {
        acl.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn format_list(entries: &[Self]) -> String {
        entries
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for AccessControlEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("default:")?;
        }
        write!(
            f,
            "{}:{}:{}",
            self.kind.as_str(),
            self.principal.as_deref().unwrap_or(""),
            self.permissions
        )
    }
}

impl FromStr for AccessControlEntry {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AclError::InvalidEntry(s.to_string());
        let (scope, rest) = match s.strip_prefix("default:") {
            Some(rest) => (AclScope::Default, rest),
            None => (AclScope::Access, s),
        };
        let mut parts = rest.splitn(3, ':');
        let kind = match parts.next().ok_or_else(invalid)? {
            "user" => PrincipalKind::User,
            "group" => PrincipalKind::Group,
            "mask" => PrincipalKind::Mask,
            "other" => PrincipalKind::Other,
            _ => return Err(invalid()),
        };
        let principal = parts.next().ok_or_else(invalid)?;
        let permissions = parts.next().ok_or_else(invalid)?.parse()?;
        if !principal.is_empty() && matches!(kind, PrincipalKind::Mask | PrincipalKind::Other) {
            return Err(invalid());
        }
        Ok(Self {
            scope,
            kind,
            principal: (!principal.is_empty()).then(|| principal.to_string()),
            permissions,
        })
    }
}

/// How a recursive update combines with the ACL already on each node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AclMode {
    /// Add or update the given entries, keeping all others.
    Modify,
    /// Replace the whole ACL with the given entries.
    Set,
}

impl AclMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclMode::Modify => "modify",
            AclMode::Set => "set",
        }
    }
}

/// The execute-only entry that lets `owner` traverse into its subtree.
pub fn traversal_entry(owner: &str, scope: AclScope) -> Result<AccessControlEntry, AclError> {
    let owner = owner.trim();
    if owner.is_empty() || owner.contains([':', ',']) {
        return Err(AclError::InvalidEntry(owner.to_string()));
    }
    Ok(AccessControlEntry::new(
        scope,
        PrincipalKind::User,
        Some(owner.to_string()),
        Permissions::EXECUTE,
    ))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropagationLimits {
    /// Upper bound on continuation rounds per run.
    pub max_continuation_rounds: u32,
    /// Nodes processed per remote call.
    pub batch_size: u32,
}

impl Default for PropagationLimits {
    fn default() -> Self {
        Self {
            max_continuation_rounds: 100,
            batch_size: 2000,
        }
    }
}

/// Counts of a fully successful propagation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropagationReport {
    pub rounds: u32,
    pub directories_changed: u64,
    pub files_changed: u64,
}

impl PropagationReport {
    pub fn entries_changed(&self) -> u64 {
        self.directories_changed + self.files_changed
    }

    fn absorb(&mut self, batch: &AclChangeBatch) {
        self.directories_changed += batch.directories_successful;
        self.files_changed += batch.files_successful;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartialReason {
    RoundLimit,
    Cancelled,
    Status(u16),
    FailedEntries,
    Storage(StorageError),
}

/// State of a propagation that stopped before covering the whole subtree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialPropagation {
    pub container: String,
    pub path: String,
    pub entries: Vec<AccessControlEntry>,
    pub mode: AclMode,
    pub progress: PropagationReport,
    pub entries_failed: u64,
    /// Where to resume; `None` restarts from `path`.
    pub continuation: Option<String>,
    pub reason: PartialReason,
}

impl PartialPropagation {
    pub fn entries_changed(&self) -> u64 {
        self.progress.entries_changed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason == PartialReason::Cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AclError {
    #[error("invalid access control entry `{0}`")]
    InvalidEntry(String),
    #[error("recursive ACL update rejected with status {status}; no entries changed")]
    Rejected { status: u16 },
    #[error(
        "ACL propagation incomplete: {} entries changed, {} failed",
        .0.entries_changed(),
        .0.entries_failed
    )]
    PartialPropagation(Box<PartialPropagation>),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Drives recursive ACL updates to completion.
#[derive(Clone)]
pub struct AclEngine {
    storage: Arc<dyn StorageService>,
    limits: PropagationLimits,
}

/// What one propagation run writes, and where.
struct Target<'a> {
    container: &'a str,
    path: &'a str,
    entries: &'a [AccessControlEntry],
    mode: AclMode,
}

impl Target<'_> {
    fn partial(
        &self,
        progress: PropagationReport,
        entries_failed: u64,
        continuation: Option<String>,
        reason: PartialReason,
    ) -> AclError {
        warn!(
            "ACL propagation on {}{} stopped ({reason:?}) after {} entries",
            self.container,
            self.path,
            progress.entries_changed()
        );
        AclError::PartialPropagation(Box::new(PartialPropagation {
            container: self.container.to_string(),
            path: self.path.to_string(),
            entries: self.entries.to_vec(),
            mode: self.mode,
            progress,
            entries_failed,
            continuation,
            reason,
        }))
    }
}

impl AclEngine {
    pub fn new(storage: Arc<dyn StorageService>, limits: PropagationLimits) -> Self {
        Self { storage, limits }
    }

    pub fn limits(&self) -> &PropagationLimits {
        &self.limits
    }

    /// Grant `owner` execute on the container root and everything below it.
    pub async fn grant_traversal(
        &self,
        container: &str,
        owner: &str,
        scope: AclScope,
        cancel: &Cancellation,
    ) -> Result<PropagationReport, AclError> {
        let entries = [traversal_entry(owner, scope)?];
        info!("granting traversal to {owner} on {container} ({scope:?} scope)");
        let target = Target {
            container,
            path: ROOT_PATH,
            entries: &entries,
            mode: AclMode::Modify,
        };
        self.propagate(&target, PropagationReport::default(), None, cancel)
            .await
    }

    /// Apply `entries` to `path` and its subtree.
    pub async fn apply(
        &self,
        container: &str,
        path: &str,
        entries: &[AccessControlEntry],
        mode: AclMode,
        cancel: &Cancellation,
    ) -> Result<PropagationReport, AclError> {
        let target = Target {
            container,
            path,
            entries,
            mode,
        };
        self.propagate(&target, PropagationReport::default(), None, cancel)
            .await
    }

    /// Continue a partial propagation from its continuation token. The
    /// returned counts include the progress made before the interruption.
    pub async fn resume(
        &self,
        partial: &PartialPropagation,
        cancel: &Cancellation,
    ) -> Result<PropagationReport, AclError> {
        info!(
            "resuming ACL propagation on {}{} after {} entries",
            partial.container,
            partial.path,
            partial.entries_changed()
        );
        let target = Target {
            container: &partial.container,
            path: &partial.path,
            entries: &partial.entries,
            mode: partial.mode,
        };
        let carried = PropagationReport {
            rounds: 0,
            ..partial.progress.clone()
        };
        self.propagate(&target, carried, partial.continuation.clone(), cancel)
            .await
    }

    async fn propagate(
        &self,
        target: &Target<'_>,
        mut report: PropagationReport,
        mut continuation: Option<String>,
        cancel: &Cancellation,
    ) -> Result<PropagationReport, AclError> {
        let mut rounds = 0u32;

        loop {
            if rounds >= self.limits.max_continuation_rounds {
                return Err(target.partial(report, 0, continuation, PartialReason::RoundLimit));
            }
            if cancel.is_cancelled() {
                return Err(target.partial(report, 0, continuation, PartialReason::Cancelled));
            }

            let call = self.storage.set_access_control_recursive(
                target.container,
                target.path,
                target.entries,
                target.mode,
                continuation.as_deref(),
                self.limits.batch_size,
            );
            let outcome = tokio::select! {
                outcome = call => Some(outcome),
                _ = cancel.cancelled() => None,
            };
            let Some(outcome) = outcome else {
                return Err(target.partial(report, 0, continuation, PartialReason::Cancelled));
            };
            rounds += 1;
            report.rounds += 1;

            let batch = match outcome {
                Ok(batch) => batch,
                Err(err) if report.entries_changed() > 0 => {
                    return Err(target.partial(report, 0, continuation, PartialReason::Storage(err)));
                }
                Err(err) => return Err(AclError::Storage(err)),
            };
            report.absorb(&batch);
            debug!(
                "ACL round {rounds} on {}{}: status {}, {} changed, {} failed",
                target.container,
                target.path,
                batch.status,
                batch.entries_changed(),
                batch.failure_count
            );

            if !is_success(batch.status) {
                if report.entries_changed() == 0 {
                    return Err(AclError::Rejected {
                        status: batch.status,
                    });
                }
                let next = batch.continuation.or(continuation);
                return Err(target.partial(
                    report,
                    batch.failure_count,
                    next,
                    PartialReason::Status(batch.status),
                ));
            }
            if batch.failure_count > 0 {
                let next = batch.continuation.or(continuation);
                return Err(target.partial(
                    report,
                    batch.failure_count,
                    next,
                    PartialReason::FailedEntries,
                ));
            }

            match batch.continuation {
                Some(token) => continuation = Some(token),
                None => {
                    info!(
                        "ACL propagation on {}{} complete: {} entries in {} rounds",
                        target.container,
                        target.path,
                        report.entries_changed(),
                        report.rounds
                    );
                    return Ok(report);
                }
            }
        }
    }
}
