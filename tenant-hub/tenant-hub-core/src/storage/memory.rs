//! In-process hierarchical namespace implementing [`StorageService`].
//!
//! Paginates recursive ACL updates and listings the way the remote service
//! does, copies default entries onto new children, and can inject faults per
//! operation. Used by the test-suite and by `serve --in-memory`.

use super::{
    normalize_path, AclChangeBatch, Directory, Page, PathEntry, PathProperties, StorageContainer,
    StorageError, StorageService, ROOT_PATH,
};
use crate::acl::{AccessControlEntry, AclMode, AclScope, Permissions, PrincipalKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::RwLock;

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageOp {
    CreateDirectory,
    GetAccessControl,
    SetAccessControlRecursive,
    WriteMetadata,
    GetProperties,
    ListContainers,
    ListPaths,
}

/// A failure to play back on the next call of an operation.
#[derive(Clone, Debug)]
pub enum Fault {
    /// Fail the call with this error.
    Error(StorageError),
    /// Answer a recursive ACL update with this status without touching any node.
    Status(u16),
    /// Update `processed` nodes of the batch, then answer with `status`.
    Interrupt { processed: u64, status: u16 },
}

#[derive(Clone, Debug)]
struct Node {
    is_directory: bool,
    content_length: u64,
    acl: Vec<AccessControlEntry>,
    metadata: BTreeMap<String, String>,
    access_tier: Option<String>,
    created_at: DateTime<Utc>,
}

impl Node {
    fn directory(acl: Vec<AccessControlEntry>) -> Self {
        Self {
            is_directory: true,
            content_length: 0,
            acl,
            metadata: BTreeMap::new(),
            access_tier: None,
            created_at: Utc::now(),
        }
    }

    fn apply(&mut self, entries: &[AccessControlEntry], mode: AclMode) {
        // default entries only make sense on directories
        let is_directory = self.is_directory;
        let applicable = entries
            .iter()
            .filter(move |e| is_directory || !e.is_default());
        match mode {
            AclMode::Set => {
                self.acl = applicable.cloned().collect();
            }
            AclMode::Modify => {
                for entry in applicable {
                    match self.acl.iter_mut().find(|e| e.key() == entry.key()) {
                        Some(existing) => existing.permissions = entry.permissions,
                        None => self.acl.push(entry.clone()),
                    }
                }
            }
        }
        self.acl.sort();
    }
}

fn base_acl() -> Vec<AccessControlEntry> {
    vec![
        AccessControlEntry::new(AclScope::Access, PrincipalKind::User, None, Permissions::ALL),
        AccessControlEntry::new(AclScope::Access, PrincipalKind::Group, None, Permissions::READ_EXECUTE),
        AccessControlEntry::new(AclScope::Access, PrincipalKind::Other, None, Permissions::NONE),
    ]
}

/// ACL of a new child: base entries overlaid with the parent's defaults,
/// which the child inherits both as access and (for directories) default entries.
fn inherited_acl(parent: &Node, is_directory: bool) -> Vec<AccessControlEntry> {
    let mut node = Node::directory(base_acl());
    node.is_directory = is_directory;
    let defaults: Vec<_> = parent.acl.iter().filter(|e| e.is_default()).cloned().collect();
    let as_access: Vec<_> = defaults.iter().map(AccessControlEntry::as_access).collect();
    node.apply(&as_access, AclMode::Modify);
    node.apply(&defaults, AclMode::Modify);
    node.acl
}

struct Container {
    /// Keyed by normalized path; `/` is the root.
    nodes: BTreeMap<String, Node>,
}

impl Container {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_PATH.to_string(), Node::directory(base_acl()));
        Self { nodes }
    }

    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => ROOT_PATH,
            Some(idx) => &path[..idx],
        }
    }

    fn in_subtree(root: &str, path: &str) -> bool {
        root == ROOT_PATH
            || path == root
            || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
    }

    /// Insert `path` and any missing ancestors.
    fn insert(&mut self, path: &str, is_directory: bool, content_length: u64) {
        let parent = Self::parent_of(path).to_string();
        if !self.nodes.contains_key(&parent) {
            self.insert(&parent, true, 0);
        }
        let acl = self
            .nodes
            .get(&parent)
            .map(|p| inherited_acl(p, is_directory))
            .unwrap_or_else(base_acl);
        let mut node = Node::directory(acl);
        node.is_directory = is_directory;
        node.content_length = content_length;
        self.nodes.insert(path.to_string(), node);
    }
}

/// In-memory storage account.
pub struct MemoryStorage {
    containers: RwLock<BTreeMap<String, Container>>,
    faults: Mutex<HashMap<StorageOp, VecDeque<Fault>>>,
    calls: Mutex<HashMap<StorageOp, u32>>,
    page_size: usize,
    reuse_existing: bool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            reuse_existing: false,
        }
    }

    pub fn with_container(mut self, name: &str) -> Self {
        self.containers
            .get_mut()
            .entry(name.to_string())
            .or_insert_with(Container::new);
        self
    }

    /// Page size for listings.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn reuse_existing_directories(mut self, reuse: bool) -> Self {
        self.reuse_existing = reuse;
        self
    }

    pub async fn add_container(&self, name: &str) {
        self.containers
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(Container::new);
    }

    /// Seed a file of `len` bytes, creating parent directories as needed.
    pub async fn put_file(&self, container: &str, path: &str, len: u64) -> Result<(), StorageError> {
        let path = normalize_path(path)?;
        let mut containers = self.containers.write().await;
        let c = containers
            .get_mut(container)
            .ok_or_else(|| not_found(container, ROOT_PATH))?;
        c.insert(&path, false, len);
        Ok(())
    }

    pub async fn set_access_tier(&self, container: &str, path: &str, tier: &str) -> Result<(), StorageError> {
        let path = normalize_path(path)?;
        let mut containers = self.containers.write().await;
        let node = containers
            .get_mut(container)
            .and_then(|c| c.nodes.get_mut(&path))
            .ok_or_else(|| not_found(container, &path))?;
        node.access_tier = Some(tier.to_string());
        Ok(())
    }

    /// Number of nodes (root included) in `container`.
    pub async fn node_count(&self, container: &str) -> usize {
        self.containers
            .read()
            .await
            .get(container)
            .map_or(0, |c| c.nodes.len())
    }

    /// Queue a fault for the next call of `op`.
    pub fn inject(&self, op: StorageOp, fault: Fault) {
        self.faults.lock().entry(op).or_default().push_back(fault);
    }

    /// How many times `op` was invoked, faulted calls included.
    pub fn call_count(&self, op: StorageOp) -> u32 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: StorageOp) -> Option<Fault> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front)
    }
}

fn not_found(container: &str, path: &str) -> StorageError {
    StorageError::NotFound {
        container: container.to_string(),
        path: path.to_string(),
    }
}

fn fail_with(fault: Option<Fault>) -> Result<(), StorageError> {
    match fault {
        Some(Fault::Error(err)) => Err(err),
        Some(Fault::Status(status)) | Some(Fault::Interrupt { status, .. }) => Err(
            StorageError::from_status(status, None, format!("injected status {status}"), "", ""),
        ),
        None => Ok(()),
    }
}

fn page<T>(items: Vec<(String, T)>, after: Option<&str>, size: usize) -> Page<T> {
    let remaining: Vec<_> = items
        .into_iter()
        .filter(|(key, _)| after.map_or(true, |a| key.as_str() > a))
        .collect();
    let more = remaining.len() > size;
    let taken: Vec<_> = remaining.into_iter().take(size).collect();
    let continuation = if more {
        taken.last().map(|(key, _)| key.clone())
    } else {
        None
    };
    Page {
        items: taken.into_iter().map(|(_, item)| item).collect(),
        continuation,
    }
}

#[async_trait]
impl StorageService for MemoryStorage {
    async fn create_directory(
        &self,
        container: &str,
        path: &str,
    ) -> Result<Directory, StorageError> {
        fail_with(self.enter(StorageOp::CreateDirectory))?;
        let path = normalize_path(path)?;
        let mut containers = self.containers.write().await;
        let c = containers
            .get_mut(container)
            .ok_or_else(|| not_found(container, ROOT_PATH))?;
        match c.nodes.get(&path) {
            Some(node) if self.reuse_existing && node.is_directory => {
                return Ok(Directory {
                    container: container.to_string(),
                    path,
                    created_at: node.created_at,
                });
            }
            Some(_) => {
                return Err(StorageError::AlreadyExists {
                    container: container.to_string(),
                    path,
                })
            }
            None => {}
        }
        c.insert(&path, true, 0);
        let created_at = c.nodes.get(&path).map_or_else(Utc::now, |n| n.created_at);
        Ok(Directory {
            container: container.to_string(),
            path,
            created_at,
        })
    }

    async fn get_access_control(
        &self,
        container: &str,
        path: &str,
    ) -> Result<Vec<AccessControlEntry>, StorageError> {
        fail_with(self.enter(StorageOp::GetAccessControl))?;
        let path = normalize_path(path)?;
        let containers = self.containers.read().await;
        containers
            .get(container)
            .and_then(|c| c.nodes.get(&path))
            .map(|n| n.acl.clone())
            .ok_or_else(|| not_found(container, &path))
    }

    async fn set_access_control_recursive(
        &self,
        container: &str,
        path: &str,
        entries: &[AccessControlEntry],
        mode: AclMode,
        continuation: Option<&str>,
        max_records: u32,
    ) -> Result<AclChangeBatch, StorageError> {
        let fault = self.enter(StorageOp::SetAccessControlRecursive);
        let (status, limit) = match fault {
            Some(Fault::Error(err)) => return Err(err),
            Some(Fault::Status(status)) => (status, Some(0)),
            Some(Fault::Interrupt { processed, status }) => (status, Some(processed)),
            None => (200, None),
        };

        let root = normalize_path(path)?;
        let mut containers = self.containers.write().await;
        let c = containers
            .get_mut(container)
            .ok_or_else(|| not_found(container, &root))?;
        if !c.nodes.contains_key(&root) {
            return Err(not_found(container, &root));
        }

        let pending: Vec<String> = c
            .nodes
            .keys()
            .filter(|key| Container::in_subtree(&root, key))
            .filter(|key| continuation.map_or(true, |after| key.as_str() > after))
            .cloned()
            .collect();
        let batch_len = pending.len().min(max_records.max(1) as usize);
        let processed = limit.map_or(batch_len, |l| (l as usize).min(batch_len));

        let mut batch = AclChangeBatch {
            status,
            directories_successful: 0,
            files_successful: 0,
            failure_count: 0,
            failed_entries: Vec::new(),
            continuation: None,
        };
        for key in &pending[..processed] {
            if let Some(node) = c.nodes.get_mut(key) {
                node.apply(entries, mode);
                if node.is_directory {
                    batch.directories_successful += 1;
                } else {
                    batch.files_successful += 1;
                }
            }
        }

        let finished = limit.is_none() && processed == pending.len();
        batch.continuation = if finished {
            None
        } else if processed > 0 {
            Some(pending[processed - 1].clone())
        } else {
            continuation.map(str::to_string)
        };
        Ok(batch)
    }

    async fn write_metadata(
        &self,
        container: &str,
        path: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        fail_with(self.enter(StorageOp::WriteMetadata))?;
        let path = normalize_path(path)?;
        let mut containers = self.containers.write().await;
        let node = containers
            .get_mut(container)
            .and_then(|c| c.nodes.get_mut(&path))
            .ok_or_else(|| not_found(container, &path))?;
        node.metadata = metadata.clone();
        Ok(())
    }

    async fn get_properties(
        &self,
        container: &str,
        path: &str,
    ) -> Result<PathProperties, StorageError> {
        fail_with(self.enter(StorageOp::GetProperties))?;
        let path = normalize_path(path)?;
        let containers = self.containers.read().await;
        let node = containers
            .get(container)
            .and_then(|c| c.nodes.get(&path))
            .ok_or_else(|| not_found(container, &path))?;
        Ok(PathProperties {
            is_directory: node.is_directory,
            content_length: node.content_length,
            access_tier: node.access_tier.clone(),
            metadata: node.metadata.clone(),
        })
    }

    async fn list_containers(
        &self,
        continuation: Option<&str>,
    ) -> Result<Page<StorageContainer>, StorageError> {
        fail_with(self.enter(StorageOp::ListContainers))?;
        let containers = self.containers.read().await;
        let items = containers
            .keys()
            .map(|name| (name.clone(), StorageContainer { name: name.clone() }))
            .collect();
        Ok(page(items, continuation, self.page_size))
    }

    async fn list_paths(
        &self,
        container: &str,
        directory: Option<&str>,
        recursive: bool,
        continuation: Option<&str>,
    ) -> Result<Page<PathEntry>, StorageError> {
        fail_with(self.enter(StorageOp::ListPaths))?;
        let dir = normalize_path(directory.unwrap_or(ROOT_PATH))?;
        let containers = self.containers.read().await;
        let c = containers
            .get(container)
            .ok_or_else(|| not_found(container, ROOT_PATH))?;
        if !c.nodes.get(&dir).map_or(false, |n| n.is_directory) {
            return Err(not_found(container, &dir));
        }
        let items = c
            .nodes
            .iter()
            .filter(|(key, _)| key.as_str() != dir && Container::in_subtree(&dir, key))
            .filter(|(key, _)| recursive || Container::parent_of(key) == dir)
            .map(|(key, node)| {
                // the service reports names relative to the container, without a leading slash
                let entry = PathEntry {
                    name: key.trim_start_matches('/').to_string(),
                    is_directory: node.is_directory,
                    content_length: node.content_length,
                };
                (key.clone(), entry)
            })
            .collect();
        Ok(page(items, continuation, self.page_size))
    }
}
