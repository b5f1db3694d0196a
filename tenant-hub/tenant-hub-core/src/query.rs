//! Read-only views over containers and tenant directories.

use crate::acl::AccessControlEntry;
use crate::provision::TENANT_CODE_KEY;
use crate::storage::{Page, PathEntry, StorageContainer, StorageError, StorageService};
use futures::stream::{self, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_SIZE_SCAN_LIMIT: u64 = 10_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryRecord {
    pub name: String,
    pub tenant_code: Option<String>,
    /// Access tier reported by the service, if any.
    pub storage_type: Option<String>,
    /// Sum of file lengths below the directory, in bytes.
    pub approximate_size: u64,
    /// The size scan hit its entry limit before covering the subtree.
    pub size_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("failed to list containers: {0}")]
    Containers(#[source] StorageError),
    #[error("failed to list directories of {container}: {source}")]
    Directories {
        container: String,
        #[source]
        source: StorageError,
    },
    #[error("failed to read {container}/{path}: {source}")]
    Describe {
        container: String,
        path: String,
        #[source]
        source: StorageError,
    },
}

impl QueryError {
    pub fn storage_error(&self) -> &StorageError {
        match self {
            QueryError::Containers(source)
            | QueryError::Directories { source, .. }
            | QueryError::Describe { source, .. } => source,
        }
    }
}

#[derive(Clone)]
pub struct NamespaceQuery {
    storage: Arc<dyn StorageService>,
    size_scan_limit: u64,
}

impl NamespaceQuery {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self {
            storage,
            size_scan_limit: DEFAULT_SIZE_SCAN_LIMIT,
        }
    }

    /// Maximum number of entries walked per directory when estimating its size.
    pub fn with_size_scan_limit(mut self, limit: u64) -> Self {
        self.size_scan_limit = limit;
        self
    }

    pub async fn containers_page(
        &self,
        continuation: Option<&str>,
    ) -> Result<Page<StorageContainer>, QueryError> {
        self.storage
            .list_containers(continuation)
            .await
            .map_err(QueryError::Containers)
    }

    /// Every container, fetched page by page as the stream is polled.
    pub fn list_containers(&self) -> impl Stream<Item = Result<StorageContainer, QueryError>> + '_ {
        paged(move |token| async move { self.containers_page(token.as_deref()).await })
    }

    /// One page of the container's top-level directories. Files at the root
    /// are skipped.
    pub async fn directories_page(
        &self,
        container: &str,
        continuation: Option<&str>,
    ) -> Result<Page<DirectoryRecord>, QueryError> {
        let page = self
            .storage
            .list_paths(container, None, false, continuation)
            .await
            .map_err(|source| QueryError::Directories {
                container: container.to_string(),
                source,
            })?;
        let describe = page
            .items
            .iter()
            .filter(|entry| entry.is_directory)
            .map(|entry| self.describe(container, &entry.name));
        let items = futures::future::try_join_all(describe).await?;
        Ok(Page {
            items,
            continuation: page.continuation,
        })
    }

    pub fn list_directories<'a>(
        &'a self,
        container: &'a str,
    ) -> impl Stream<Item = Result<DirectoryRecord, QueryError>> + 'a {
        paged(move |token| async move { self.directories_page(container, token.as_deref()).await })
    }

    pub async fn describe(&self, container: &str, name: &str) -> Result<DirectoryRecord, QueryError> {
        let describe_err = |source| QueryError::Describe {
            container: container.to_string(),
            path: name.to_string(),
            source,
        };
        let props = self
            .storage
            .get_properties(container, name)
            .await
            .map_err(describe_err)?;
        let (approximate_size, size_truncated) = self
            .scan_size(container, name)
            .await
            .map_err(describe_err)?;
        Ok(DirectoryRecord {
            name: name.trim_start_matches('/').to_string(),
            tenant_code: props.metadata.get(TENANT_CODE_KEY).cloned(),
            storage_type: props.access_tier,
            approximate_size,
            size_truncated,
        })
    }

    pub async fn access_control(
        &self,
        container: &str,
        path: &str,
    ) -> Result<Vec<AccessControlEntry>, QueryError> {
        self.storage
            .get_access_control(container, path)
            .await
            .map_err(|source| QueryError::Describe {
                container: container.to_string(),
                path: path.to_string(),
                source,
            })
    }

    async fn scan_size(&self, container: &str, directory: &str) -> Result<(u64, bool), StorageError> {
        let mut total = 0u64;
        let mut scanned = 0u64;
        let mut token: Option<String> = None;
        loop {
            let page = self
                .storage
                .list_paths(container, Some(directory), true, token.as_deref())
                .await?;
            let room = (self.size_scan_limit - scanned) as usize;
            let truncated = page.items.len() > room || (page.items.len() == room && page.continuation.is_some());
            scanned += page.items.len().min(room) as u64;
            total += page
                .items
                .iter()
                .take(room)
                .filter(|entry| !entry.is_directory)
                .map(|entry: &PathEntry| entry.content_length)
                .sum::<u64>();
            if truncated {
                debug!("size scan of {container}/{directory} stopped after {scanned} entries");
                return Ok((total, true));
            }
            match page.continuation {
                Some(next) => token = Some(next),
                None => return Ok((total, false)),
            }
        }
    }
}

/// Flatten continuation-token pages into a stream of items.
fn paged<T, F, Fut>(mut fetch: F) -> impl Stream<Item = Result<T, QueryError>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Page<T>, QueryError>>,
{
    // `Some(None)` is the first page, `None` means exhausted
    stream::try_unfold(Some(None), move |state: Option<Option<String>>| {
        let request = state.map(&mut fetch);
        async move {
            let Some(request) = request else {
                return Ok::<_, QueryError>(None);
            };
            let page = request.await?;
            let next = page.continuation.map(Some);
            let items = stream::iter(page.items.into_iter().map(Ok::<T, QueryError>));
            Ok(Some((items, next)))
        }
    })
    .try_flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{Fault, MemoryStorage, StorageOp};
    use std::collections::BTreeMap;

    async fn seeded() -> Arc<MemoryStorage> {
        let storage = MemoryStorage::new().with_container("funds").with_page_size(2);
        storage.add_container("archive").await;
        storage.add_container("scratch").await;
        for (path, len) in [
            ("/alpha/q1.csv", 100),
            ("/alpha/2026/q2.csv", 250),
            ("/beta/notes.txt", 7),
            ("/gamma/a", 1),
            ("/readme.md", 3),
        ] {
            storage.put_file("funds", path, len).await.unwrap();
        }
        let mut tags = BTreeMap::new();
        tags.insert(TENANT_CODE_KEY.to_string(), "F-0042".to_string());
        storage.write_metadata("funds", "/alpha", &tags).await.unwrap();
        storage.set_access_tier("funds", "/alpha", "Hot").await.unwrap();
        Arc::new(storage)
    }

    #[tokio::test]
    async fn streams_every_container_across_pages() {
        let storage = seeded().await;
        let query = NamespaceQuery::new(storage.clone());
        let names: Vec<String> = query
            .list_containers()
            .map_ok(|c| c.name)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, ["archive", "funds", "scratch"]);
        assert_eq!(storage.call_count(StorageOp::ListContainers), 2);
    }

    #[tokio::test]
    async fn lists_directories_with_tenant_metadata() {
        let query = NamespaceQuery::new(seeded().await);
        let records: Vec<DirectoryRecord> = query.list_directories("funds").try_collect().await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta", "gamma"]);

        let alpha = &records[0];
        assert_eq!(alpha.tenant_code.as_deref(), Some("F-0042"));
        assert_eq!(alpha.storage_type.as_deref(), Some("Hot"));
        assert_eq!(alpha.approximate_size, 350);
        assert!(!alpha.size_truncated);
        assert_eq!(records[1].tenant_code, None);
        assert_eq!(records[1].approximate_size, 7);
    }

    #[tokio::test]
    async fn page_variant_restarts_from_a_token() {
        let query = NamespaceQuery::new(seeded().await);
        let first = query.directories_page("funds", None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let token = first.continuation.unwrap();
        let rest = query.directories_page("funds", Some(&token)).await.unwrap();
        let names: Vec<_> = rest.items.iter().map(|r| r.name.as_str()).collect();
        // page two holds gamma and the root file
        assert_eq!(names, ["gamma"]);
        assert_eq!(rest.continuation, None);
    }

    #[tokio::test]
    async fn size_scan_stops_at_its_limit() {
        let query = NamespaceQuery::new(seeded().await).with_size_scan_limit(1);
        let alpha = query.describe("funds", "alpha").await.unwrap();
        assert!(alpha.size_truncated);
        assert!(alpha.approximate_size < 350);
    }

    #[tokio::test]
    async fn storage_failures_surface_as_query_errors() {
        let storage = seeded().await;
        storage.inject(
            StorageOp::ListPaths,
            Fault::Error(StorageError::Permission {
                status: 403,
                message: "denied".into(),
            }),
        );
        let query = NamespaceQuery::new(storage);
        let err = query
            .list_directories("funds")
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Directories { ref container, .. } if container == "funds"));
        assert!(matches!(err.storage_error(), StorageError::Permission { .. }));
    }

    #[tokio::test]
    async fn unknown_container_is_an_error_not_a_panic() {
        let query = NamespaceQuery::new(seeded().await);
        let err = query.directories_page("missing", None).await.unwrap_err();
        assert!(matches!(err.storage_error(), StorageError::NotFound { .. }));
    }
}
