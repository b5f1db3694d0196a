#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::acl::PartialReason;
    use crate::cancel::CancelHandle;
    use crate::storage::memory::{Fault, MemoryStorage, StorageOp};

    fn setup() -> (Arc<MemoryStorage>, Provisioner) {
        let storage = Arc::new(MemoryStorage::new().with_container("funds"));
        let provisioner = Provisioner::new(storage.clone(), PropagationLimits::default());
        (storage, provisioner)
    }

    fn request(path: &str, owner: &str, tenant_code: &str) -> ProvisionRequest {
        ProvisionRequest {
            container: "funds".into(),
            path: path.into(),
            owner: owner.into(),
            tenant_code: tenant_code.into(),
            default_scope: false,
        }
    }

    async fn has_traversal(storage: &MemoryStorage, path: &str, owner: &str, scope: AclScope) -> bool {
        let acl = storage.get_access_control("funds", path).await.unwrap();
        acl.contains(&traversal_entry(owner, scope).unwrap())
    }

    async fn tenant_code(storage: &MemoryStorage, path: &str) -> Option<String> {
        let props = storage.get_properties("funds", path).await.unwrap();
        props.metadata.get(TENANT_CODE_KEY).cloned()
    }

    #[test]
    fn stages_walk_forward_and_back() {
        let mut stage = ProvisionStage::Requested;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert_eq!(next.previous(), Some(stage));
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen.len(), 5);
        assert_eq!("aclGranted".parse::<ProvisionStage>().unwrap(), ProvisionStage::AclGranted);
        assert_eq!(
            serde_json::to_string(&ProvisionStage::MetadataTagged).unwrap(),
            "\"metadataTagged\""
        );
        assert!("done".parse::<ProvisionStage>().is_err());
    }

    #[tokio::test]
    async fn provisions_alpha_end_to_end() {
        let (storage, provisioner) = setup();
        let result = provisioner
            .provision(&request("/alpha", "user123", "F-0042"), &Cancellation::never())
            .await;

        assert!(result.is_committed(), "{result:?}");
        assert_eq!(result.failure, None);
        assert_eq!(result.owner_grant, OwnerGrantOutcome::Skipped);
        // root and alpha
        assert_eq!(result.propagation.as_ref().map(|p| p.entries_changed()), Some(2));
        assert!(has_traversal(&storage, "/", "user123", AclScope::Access).await);
        assert!(has_traversal(&storage, "/alpha", "user123", AclScope::Access).await);
        assert_eq!(tenant_code(&storage, "/alpha").await.as_deref(), Some("F-0042"));
    }

    #[tokio::test]
    async fn default_scope_is_inherited_by_new_children() {
        let (storage, provisioner) = setup();
        let mut req = request("/alpha", "user123", "F-0042");
        req.default_scope = true;
        assert!(provisioner.provision(&req, &Cancellation::never()).await.is_committed());
        assert!(has_traversal(&storage, "/", "user123", AclScope::Default).await);

        storage.create_directory("funds", "/alpha/2026").await.unwrap();
        assert!(has_traversal(&storage, "/alpha/2026", "user123", AclScope::Access).await);
    }

    #[tokio::test]
    async fn second_provision_of_same_path_is_a_duplicate() {
        let (storage, provisioner) = setup();
        let first = provisioner
            .provision(&request("/alpha", "user123", "F-0042"), &Cancellation::never())
            .await;
        assert!(first.is_committed());
        let acl_calls = storage.call_count(StorageOp::SetAccessControlRecursive);
        let metadata_calls = storage.call_count(StorageOp::WriteMetadata);

        let second = provisioner
            .provision(&request("alpha", "intruder", "F-9999"), &Cancellation::never())
            .await;
        assert_eq!(second.stage, ProvisionStage::Requested);
        assert_eq!(
            second.failure,
            Some(StageFailure {
                stage: ProvisionStage::DirectoryCreated,
                cause: ProvisionError::DuplicateTenant {
                    container: "funds".into(),
                    path: "/alpha".into(),
                },
            })
        );
        assert_eq!(storage.call_count(StorageOp::SetAccessControlRecursive), acl_calls);
        assert_eq!(storage.call_count(StorageOp::WriteMetadata), metadata_calls);
        assert!(!has_traversal(&storage, "/", "intruder", AclScope::Access).await);
        assert_eq!(tenant_code(&storage, "/alpha").await.as_deref(), Some("F-0042"));
    }

    #[tokio::test]
    async fn concurrent_provisions_of_one_path_commit_once() {
        let (_, provisioner) = setup();
        let a = request("/alpha", "user123", "F-0042");
        let b = request("/alpha", "user456", "F-0043");
        let never = Cancellation::never();
        let (ra, rb) = tokio::join!(provisioner.provision(&a, &never), provisioner.provision(&b, &never));
        let committed = [&ra, &rb].iter().filter(|r| r.is_committed()).count();
        assert_eq!(committed, 1);
        let duplicate = [&ra, &rb]
            .into_iter()
            .find(|r| !r.is_committed())
            .and_then(|r| r.failure.clone())
            .unwrap();
        assert_eq!(duplicate.cause.kind(), "duplicateTenant");
    }

    #[tokio::test]
    async fn resume_after_acl_failure_never_recreates() {
        let (storage, provisioner) = setup();
        storage.inject(StorageOp::SetAccessControlRecursive, Fault::Status(500));
        let req = request("/alpha", "user123", "F-0042");

        let failed = provisioner.provision(&req, &Cancellation::never()).await;
        assert_eq!(failed.stage, ProvisionStage::DirectoryCreated);
        assert_eq!(failed.failed_stage(), Some(ProvisionStage::AclGranted));
        let cause = failed.failure.clone().unwrap().cause;
        assert_eq!(cause, ProvisionError::Acl(AclError::Rejected { status: 500 }));
        assert!(cause.is_resumable());
        // no rollback
        assert!(storage.get_properties("funds", "/alpha").await.unwrap().is_directory);
        assert_eq!(storage.call_count(StorageOp::WriteMetadata), 0);

        let resumed = provisioner
            .resume(&req, ProvisionStage::AclGranted, &Cancellation::never())
            .await;
        assert!(resumed.is_committed(), "{resumed:?}");
        assert_eq!(storage.call_count(StorageOp::CreateDirectory), 1);
        assert!(has_traversal(&storage, "/", "user123", AclScope::Access).await);
        assert_eq!(tenant_code(&storage, "/alpha").await.as_deref(), Some("F-0042"));
    }

    #[tokio::test]
    async fn interrupted_grant_reports_partial_progress() {
        let (storage, provisioner) = setup();
        storage.put_file("funds", "/beta/data.csv", 3).await.unwrap();
        storage.inject(
            StorageOp::SetAccessControlRecursive,
            Fault::Interrupt { processed: 2, status: 503 },
        );
        let result = provisioner
            .provision(&request("/alpha", "user123", "F-0042"), &Cancellation::never())
            .await;
        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, ProvisionStage::AclGranted);
        let ProvisionError::Acl(AclError::PartialPropagation(partial)) = failure.cause else {
            panic!("expected partial propagation");
        };
        assert_eq!(partial.entries_changed(), 2);
        assert_eq!(partial.reason, PartialReason::Status(503));

        // root, alpha, beta, data.csv
        let report = provisioner
            .engine()
            .resume(&partial, &Cancellation::never())
            .await
            .unwrap();
        assert_eq!(report.entries_changed(), 4);
    }

    #[tokio::test]
    async fn resume_after_metadata_failure_skips_earlier_stages() {
        let (storage, provisioner) = setup();
        storage.inject(
            StorageOp::WriteMetadata,
            Fault::Error(StorageError::Transient("connection reset".into())),
        );
        let req = request("/alpha", "user123", "F-0042");
        let failed = provisioner.provision(&req, &Cancellation::never()).await;
        assert_eq!(failed.stage, ProvisionStage::AclGranted);
        assert_eq!(failed.failed_stage(), Some(ProvisionStage::MetadataTagged));

        let resumed = provisioner
            .resume(&req, ProvisionStage::MetadataTagged, &Cancellation::never())
            .await;
        assert!(resumed.is_committed());
        assert_eq!(resumed.owner_grant, OwnerGrantOutcome::NotAttempted);
        assert_eq!(storage.call_count(StorageOp::CreateDirectory), 1);
        assert_eq!(storage.call_count(StorageOp::SetAccessControlRecursive), 1);
        assert_eq!(tenant_code(&storage, "/alpha").await.as_deref(), Some("F-0042"));
    }

    #[tokio::test]
    async fn metadata_stage_keeps_existing_keys() {
        let (storage, provisioner) = setup();
        storage.create_directory("funds", "/alpha").await.unwrap();
        let mut existing = std::collections::BTreeMap::new();
        existing.insert("region".to_string(), "emea".to_string());
        storage.write_metadata("funds", "/alpha", &existing).await.unwrap();

        let req = request("/alpha", "user123", "F-0042");
        let result = provisioner
            .resume(&req, ProvisionStage::AclGranted, &Cancellation::never())
            .await;
        assert!(result.is_committed());
        let props = storage.get_properties("funds", "/alpha").await.unwrap();
        assert_eq!(props.metadata.get("region").map(String::as_str), Some("emea"));
        assert_eq!(props.metadata.get(TENANT_CODE_KEY).map(String::as_str), Some("F-0042"));
    }

    #[tokio::test]
    async fn resume_without_directory_fails_instead_of_creating() {
        let (storage, provisioner) = setup();
        let result = provisioner
            .resume(
                &request("/ghost", "user123", "F-0001"),
                ProvisionStage::AclGranted,
                &Cancellation::never(),
            )
            .await;
        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, ProvisionStage::AclGranted);
        assert_eq!(failure.cause.kind(), "notFound");
        assert_eq!(storage.call_count(StorageOp::CreateDirectory), 0);
    }

    #[tokio::test]
    async fn resume_from_creation_creates() {
        let (storage, provisioner) = setup();
        let result = provisioner
            .resume(
                &request("/alpha", "user123", "F-0042"),
                ProvisionStage::DirectoryCreated,
                &Cancellation::never(),
            )
            .await;
        assert!(result.is_committed());
        assert_eq!(storage.call_count(StorageOp::CreateDirectory), 1);
    }

    #[tokio::test]
    async fn resume_after_commit_is_rejected() {
        let (storage, provisioner) = setup();
        let result = provisioner
            .resume(
                &request("/alpha", "user123", "F-0042"),
                ProvisionStage::Committed,
                &Cancellation::never(),
            )
            .await;
        assert!(matches!(
            result.failure.map(|f| f.cause),
            Some(ProvisionError::InvalidRequest(_))
        ));
        assert_eq!(storage.call_count(StorageOp::CreateDirectory), 0);
    }

    #[tokio::test]
    async fn unimplemented_owner_grant_fails_the_acl_stage() {
        let (storage, provisioner) = setup();
        let provisioner = provisioner.with_owner_grant(Arc::new(UnimplementedOwnerGrant));
        let result = provisioner
            .provision(&request("/alpha", "user123", "F-0042"), &Cancellation::never())
            .await;
        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, ProvisionStage::AclGranted);
        assert_eq!(failure.cause, ProvisionError::NotImplemented("owner content grant"));
        assert_eq!(failure.cause.kind(), "notImplemented");
        // traversal was written before the grant step
        assert!(has_traversal(&storage, "/", "user123", AclScope::Access).await);
        assert_eq!(storage.call_count(StorageOp::WriteMetadata), 0);
    }

    #[tokio::test]
    async fn configured_owner_grant_is_applied() {
        struct Recording(parking_lot::Mutex<Vec<String>>);
        #[async_trait]
        impl OwnerContentGrant for Recording {
            async fn grant(&self, container: &str, path: &str, owner: &str) -> Result<(), ProvisionError> {
                self.0.lock().push(format!("{container}{path}:{owner}"));
                Ok(())
            }
        }
        let (_, provisioner) = setup();
        let grant = Arc::new(Recording(parking_lot::Mutex::new(Vec::new())));
        let provisioner = provisioner.with_owner_grant(grant.clone());
        let result = provisioner
            .provision(&request("alpha/", "user123", "F-0042"), &Cancellation::never())
            .await;
        assert!(result.is_committed());
        assert_eq!(result.path, "/alpha");
        assert_eq!(result.owner_grant, OwnerGrantOutcome::Applied);
        assert_eq!(*grant.0.lock(), vec!["funds/alpha:user123".to_string()]);
    }

    #[tokio::test]
    async fn invalid_requests_touch_nothing() {
        let (storage, provisioner) = setup();
        let cases = [
            request("/", "user123", "F-0042"),
            request("/alpha/..", "user123", "F-0042"),
            request("/alpha", "user:123", "F-0042"),
            request("/alpha", "user123", "  "),
            ProvisionRequest {
                container: String::new(),
                ..request("/alpha", "user123", "F-0042")
            },
        ];
        for req in &cases {
            let result = provisioner.provision(req, &Cancellation::never()).await;
            let failure = result.failure.unwrap();
            assert_eq!(failure.cause.kind(), "invalidRequest", "{req:?}");
        }
        assert_eq!(storage.call_count(StorageOp::CreateDirectory), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let (storage, provisioner) = setup();
        let (handle, token) = Cancellation::new();
        handle.cancel();
        let req = request("/alpha", "user123", "F-0042");
        let result = provisioner.provision(&req, &token).await;
        let failure = result.failure.unwrap();
        assert_eq!(failure.stage, ProvisionStage::DirectoryCreated);
        assert_eq!(failure.cause, ProvisionError::Cancelled);
        assert!(failure.cause.is_resumable());
        assert_eq!(storage.call_count(StorageOp::CreateDirectory), 0);

        let resumed = provisioner
            .resume(&req, ProvisionStage::DirectoryCreated, &Cancellation::never())
            .await;
        assert!(resumed.is_committed());
    }

    #[tokio::test]
    async fn cancellation_between_stages_stops_before_metadata() {
        struct CancelOnGrant(CancelHandle);
        #[async_trait]
        impl OwnerContentGrant for CancelOnGrant {
            async fn grant(&self, _: &str, _: &str, _: &str) -> Result<(), ProvisionError> {
                self.0.cancel();
                Ok(())
            }
        }
        let (storage, provisioner) = setup();
        let (handle, token) = Cancellation::new();
        let provisioner = provisioner.with_owner_grant(Arc::new(CancelOnGrant(handle)));
        let req = request("/alpha", "user123", "F-0042");

        let result = provisioner.provision(&req, &token).await;
        assert_eq!(result.stage, ProvisionStage::AclGranted);
        assert_eq!(
            result.failure.as_ref().map(|f| (f.stage, f.cause.clone())),
            Some((ProvisionStage::MetadataTagged, ProvisionError::Cancelled))
        );
        assert!(has_traversal(&storage, "/", "user123", AclScope::Access).await);
        assert_eq!(storage.call_count(StorageOp::WriteMetadata), 0);

        let resumed = provisioner
            .resume(&req, ProvisionStage::MetadataTagged, &Cancellation::never())
            .await;
        assert!(resumed.is_committed());
        assert_eq!(tenant_code(&storage, "/alpha").await.as_deref(), Some("F-0042"));
    }

    #[tokio::test]
    async fn reusing_backend_still_refuses_a_provisioned_path() {
        let storage = Arc::new(
            MemoryStorage::new()
                .with_container("funds")
                .reuse_existing_directories(true),
        );
        let provisioner = Provisioner::new(storage.clone(), PropagationLimits::default());
        let first = provisioner
            .provision(&request("/alpha", "user123", "F-0042"), &Cancellation::never())
            .await;
        assert!(first.is_committed());

        let second = provisioner
            .provision(&request("/alpha", "intruder", "F-9999"), &Cancellation::never())
            .await;
        assert!(!second.is_committed());
        assert_eq!(second.failure.map(|f| f.cause.kind()), Some("duplicateTenant"));
        assert_eq!(storage.call_count(StorageOp::CreateDirectory), 1);
        assert!(!has_traversal(&storage, "/", "intruder", AclScope::Access).await);
        assert_eq!(tenant_code(&storage, "/alpha").await.as_deref(), Some("F-0042"));
    }

    #[tokio::test]
    async fn reusing_backend_adopts_an_untagged_directory() {
        let storage = Arc::new(
            MemoryStorage::new()
                .with_container("funds")
                .reuse_existing_directories(true),
        );
        storage.create_directory("funds", "/alpha").await.unwrap();
        let provisioner = Provisioner::new(storage.clone(), PropagationLimits::default());
        let result = provisioner
            .provision(&request("/alpha", "user123", "F-0042"), &Cancellation::never())
            .await;
        assert!(result.is_committed(), "{result:?}");
        assert_eq!(tenant_code(&storage, "/alpha").await.as_deref(), Some("F-0042"));
    }
}
