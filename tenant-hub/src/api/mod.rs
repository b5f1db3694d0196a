//! HTTP API over the provisioning workflow and namespace queries.
//!
//! Listings degrade to an empty list with an `error` flag instead of failing,
//! and no response carries raw storage or transport error text.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tenant_hub_core::acl::AccessControlEntry;
use tenant_hub_core::cancel::Cancellation;
use tenant_hub_core::provision::{
    ProvisionError, ProvisionRequest, ProvisionResult, ProvisionStage, Provisioner,
};
use tenant_hub_core::query::{DirectoryRecord, NamespaceQuery};
use tenant_hub_core::storage::StorageError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

const LISTING_UNAVAILABLE: &str = "storage is currently unavailable";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub provisioner: Provisioner,
    pub query: NamespaceQuery,
    /// Upper bound for one provisioning call, ACL propagation included.
    pub operation_timeout: Duration,
}

impl AppState {
    fn cancellation(&self) -> Cancellation {
        Cancellation::never().with_deadline(tokio::time::Instant::now() + self.operation_timeout)
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ListResponse<T> {
    fn degraded() -> Self {
        Self {
            items: Vec::new(),
            error: Some(LISTING_UNAVAILABLE.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ContainerItem {
    pub name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionBody {
    path: String,
    owner: String,
    tenant_code: String,
    #[serde(default)]
    default_scope: bool,
}

impl ProvisionBody {
    fn into_request(self, container: String) -> ProvisionRequest {
        ProvisionRequest {
            container,
            path: self.path,
            owner: self.owner,
            tenant_code: self.tenant_code,
            default_scope: self.default_scope,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeBody {
    #[serde(flatten)]
    request: ProvisionBody,
    failed_stage: ProvisionStage,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResponse {
    pub success: bool,
    /// The committed stage on success, the failing stage otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<ProvisionStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub resumable: bool,
}

#[derive(Deserialize)]
struct AclParams {
    path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AclResponse {
    pub path: String,
    pub entries: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/containers", get(list_containers))
        .route(
            "/containers/{container}/directories",
            get(list_directories).post(provision),
        )
        .route("/containers/{container}/directories/resume", post(resume))
        .route("/containers/{container}/acl", get(get_acl))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn list_containers(State(state): State<AppState>) -> Json<ListResponse<ContainerItem>> {
    let result: Result<Vec<_>, _> = state
        .query
        .list_containers()
        .map_ok(|c| ContainerItem { name: c.name })
        .try_collect()
        .await;
    match result {
        Ok(items) => Json(ListResponse { items, error: None }),
        Err(err) => {
            warn!("listing containers failed: {err}");
            Json(ListResponse::degraded())
        }
    }
}

async fn list_directories(
    State(state): State<AppState>,
    Path(container): Path<String>,
) -> Json<ListResponse<DirectoryRecord>> {
    match state.query.list_directories(&container).try_collect().await {
        Ok(items) => Json(ListResponse { items, error: None }),
        Err(err) => {
            warn!("listing directories of {container} failed: {err}");
            Json(ListResponse::degraded())
        }
    }
}

async fn provision(
    State(state): State<AppState>,
    Path(container): Path<String>,
    Json(body): Json<ProvisionBody>,
) -> (StatusCode, Json<ProvisionResponse>) {
    let request = body.into_request(container);
    let result = state.provisioner.provision(&request, &state.cancellation()).await;
    respond(result)
}

async fn resume(
    State(state): State<AppState>,
    Path(container): Path<String>,
    Json(body): Json<ResumeBody>,
) -> (StatusCode, Json<ProvisionResponse>) {
    let request = body.request.into_request(container);
    let result = state
        .provisioner
        .resume(&request, body.failed_stage, &state.cancellation())
        .await;
    respond(result)
}

async fn get_acl(
    State(state): State<AppState>,
    Path(container): Path<String>,
    Query(params): Query<AclParams>,
) -> Result<Json<AclResponse>, StatusCode> {
    let path = params.path.unwrap_or_else(|| "/".to_string());
    match state.query.access_control(&container, &path).await {
        Ok(entries) => Ok(Json(AclResponse {
            path,
            entries: entries.iter().map(AccessControlEntry::to_string).collect(),
        })),
        Err(err) => {
            warn!("reading ACL of {container}{path} failed: {err}");
            Err(match err.storage_error() {
                StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
                StorageError::InvalidPath(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            })
        }
    }
}

fn respond(result: ProvisionResult) -> (StatusCode, Json<ProvisionResponse>) {
    match result.failure {
        None => (
            StatusCode::CREATED,
            Json(ProvisionResponse {
                success: true,
                stage: Some(result.stage),
                error: None,
                resumable: false,
            }),
        ),
        Some(failure) => {
            let status = match failure.cause {
                ProvisionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                ProvisionError::DuplicateTenant { .. } => StatusCode::CONFLICT,
                ProvisionError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
                ProvisionError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(ProvisionResponse {
                    success: false,
                    stage: Some(failure.stage),
                    resumable: failure.cause.is_resumable(),
                    error: Some(ErrorBody {
                        kind: failure.cause.kind().to_string(),
                        message: public_message(&failure.cause).to_string(),
                    }),
                }),
            )
        }
    }
}

fn public_message(err: &ProvisionError) -> &'static str {
    match err.kind() {
        "invalidRequest" => "the request is incomplete or malformed",
        "duplicateTenant" => "a directory already exists at this path",
        "notImplemented" => "this step is not available yet",
        "partialPropagation" => "access rights were only partially applied",
        "permission" => "the service account is not allowed to do this",
        "notFound" => "the container or directory does not exist",
        "cancelled" => "the operation ran past its deadline; resume from the reported stage",
        _ => "the storage service could not complete the request",
    }
}
