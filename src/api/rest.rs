//! REST API Handlers
//!
//! Volume, snapshot, export and manage endpoints. Errors are returned as
//! [`ApiErrorResponse`] bodies with a status derived from the error kind.

use crate::driver::{
    CloneMode, ConnectorInfo, ImageRef, ProvisioningMode, SnapshotSpec, VolumeManager, VolumeSpec,
};
use crate::error::{Error, Result};
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Volume creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub id: String,
    pub size_gib: u64,
    #[serde(default)]
    pub provisioning: Option<ProvisioningMode>,
    /// Blank volume when absent
    #[serde(default)]
    pub source: Option<VolumeSource>,
}

/// What a new volume is cloned from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    Snapshot {
        volume_id: String,
        snapshot_id: String,
    },
    Volume {
        volume_id: String,
        /// Copy-on-write unless stated
        #[serde(default)]
        mode: Option<CloneMode>,
    },
    Image {
        image: ImageRef,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendVolumeRequest {
    pub new_size_gib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub id: String,
}

/// Request to adopt an existing zvol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageVolumeRequest {
    pub id: String,
    /// Full dataset path, or a name relative to the parent dataset
    pub existing_name: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// HTTP status for a driver error
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidSize { .. }
        | Error::UnsupportedFormat { .. }
        | Error::InvalidIdentifier { .. } => StatusCode::BAD_REQUEST,
        Error::SnapshotInUse { .. } | Error::InvalidState { .. } | Error::AlreadyExists { .. } => {
            StatusCode::CONFLICT
        }
        Error::CapacityExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
        Error::Auth(_) | Error::Appliance { .. } => StatusCode::BAD_GATEWAY,
        Error::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }

    let details = match err {
        Error::Appliance {
            status: Some(code), ..
        } => Some(format!("appliance returned HTTP {}", code)),
        _ => None,
    };
    (
        status,
        Json(ApiErrorResponse {
            error: err.kind().to_string(),
            message: err.to_string(),
            details,
        }),
    )
        .into_response()
}

fn reply<T: Serialize>(status: StatusCode, result: Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(&e),
    }
}

fn no_content(result: Result<()>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    manager: VolumeManager,
}

impl RestRouter {
    pub fn new(manager: VolumeManager) -> Self {
        Self { manager }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            manager: self.manager,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume).get(list_volumes))
            .route("/v1/volumes/:id", get(get_volume).delete(delete_volume))
            .route("/v1/volumes/:id/extend", post(extend_volume))
            .route("/v1/volumes/:id/attach", post(attach_volume))
            .route("/v1/volumes/:id/detach", post(detach_volume))
            .route("/v1/volumes/:id/unmanage", post(unmanage_volume))
            .route("/v1/manage", post(manage_volume))
            // Snapshot endpoints
            .route("/v1/volumes/:id/snapshots", post(create_snapshot))
            .route(
                "/v1/volumes/:id/snapshots/:sid",
                get(get_snapshot).delete(delete_snapshot),
            )
            // Stats & health
            .route("/v1/stats", get(backend_stats))
            .route("/metrics", get(metrics))
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    manager: VolumeManager,
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    info!("Creating volume {} ({} GiB)", request.id, request.size_gib);

    let spec = VolumeSpec {
        id: request.id,
        size_gib: request.size_gib,
        provisioning: request.provisioning,
    };
    let manager = &state.manager;
    let result = match request.source {
        None => manager.create_volume(spec).await,
        Some(VolumeSource::Snapshot {
            volume_id,
            snapshot_id,
        }) => {
            manager
                .create_volume_from_snapshot(spec, &volume_id, &snapshot_id)
                .await
        }
        Some(VolumeSource::Volume { volume_id, mode }) => {
            manager
                .clone_volume(spec, &volume_id, mode.unwrap_or(CloneMode::CopyOnWrite))
                .await
        }
        Some(VolumeSource::Image { image }) => manager.clone_from_image(spec, &image).await,
    };

    // Full copies are still transferring when they are returned.
    let status = match &result {
        Ok(volume) if volume.transfer.is_some() => StatusCode::ACCEPTED,
        _ => StatusCode::CREATED,
    };
    reply(status, result)
}

async fn list_volumes(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.manager.list_volumes())).into_response()
}

async fn get_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    reply(StatusCode::OK, state.manager.get_volume(&id).await)
}

async fn delete_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    no_content(state.manager.delete_volume(&id).await)
}

async fn extend_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExtendVolumeRequest>,
) -> Response {
    reply(
        StatusCode::OK,
        state.manager.extend_volume(&id, request.new_size_gib).await,
    )
}

async fn attach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    connector: Option<Json<ConnectorInfo>>,
) -> Response {
    let connector = connector.map(|Json(c)| c).unwrap_or_default();
    reply(StatusCode::OK, state.manager.attach(&id, &connector).await)
}

async fn detach_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    no_content(state.manager.detach(&id).await)
}

async fn unmanage_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    no_content(state.manager.unmanage(&id).await)
}

async fn manage_volume(
    State(state): State<AppState>,
    Json(request): Json<ManageVolumeRequest>,
) -> Response {
    reply(
        StatusCode::CREATED,
        state
            .manager
            .manage_existing(&request.id, &request.existing_name)
            .await,
    )
}

// =============================================================================
// Snapshot Handlers
// =============================================================================

async fn create_snapshot(
    State(state): State<AppState>,
    Path(volume_id): Path<String>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Response {
    reply(
        StatusCode::CREATED,
        state
            .manager
            .create_snapshot(SnapshotSpec {
                id: request.id,
                volume_id,
            })
            .await,
    )
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path((volume_id, snapshot_id)): Path<(String, String)>,
) -> Response {
    reply(
        StatusCode::OK,
        state.manager.get_snapshot(&volume_id, &snapshot_id).await,
    )
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Path((volume_id, snapshot_id)): Path<(String, String)>,
) -> Response {
    no_content(state.manager.delete_snapshot(&volume_id, &snapshot_id).await)
}

// =============================================================================
// Stats & Health
// =============================================================================

async fn backend_stats(State(state): State<AppState>) -> Response {
    reply(StatusCode::OK, state.manager.backend_stats().await)
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.manager.metrics().render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: the appliance answers and the parent dataset is usable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.manager.check_setup().await {
        Ok(()) => (StatusCode::OK, "ready".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::{Fault, FaultRule, HttpMethod, InMemoryAppliance};
    use crate::driver::testing::context;
    use crate::driver::{Snapshot, Volume, VolumeState};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router() -> (Router, Arc<InMemoryAppliance>) {
        let (ctx, appliance) = context();
        (RestRouter::new(VolumeManager::from_context(ctx)).build(), appliance)
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::volume_not_found("a")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&Error::SnapshotInUse {
                snapshot: "s".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::CapacityExceeded("full".into())),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            status_for(&Error::TransientNetwork("reset".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::Configuration("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_volume_lifecycle_over_http() {
        let (router, appliance) = router();

        let (status, body) = send(
            &router,
            "POST",
            "/v1/volumes",
            Some(json!({"id": "a", "size_gib": 2, "provisioning": "thin"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let volume: Volume = serde_json::from_slice(&body).unwrap();
        assert_eq!(volume.state, VolumeState::Available);

        let (status, body) = send(
            &router,
            "POST",
            "/v1/volumes/a/extend",
            Some(json!({"new_size_gib": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let volume: Volume = serde_json::from_slice(&body).unwrap();
        assert_eq!(volume.size_gib, 4);

        let (status, body) = send(&router, "GET", "/v1/volumes", None).await;
        assert_eq!(status, StatusCode::OK);
        let volumes: Vec<Volume> = serde_json::from_slice(&body).unwrap();
        assert_eq!(volumes.len(), 1);

        let (status, _) = send(&router, "DELETE", "/v1/volumes/a", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&router, "DELETE", "/v1/volumes/a", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(appliance.dataset("tank/cinder/volume-a").is_none());

        let (status, body) = send(&router, "GET", "/v1/volumes/a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ApiErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.error, "not_found");
    }

    #[tokio::test]
    async fn test_snapshot_and_clone_over_http() {
        let (router, _) = router();
        send(&router, "POST", "/v1/volumes", Some(json!({"id": "a", "size_gib": 1}))).await;

        let (status, body) = send(
            &router,
            "POST",
            "/v1/volumes/a/snapshots",
            Some(json!({"id": "s1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let snapshot: Snapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.snapshot_path, "tank/cinder/volume-a@snapshot-s1");

        let (status, _) = send(
            &router,
            "POST",
            "/v1/volumes",
            Some(json!({
                "id": "b",
                "size_gib": 1,
                "source": {"type": "snapshot", "volume_id": "a", "snapshot_id": "s1"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&router, "DELETE", "/v1/volumes/a/snapshots/s1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let error: ApiErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.error, "snapshot_in_use");

        let (status, _) = send(&router, "GET", "/v1/volumes/a/snapshots/s1", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_attach_detach_over_http() {
        let (router, appliance) = router();
        send(&router, "POST", "/v1/volumes", Some(json!({"id": "a", "size_gib": 1}))).await;

        let (status, body) = send(
            &router,
            "POST",
            "/v1/volumes/a/attach",
            Some(json!({"initiator": "iqn.1993-08.org.debian:01:abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let info: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["target_lun"], 0);
        assert_eq!(appliance.target_count(), 1);

        let (status, _) = send(&router, "POST", "/v1/volumes/a/detach", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(appliance.target_count(), 0);
    }

    #[tokio::test]
    async fn test_errors_map_to_statuses() {
        let (router, appliance) = router();

        let (status, _) = send(
            &router,
            "POST",
            "/v1/volumes",
            Some(json!({"id": "bad id", "size_gib": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        appliance.set_capacity(crate::driver::model::GIB);
        let (status, body) = send(
            &router,
            "POST",
            "/v1/volumes",
            Some(json!({"id": "big", "size_gib": 50, "provisioning": "thick"})),
        )
        .await;
        assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
        let error: ApiErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.error, "capacity_exceeded");

        appliance.inject(FaultRule::new(
            HttpMethod::Post,
            "pool/dataset",
            Fault::Status(500, "pool is suspended".into()),
        ));
        let (status, body) = send(
            &router,
            "POST",
            "/v1/volumes",
            Some(json!({"id": "c", "size_gib": 1, "provisioning": "thin"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let error: ApiErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.details.as_deref(), Some("appliance returned HTTP 500"));
    }

    #[tokio::test]
    async fn test_manage_over_http() {
        let (router, appliance) = router();
        appliance.insert_zvol("tank/cinder/legacy", 2 * crate::driver::model::GIB);

        let (status, body) = send(
            &router,
            "POST",
            "/v1/manage",
            Some(json!({"id": "m", "existing_name": "legacy"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let volume: Volume = serde_json::from_slice(&body).unwrap();
        assert_eq!(volume.size_gib, 2);

        let (status, _) = send(&router, "POST", "/v1/volumes/m/unmanage", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(appliance.dataset("tank/cinder/legacy").is_some());
    }

    #[tokio::test]
    async fn test_stats_metrics_and_health() {
        let (router, _) = router();

        let (status, body) = send(&router, "GET", "/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        let stats: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["vendor_name"], "iXsystems");

        let (status, body) = send(&router, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("backend_stats"));

        let (status, _) = send(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
