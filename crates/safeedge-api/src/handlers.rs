//! REST API handlers for the device inventory and artifact metadata.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use safeedge_rollout::verifier::parse_content_hash;
use safeedge_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub(crate) fn state_error_response(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Conflict(_) | StateError::StaleState { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "connected_devices": state.registry.connected_count().await,
    }))
}

// ── Devices ────────────────────────────────────────────────────

/// A device record with its derived connectivity.
#[derive(Debug, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    /// Heartbeat seen within the offline threshold.
    pub online: bool,
    /// Holds a live command channel right now.
    pub connected: bool,
}

async fn device_view(state: &ApiState, device: Device) -> DeviceView {
    DeviceView {
        online: state.liveness.is_online(&device),
        connected: state.registry.is_connected(&device.id).await,
        device,
    }
}

/// Register device body.
#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub id: String,
    pub org_id: String,
    pub public_key: String,
    #[serde(default)]
    pub tunnel_public_key: String,
    #[serde(default)]
    pub tunnel_address: String,
    pub platform: String,
    pub version: String,
    #[serde(default)]
    pub group_tag: String,
}

/// GET /api/v1/devices
pub async fn list_devices(State(state): State<ApiState>) -> Response {
    let devices = match state.store.list_devices() {
        Ok(devices) => devices,
        Err(e) => return state_error_response(&e),
    };
    let mut views = Vec::with_capacity(devices.len());
    for device in devices {
        views.push(device_view(&state, device).await);
    }
    ApiResponse::ok(views).into_response()
}

/// GET /api/v1/devices/{id}
pub async fn get_device(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_device(&id) {
        Ok(Some(device)) => ApiResponse::ok(device_view(&state, device).await).into_response(),
        Ok(None) => error_response("device not found", StatusCode::NOT_FOUND),
        Err(e) => state_error_response(&e),
    }
}

/// POST /api/v1/devices
pub async fn register_device(
    State(state): State<ApiState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Response {
    if req.id.is_empty() || req.org_id.is_empty() || req.public_key.is_empty() {
        return error_response(
            "id, org_id and public_key are required",
            StatusCode::BAD_REQUEST,
        );
    }
    match state.store.get_device(&req.id) {
        Ok(Some(_)) => {
            return error_response("device already registered", StatusCode::CONFLICT);
        }
        Ok(None) => {}
        Err(e) => return state_error_response(&e),
    }

    let device = Device {
        id: req.id,
        org_id: req.org_id,
        public_key: req.public_key,
        tunnel_public_key: req.tunnel_public_key,
        tunnel_address: req.tunnel_address,
        platform: req.platform,
        version: req.version,
        group_tag: req.group_tag,
        status: DeviceStatus::Active,
        last_seen_at: None,
        created_at: state.clock.now(),
    };
    match state.store.put_device(&device) {
        Ok(()) => {
            info!(device_id = %device.id, org_id = %device.org_id, "device registered");
            (StatusCode::CREATED, ApiResponse::ok(device)).into_response()
        }
        Err(e) => state_error_response(&e),
    }
}

/// POST /api/v1/devices/{id}/suspend
pub async fn suspend_device(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    set_status(&state, &id, DeviceStatus::Suspended).await
}

/// POST /api/v1/devices/{id}/reactivate
pub async fn reactivate_device(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_device(&id) {
        Ok(Some(device)) if device.status == DeviceStatus::Decommissioned => {
            error_response("device is decommissioned", StatusCode::CONFLICT)
        }
        Ok(Some(_)) => set_status(&state, &id, DeviceStatus::Active).await,
        Ok(None) => error_response("device not found", StatusCode::NOT_FOUND),
        Err(e) => state_error_response(&e),
    }
}

async fn set_status(state: &ApiState, id: &str, status: DeviceStatus) -> Response {
    match state.store.set_device_status(id, status) {
        Ok(device) => {
            info!(device_id = %id, ?status, "device status changed");
            ApiResponse::ok(device_view(state, device).await).into_response()
        }
        Err(e) => state_error_response(&e),
    }
}

// ── Artifacts ──────────────────────────────────────────────────

/// Register artifact body. The bytes themselves live in blob storage.
#[derive(Debug, Deserialize)]
pub struct CreateArtifactRequest {
    pub id: String,
    pub org_id: String,
    pub artifact_type: ArtifactType,
    pub content_hash: String,
    pub signature: String,
    pub signing_key_id: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// POST /api/v1/artifacts
pub async fn create_artifact(
    State(state): State<ApiState>,
    Json(req): Json<CreateArtifactRequest>,
) -> Response {
    if req.id.is_empty() || req.org_id.is_empty() {
        return error_response("id and org_id are required", StatusCode::BAD_REQUEST);
    }
    if let Err(reason) = parse_content_hash(&req.content_hash) {
        return error_response(&reason, StatusCode::BAD_REQUEST);
    }

    let artifact = Artifact {
        id: req.id,
        org_id: req.org_id,
        artifact_type: req.artifact_type,
        content_hash: req.content_hash,
        signature: req.signature,
        signing_key_id: req.signing_key_id,
        size_bytes: req.size_bytes,
        created_at: state.clock.now(),
    };
    match state.store.create_artifact(&artifact) {
        Ok(()) => {
            info!(artifact_id = %artifact.id, key_id = %artifact.signing_key_id, "artifact registered");
            (StatusCode::CREATED, ApiResponse::ok(artifact)).into_response()
        }
        Err(e) => state_error_response(&e),
    }
}

/// GET /api/v1/artifacts/{id}
pub async fn get_artifact(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_artifact(&id) {
        Ok(Some(artifact)) => ApiResponse::ok(artifact).into_response(),
        Ok(None) => error_response("artifact not found", StatusCode::NOT_FOUND),
        Err(e) => state_error_response(&e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use safeedge_registry::{ConnectivityRegistry, LivenessTracker, ManualClock};
    use safeedge_rollout::{ArtifactVerifier, EngineConfig, RolloutEngine, TrustedKeys};

    pub(crate) const NOW: u64 = 1_700_000_000;

    pub(crate) fn test_state_with_keys(trusted: TrustedKeys) -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let repo: Arc<dyn FleetRepository> = Arc::new(store.clone());
        let clock = Arc::new(ManualClock::new(NOW));
        let registry = Arc::new(ConnectivityRegistry::new());
        let liveness = Arc::new(LivenessTracker::new(repo.clone(), clock.clone()));
        let engine = RolloutEngine::new(
            repo,
            registry.clone(),
            liveness.clone(),
            ArtifactVerifier::new(trusted),
            clock.clone(),
            EngineConfig::default(),
        );
        ApiState::new(store, registry, liveness, engine, clock)
    }

    pub(crate) fn test_state() -> ApiState {
        test_state_with_keys(TrustedKeys::new())
    }

    pub(crate) fn test_device(id: &str, group: &str) -> RegisterDeviceRequest {
        RegisterDeviceRequest {
            id: id.to_string(),
            org_id: "org-1".to_string(),
            public_key: format!("pk-{id}"),
            tunnel_public_key: String::new(),
            tunnel_address: "100.64.0.2".to_string(),
            platform: "linux/arm64".to_string(),
            version: "1.3.0".to_string(),
            group_tag: group.to_string(),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let resp = health(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_devices_empty() {
        let resp = list_devices(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_and_get_device() {
        let state = test_state();
        let resp = register_device(State(state.clone()), Json(test_device("dev-1", "w5"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let stored = state.store.get_device("dev-1").unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Active);
        assert_eq!(stored.created_at, NOW);

        let resp = get_device(State(state), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_duplicate_device_conflicts() {
        let state = test_state();
        register_device(State(state.clone()), Json(test_device("dev-1", "w5"))).await;
        let resp = register_device(State(state), Json(test_device("dev-1", "w6"))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn register_device_requires_identity() {
        let mut req = test_device("dev-1", "w5");
        req.public_key.clear();
        let resp = register_device(State(test_state()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_nonexistent_device() {
        let resp = get_device(State(test_state()), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn suspend_and_reactivate_device() {
        let state = test_state();
        register_device(State(state.clone()), Json(test_device("dev-1", "w5"))).await;

        let resp = suspend_device(State(state.clone()), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.store.get_device("dev-1").unwrap().unwrap().status,
            DeviceStatus::Suspended
        );

        let resp = reactivate_device(State(state.clone()), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.store.get_device("dev-1").unwrap().unwrap().status,
            DeviceStatus::Active
        );
    }

    #[tokio::test]
    async fn decommissioned_device_stays_decommissioned() {
        let state = test_state();
        register_device(State(state.clone()), Json(test_device("dev-1", "w5"))).await;
        state
            .store
            .set_device_status("dev-1", DeviceStatus::Decommissioned)
            .unwrap();

        let resp = reactivate_device(State(state), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn suspend_nonexistent_device() {
        let resp = suspend_device(State(test_state()), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    fn artifact_request(hash: &str) -> CreateArtifactRequest {
        CreateArtifactRequest {
            id: "art-1".to_string(),
            org_id: "org-1".to_string(),
            artifact_type: ArtifactType::Container,
            content_hash: hash.to_string(),
            signature: "00".repeat(64),
            signing_key_id: "k1".to_string(),
            size_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn create_and_get_artifact() {
        let state = test_state();
        let resp = create_artifact(State(state.clone()), Json(artifact_request(&"ab".repeat(32)))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = get_artifact(State(state), Path("art-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn artifact_with_bad_hash_rejected() {
        let resp = create_artifact(State(test_state()), Json(artifact_request("not-a-hash"))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn artifact_cannot_be_redefined() {
        let state = test_state();
        create_artifact(State(state.clone()), Json(artifact_request(&"ab".repeat(32)))).await;
        let resp = create_artifact(State(state), Json(artifact_request(&"cd".repeat(32)))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
