//! Control plane regression tests.
//!
//! Drives the assembled router the way operators and devices do: REST
//! calls through `oneshot`, and a device session over a real WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ed25519_dalek::SigningKey;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use safeedge_api::{ApiState, build_router};
use safeedge_registry::{
    ConnectivityRegistry, ControlMessage, DeviceMessage, LivenessTracker, ManualClock,
};
use safeedge_rollout::{
    ArtifactVerifier, EngineConfig, NewRollout, RolloutEngine, TrustedKeys, hash_content,
    sign_artifact,
};
use safeedge_state::*;

const NOW: u64 = 1_700_000_000;

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[9; 32])
}

fn test_state() -> ApiState {
    let store = StateStore::open_in_memory().unwrap();
    let repo: Arc<dyn FleetRepository> = Arc::new(store.clone());
    let clock = Arc::new(ManualClock::new(NOW));
    let registry = Arc::new(ConnectivityRegistry::new());
    let liveness = Arc::new(LivenessTracker::new(repo.clone(), clock.clone()));
    let mut trusted = TrustedKeys::new();
    trusted.insert("release", signing_key().verifying_key());
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

fn device_body(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "org_id": "org-1",
        "public_key": format!("pk-{id}"),
        "tunnel_address": "100.64.0.9",
        "platform": "linux/arm64",
        "version": "1.3.0",
        "group_tag": "warehouse-5",
    })
}

fn artifact_body() -> serde_json::Value {
    let content_hash = hash_content(b"edge-agent 2.0");
    let signature = sign_artifact(&signing_key(), ArtifactType::Container, &content_hash).unwrap();
    serde_json::json!({
        "id": "art-1",
        "org_id": "org-1",
        "artifact_type": "container",
        "content_hash": content_hash,
        "signature": signature,
        "signing_key_id": "release",
        "size_bytes": 14,
    })
}

fn rollout_request() -> NewRollout {
    NewRollout {
        org_id: "org-1".to_string(),
        artifact_id: "art-1".to_string(),
        selector: DeviceSelector::new().with("site_tag", "warehouse-5"),
        canary_percent: 100,
        soak_secs: 60,
        apply_timeout_secs: None,
        health_check: HealthCheckSpec {
            endpoint: "http://127.0.0.1:8080/healthz".to_string(),
            timeout_secs: 5,
        },
    }
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_of(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

// ── REST ───────────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint() {
    let router = build_router(test_state());
    let resp = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_of(resp).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["status"], "ok");
}

#[tokio::test]
async fn device_inventory_reports_connectivity() {
    let router = build_router(test_state());

    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/devices", &device_body("dev-1")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = router.clone().oneshot(get("/api/v1/devices")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_of(resp).await;
    let devices = json["data"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["id"], "dev-1");
    assert_eq!(devices[0]["online"], false);
    assert_eq!(devices[0]["connected"], false);

    let resp = router
        .oneshot(get("/api/v1/devices/dev-404"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_of(resp).await["success"], false);
}

#[tokio::test]
async fn rollout_lifecycle_over_rest() {
    let router = build_router(test_state());
    for id in ["dev-1", "dev-2"] {
        let resp = router
            .clone()
            .oneshot(post_json("/api/v1/devices", &device_body(id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/artifacts", &artifact_body()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let body = serde_json::to_value(rollout_request()).unwrap();
    let resp = router
        .clone()
        .oneshot(post_json("/api/v1/rollouts", &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let json = json_of(resp).await;
    assert_eq!(json["data"]["state"], "draft");
    let id = json["data"]["id"].as_str().unwrap().to_string();

    let resp = router
        .clone()
        .oneshot(post_json(&format!("/api/v1/rollouts/{id}/start"), &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_of(resp).await["data"]["state"], "canary");

    let resp = router
        .clone()
        .oneshot(get(&format!("/api/v1/rollouts/{id}/devices")))
        .await
        .unwrap();
    let json = json_of(resp).await;
    let rows = json["data"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["status"] == "pending"));

    let resp = router
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/rollouts/{id}/abort"),
            &serde_json::json!({"reason": "regression test"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_of(resp).await;
    assert_eq!(json["data"]["state"], "failed");
    assert_eq!(json["data"]["failure_reason"], "regression test");

    let resp = router.oneshot(get("/api/v1/rollouts/stuck")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(json_of(resp).await["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn untrusted_artifact_start_is_unprocessable() {
    let state = test_state();
    let router = build_router(state.clone());
    router
        .clone()
        .oneshot(post_json("/api/v1/devices", &device_body("dev-1")))
        .await
        .unwrap();
    let mut artifact = artifact_body();
    artifact["signing_key_id"] = "unknown-key".into();
    router
        .clone()
        .oneshot(post_json("/api/v1/artifacts", &artifact))
        .await
        .unwrap();
    let rollout = state.engine.create(rollout_request()).await.unwrap();

    let resp = router
        .oneshot(post_json(
            &format!("/api/v1/rollouts/{}/start", rollout.id),
            &serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(state.engine.get(&rollout.id).unwrap().state, RolloutState::Draft);
}

// ── Device stream ──────────────────────────────────────────────────

async fn serve(state: ApiState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    addr
}

fn text(msg: &DeviceMessage) -> Message {
    Message::Text(serde_json::to_string(msg).unwrap().into())
}

async fn next_command<S>(ws: &mut S) -> ControlMessage
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_for_status(state: &ApiState, rollout_id: &str, device_id: &str, want: DeviceRolloutStatus) {
    for _ in 0..100 {
        let row = state
            .store
            .get_rollout_device_status(rollout_id, device_id)
            .unwrap()
            .unwrap();
        if row.status == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{device_id} never reached {want:?}");
}

#[tokio::test]
async fn device_session_over_websocket() {
    let state = test_state();
    let addr = serve(state.clone()).await;
    let router = build_router(state.clone());
    router
        .clone()
        .oneshot(post_json("/api/v1/devices", &device_body("dev-1")))
        .await
        .unwrap();
    router
        .oneshot(post_json("/api/v1/artifacts", &artifact_body()))
        .await
        .unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}/api/v1/devices/dev-1/stream"))
        .await
        .unwrap();

    // Heartbeat round trip.
    ws.send(text(&DeviceMessage::Heartbeat {
        device_id: "dev-1".to_string(),
        timestamp: 42,
        echo_token: "tok".to_string(),
        agent_version: "1.3.0".to_string(),
        metrics: Default::default(),
    }))
    .await
    .unwrap();
    assert_eq!(
        next_command(&mut ws).await,
        ControlMessage::HeartbeatAck {
            timestamp: 42,
            echo_token: "tok".to_string(),
        }
    );
    assert!(state.registry.is_connected("dev-1").await);
    assert!(state.liveness.is_device_online("dev-1"));

    // The device receives its update over the stream.
    let rollout = state.engine.create(rollout_request()).await.unwrap();
    state.engine.start(&rollout.id).await.unwrap();
    match next_command(&mut ws).await {
        ControlMessage::ApplyUpdate {
            rollout_id,
            artifact_id,
            ..
        } => {
            assert_eq!(rollout_id, rollout.id);
            assert_eq!(artifact_id, "art-1");
        }
        other => panic!("expected apply_update, got {other:?}"),
    }

    ws.send(text(&DeviceMessage::UpdateAcknowledged {
        device_id: "dev-1".to_string(),
        rollout_id: rollout.id.clone(),
        status: safeedge_registry::AckStatus::Applied,
    }))
    .await
    .unwrap();
    wait_for_status(&state, &rollout.id, "dev-1", DeviceRolloutStatus::InProgress).await;

    ws.send(text(&DeviceMessage::HealthReport {
        device_id: "dev-1".to_string(),
        rollout_id: rollout.id.clone(),
        healthy: true,
        detail: None,
    }))
    .await
    .unwrap();
    wait_for_status(&state, &rollout.id, "dev-1", DeviceRolloutStatus::Healthy).await;

    // Closing the socket drops the device from the registry.
    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if !state.registry.is_connected("dev-1").await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("device still registered after close");
}

#[tokio::test]
async fn stream_refused_for_suspended_device() {
    let state = test_state();
    let addr = serve(state.clone()).await;
    let router = build_router(state.clone());
    router
        .clone()
        .oneshot(post_json("/api/v1/devices", &device_body("dev-1")))
        .await
        .unwrap();
    let resp = router
        .oneshot(post_json("/api/v1/devices/dev-1/suspend", &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let result = connect_async(format!("ws://{addr}/api/v1/devices/dev-1/stream")).await;
    assert!(result.is_err());
    assert!(!state.registry.is_connected("dev-1").await);
}
