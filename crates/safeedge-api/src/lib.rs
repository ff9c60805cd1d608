//! safeedge-api — REST API for the SafeEdge control plane.
//!
//! Provides axum route handlers for the device inventory, artifact
//! metadata and rollouts, and the WebSocket endpoint devices hold their
//! command stream on.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Control plane liveness probe |
//! | GET | `/api/v1/devices` | List devices with `online`/`connected` |
//! | POST | `/api/v1/devices` | Register a device record |
//! | GET | `/api/v1/devices/{id}` | Get a device |
//! | POST | `/api/v1/devices/{id}/suspend` | Suspend a device |
//! | POST | `/api/v1/devices/{id}/reactivate` | Reactivate a device |
//! | GET | `/api/v1/devices/{id}/stream` | WebSocket device session |
//! | POST | `/api/v1/artifacts` | Register artifact metadata |
//! | GET | `/api/v1/artifacts/{id}` | Get artifact metadata |
//! | GET | `/api/v1/rollouts` | List rollouts |
//! | POST | `/api/v1/rollouts` | Create a rollout in DRAFT |
//! | GET | `/api/v1/rollouts/stuck` | Rollouts needing attention |
//! | GET | `/api/v1/rollouts/{id}` | Get a rollout |
//! | GET | `/api/v1/rollouts/{id}/devices` | Per-device status rows |
//! | POST | `/api/v1/rollouts/{id}/start` | DRAFT → CANARY |
//! | POST | `/api/v1/rollouts/{id}/abort` | Abort into ROLLBACK |

pub mod handlers;
pub mod rollout_handlers;
pub mod stream;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use safeedge_registry::{Clock, ConnectivityRegistry, Dispatcher, LivenessTracker};
use safeedge_rollout::RolloutEngine;
use safeedge_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub registry: Arc<ConnectivityRegistry>,
    pub liveness: Arc<LivenessTracker>,
    pub engine: Arc<RolloutEngine>,
    pub dispatcher: Dispatcher,
    pub clock: Arc<dyn Clock>,
}

impl ApiState {
    /// Wire the handlers to the control plane. Inbound device events are
    /// routed to `engine`.
    pub fn new(
        store: StateStore,
        registry: Arc<ConnectivityRegistry>,
        liveness: Arc<LivenessTracker>,
        engine: Arc<RolloutEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher = Dispatcher::new(liveness.clone(), engine.clone());
        Self {
            store,
            registry,
            liveness,
            engine,
            dispatcher,
            clock,
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/devices", get(handlers::list_devices).post(handlers::register_device))
        .route("/devices/{id}", get(handlers::get_device))
        .route("/devices/{id}/suspend", post(handlers::suspend_device))
        .route("/devices/{id}/reactivate", post(handlers::reactivate_device))
        .route("/devices/{id}/stream", get(stream::device_stream))
        .route("/artifacts", post(handlers::create_artifact))
        .route("/artifacts/{id}", get(handlers::get_artifact))
        .route(
            "/rollouts",
            get(rollout_handlers::list_rollouts).post(rollout_handlers::create_rollout),
        )
        .route("/rollouts/stuck", get(rollout_handlers::stuck_rollouts))
        .route("/rollouts/{id}", get(rollout_handlers::get_rollout))
        .route("/rollouts/{id}/devices", get(rollout_handlers::list_rollout_devices))
        .route("/rollouts/{id}/start", post(rollout_handlers::start_rollout))
        .route("/rollouts/{id}/abort", post(rollout_handlers::abort_rollout))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health).with_state(state))
}
