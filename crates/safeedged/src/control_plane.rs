//! Control plane: wires the fleet subsystems together and serves them.
//!
//! In this mode, the daemon:
//! 1. Opens the redb state store
//! 2. Builds the connectivity registry, liveness tracker, trust verifier
//!    and rollout engine
//! 3. Runs the rollout reconciler in the background
//! 4. Serves the REST API and device streams over HTTP
//! 5. On Ctrl-C, stops accepting requests and stops the reconciler

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use safeedge_api::{ApiState, build_router};
use safeedge_registry::{Clock, ConnectivityRegistry, LivenessTracker, SystemClock};
use safeedge_rollout::{ArtifactVerifier, Reconciler, RolloutEngine, TrustedKeys};
use safeedge_state::{FleetRepository, StateStore};

use crate::config::DaemonConfig;

/// Assemble the handler state around `store`.
pub fn build_state(
    store: StateStore,
    config: &DaemonConfig,
    trusted: TrustedKeys,
    clock: Arc<dyn Clock>,
) -> ApiState {
    let repo: Arc<dyn FleetRepository> = Arc::new(store.clone());
    let registry =
        Arc::new(ConnectivityRegistry::new().with_send_timeout(config.rollout.send_timeout()));
    let liveness = Arc::new(
        LivenessTracker::new(repo.clone(), clock.clone())
            .with_heartbeat_interval(config.heartbeat_interval())
            .with_offline_after(config.offline_after()),
    );
    let engine = RolloutEngine::new(
        repo,
        registry.clone(),
        liveness.clone(),
        ArtifactVerifier::new(trusted),
        clock.clone(),
        config.engine_config(),
    );
    ApiState::new(store, registry, liveness, engine, clock)
}

/// Run the control plane until Ctrl-C.
pub async fn run_control_plane(config: DaemonConfig) -> anyhow::Result<()> {
    info!("SafeEdge control plane starting");

    let data_dir = &config.server.data_dir;
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("safeedge.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let trusted = config.trusted_keys()?;
    if trusted.is_empty() {
        warn!("no trusted signing keys configured, every rollout start will be refused");
    } else {
        info!(keys = trusted.len(), "trusted signing keys loaded");
    }

    let state = build_state(store, &config, trusted, Arc::new(SystemClock));
    info!(
        heartbeat_interval_secs = state.liveness.heartbeat_interval().as_secs(),
        offline_after_secs = state.liveness.offline_after().as_secs(),
        send_timeout_ms = config.rollout.send_timeout_ms,
        "registry and liveness tracker initialized"
    );
    if state.liveness.tolerated_missed_heartbeats() == 0 {
        warn!("offline_after allows no missed heartbeat, devices will flap offline");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let reconciler = Reconciler::new(state.engine.clone(), config.rollout.reconcile_interval());
    let reconcile_handle = tokio::spawn(reconciler.run(shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.http_port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = reconcile_handle.await;

    info!("SafeEdge control plane stopped");
    Ok(())
}
