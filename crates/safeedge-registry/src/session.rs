//! Per-device session loop.
//!
//! Transport adapters (the WebSocket endpoint, in-process test harnesses)
//! decode frames into [`DeviceMessage`]s and encode [`ControlMessage`]s;
//! everything between those two channels happens here.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::messages::{ControlMessage, DeviceMessage};
use crate::registry::ConnectivityRegistry;

/// Drive one device connection until its inbound stream ends.
///
/// Registers `outbound` as the device's command channel for the lifetime of
/// the session and unregisters it on exit, unless a newer session has
/// already replaced it. Returns the connection id the session ran under.
pub async fn run_device_session(
    registry: Arc<ConnectivityRegistry>,
    dispatcher: Dispatcher,
    device_id: String,
    mut inbound: mpsc::Receiver<DeviceMessage>,
    outbound: mpsc::Sender<ControlMessage>,
) -> String {
    let connection_id = registry.register(&device_id, outbound.clone()).await;
    info!(%device_id, %connection_id, "device session started");

    while let Some(message) = inbound.recv().await {
        let Some(reply) = dispatcher.dispatch(&device_id, message).await else {
            continue;
        };
        if outbound.send(reply).await.is_err() {
            warn!(%device_id, %connection_id, "outbound channel closed, ending session");
            break;
        }
    }

    registry.unregister(&device_id, &connection_id).await;
    info!(%device_id, %connection_id, "device session ended");
    connection_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{RecordingEvents, dispatcher};
    use crate::messages::{AckStatus, HeartbeatMetrics};

    fn heartbeat(device_id: &str, ts: u64) -> DeviceMessage {
        DeviceMessage::Heartbeat {
            device_id: device_id.to_string(),
            timestamp: ts,
            echo_token: format!("tok-{ts}"),
            agent_version: "0.3.0".to_string(),
            metrics: HeartbeatMetrics::default(),
        }
    }

    #[tokio::test]
    async fn session_registers_replies_and_unregisters() {
        let registry = Arc::new(ConnectivityRegistry::new());
        let events = Arc::new(RecordingEvents::default());
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        let task = tokio::spawn(run_device_session(
            registry.clone(),
            dispatcher(events.clone()),
            "dev-1".to_string(),
            in_rx,
            out_tx,
        ));

        in_tx.send(heartbeat("dev-1", 5)).await.unwrap();
        assert_eq!(
            out_rx.recv().await,
            Some(ControlMessage::HeartbeatAck {
                timestamp: 5,
                echo_token: "tok-5".to_string(),
            })
        );
        assert!(registry.is_connected("dev-1").await);

        // Commands routed through the registry land on the same channel.
        let cmd = ControlMessage::Rollback {
            rollout_id: "r-1".to_string(),
            reason: "abort".to_string(),
        };
        registry.send("dev-1", cmd.clone()).await.unwrap();
        assert_eq!(out_rx.recv().await, Some(cmd));

        in_tx
            .send(DeviceMessage::UpdateAcknowledged {
                device_id: "dev-1".to_string(),
                rollout_id: "r-1".to_string(),
                status: AckStatus::RolledBack,
            })
            .await
            .unwrap();

        drop(in_tx);
        task.await.unwrap();
        assert!(!registry.is_connected("dev-1").await);
        assert_eq!(events.acks.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn superseded_session_does_not_evict_replacement() {
        let registry = Arc::new(ConnectivityRegistry::new());
        let events = Arc::new(RecordingEvents::default());

        let (old_in_tx, old_in_rx) = mpsc::channel(1);
        let (old_out_tx, _old_out_rx) = mpsc::channel(8);
        let old = tokio::spawn(run_device_session(
            registry.clone(),
            dispatcher(events.clone()),
            "dev-1".to_string(),
            old_in_rx,
            old_out_tx,
        ));
        // Let the first session register.
        while !registry.is_connected("dev-1").await {
            tokio::task::yield_now().await;
        }
        let old_conn = registry.connection_id("dev-1").await.unwrap();

        let (new_out_tx, _new_out_rx) = mpsc::channel(8);
        let new_conn = registry.register("dev-1", new_out_tx).await;

        drop(old_in_tx);
        assert_eq!(old.await.unwrap(), old_conn);
        assert_eq!(registry.connection_id("dev-1").await, Some(new_conn));
    }
}
