//! Inbound dispatch — routes each device message to its handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::liveness::LivenessTracker;
use crate::messages::{AckStatus, ControlMessage, DeviceMessage};

/// Receiver of rollout-related device events.
///
/// Implemented by the rollout engine. Handlers must not block on network
/// I/O; they return once the event is recorded.
#[async_trait]
pub trait RolloutEvents: Send + Sync {
    async fn on_update_ack(&self, device_id: &str, rollout_id: &str, status: AckStatus);

    async fn on_health_report(
        &self,
        device_id: &str,
        rollout_id: &str,
        healthy: bool,
        detail: Option<String>,
    );
}

/// Routes inbound device messages by kind.
#[derive(Clone)]
pub struct Dispatcher {
    liveness: Arc<LivenessTracker>,
    events: Arc<dyn RolloutEvents>,
}

impl Dispatcher {
    pub fn new(liveness: Arc<LivenessTracker>, events: Arc<dyn RolloutEvents>) -> Self {
        Self { liveness, events }
    }

    /// Handle one message received on `session_device`'s channel.
    ///
    /// Returns the direct reply, if the message kind has one.
    pub async fn dispatch(
        &self,
        session_device: &str,
        message: DeviceMessage,
    ) -> Option<ControlMessage> {
        if message.device_id() != session_device {
            warn!(
                %session_device,
                claimed = %message.device_id(),
                "dropping message for another device"
            );
            return None;
        }

        match message {
            DeviceMessage::Heartbeat {
                device_id,
                timestamp,
                echo_token,
                agent_version,
                metrics,
            } => {
                debug!(
                    %device_id,
                    %agent_version,
                    cpu = metrics.cpu_percent,
                    mem = metrics.memory_used_bytes,
                    "heartbeat"
                );
                Some(self.liveness.record_heartbeat(&device_id, timestamp, &echo_token))
            }
            DeviceMessage::UpdateAcknowledged {
                device_id,
                rollout_id,
                status,
            } => {
                debug!(%device_id, %rollout_id, ?status, "update acknowledged");
                self.events.on_update_ack(&device_id, &rollout_id, status).await;
                None
            }
            DeviceMessage::HealthReport {
                device_id,
                rollout_id,
                healthy,
                detail,
            } => {
                debug!(%device_id, %rollout_id, healthy, "health report");
                self.events
                    .on_health_report(&device_id, &rollout_id, healthy, detail)
                    .await;
                None
            }
        }
    }
}
