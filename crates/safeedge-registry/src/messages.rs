//! Typed device ⇄ control plane messages.
//!
//! One sum type per direction. The wire form is JSON with a `kind` tag,
//! e.g. `{"kind":"heartbeat","device_id":"dev-1",...}`.

use serde::{Deserialize, Serialize};

/// Device-reported resource usage carried on heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatMetrics {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub uptime_secs: u64,
}

/// Outcome a device reports for an update command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The update was installed and started.
    Applied,
    /// The update could not be installed.
    Failed,
    /// The device reverted after a Rollback command.
    RolledBack,
}

/// Messages received from devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceMessage {
    Heartbeat {
        device_id: String,
        /// Device-local unix timestamp, echoed back in the ack.
        timestamp: u64,
        #[serde(default)]
        echo_token: String,
        #[serde(default)]
        agent_version: String,
        #[serde(default)]
        metrics: HeartbeatMetrics,
    },
    HealthReport {
        device_id: String,
        rollout_id: String,
        healthy: bool,
        #[serde(default)]
        detail: Option<String>,
    },
    UpdateAcknowledged {
        device_id: String,
        rollout_id: String,
        status: AckStatus,
    },
}

impl DeviceMessage {
    /// The device this message claims to come from.
    pub fn device_id(&self) -> &str {
        match self {
            Self::Heartbeat { device_id, .. }
            | Self::HealthReport { device_id, .. }
            | Self::UpdateAcknowledged { device_id, .. } => device_id,
        }
    }
}

/// Commands sent to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    ApplyUpdate {
        rollout_id: String,
        artifact_id: String,
        content_hash: String,
        /// Hex-encoded detached signature over the artifact signing context.
        signature: String,
    },
    Rollback {
        rollout_id: String,
        reason: String,
    },
    HeartbeatAck {
        timestamp: u64,
        echo_token: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_message_wire_format() {
        let json = r#"{"kind":"update_acknowledged","device_id":"dev-1","rollout_id":"r-1","status":"applied"}"#;
        let msg: DeviceMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            DeviceMessage::UpdateAcknowledged {
                device_id: "dev-1".to_string(),
                rollout_id: "r-1".to_string(),
                status: AckStatus::Applied,
            }
        );
        assert_eq!(msg.device_id(), "dev-1");
    }

    #[test]
    fn heartbeat_optional_fields_default() {
        let json = r#"{"kind":"heartbeat","device_id":"dev-1","timestamp":42}"#;
        let msg: DeviceMessage = serde_json::from_str(json).unwrap();
        match msg {
            DeviceMessage::Heartbeat {
                echo_token,
                metrics,
                ..
            } => {
                assert!(echo_token.is_empty());
                assert_eq!(metrics, HeartbeatMetrics::default());
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let json = r#"{"kind":"reboot","device_id":"dev-1"}"#;
        assert!(serde_json::from_str::<DeviceMessage>(json).is_err());
    }

    #[test]
    fn control_message_tagged() {
        let msg = ControlMessage::Rollback {
            rollout_id: "r-1".to_string(),
            reason: "canary unhealthy".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "rollback");
        assert_eq!(json["rollout_id"], "r-1");
    }
}
