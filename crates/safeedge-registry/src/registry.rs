//! Connectivity registry — which devices hold a live command channel.
//!
//! One channel handle per device. Registering again replaces the old
//! handle; the old physical connection is assumed dead or superseded.
//! All mutations take the registry-wide write lock. `send` only holds the
//! read lock long enough to clone the handle, so sends to different
//! devices never serialize against each other and no lock is held while
//! waiting on a device.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::messages::ControlMessage;

/// Why a command could not be handed to a device channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("send to device {0} timed out")]
    Timeout(String),

    #[error("channel to device {0} is closed")]
    Closed(String),
}

/// A registered device channel.
#[derive(Clone)]
struct ChannelHandle {
    sender: mpsc::Sender<ControlMessage>,
    connection_id: String,
}

/// Registry of live device command channels.
pub struct ConnectivityRegistry {
    /// device_id → current channel.
    channels: RwLock<HashMap<String, ChannelHandle>>,
    /// Upper bound on waiting for channel capacity.
    send_timeout: Duration,
}

impl Default for ConnectivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::with_capacity(1024)),
            send_timeout: Duration::from_secs(2),
        }
    }

    /// Set the per-send deadline.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Register a device channel, replacing any previous one.
    ///
    /// Returns the connection id assigned to this channel.
    pub async fn register(&self, device_id: &str, sender: mpsc::Sender<ControlMessage>) -> String {
        let connection_id = Uuid::new_v4().to_string();
        let handle = ChannelHandle {
            sender,
            connection_id: connection_id.clone(),
        };

        let mut channels = self.channels.write().await;
        match channels.insert(device_id.to_string(), handle) {
            Some(old) => info!(
                %device_id,
                %connection_id,
                replaced = %old.connection_id,
                "device channel replaced"
            ),
            None => info!(%device_id, %connection_id, "device channel registered"),
        }
        connection_id
    }

    /// Remove a device channel if `connection_id` is still the current one.
    ///
    /// A superseded session tearing down must not evict its replacement.
    pub async fn unregister(&self, device_id: &str, connection_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        let current = channels
            .get(device_id)
            .is_some_and(|h| h.connection_id == connection_id);
        if current {
            channels.remove(device_id);
            info!(%device_id, %connection_id, "device channel unregistered");
        } else {
            debug!(%device_id, %connection_id, "stale unregister ignored");
        }
        current
    }

    /// Hand a command to a device's channel.
    ///
    /// Never waits for a device to reconnect: an unregistered device is
    /// `NotConnected` immediately. Returns the connection id that accepted
    /// the command.
    pub async fn send(&self, device_id: &str, command: ControlMessage) -> Result<String, SendError> {
        let handle = {
            let channels = self.channels.read().await;
            channels.get(device_id).cloned()
        };
        let Some(handle) = handle else {
            debug!(%device_id, "send skipped, device not connected");
            return Err(SendError::NotConnected(device_id.to_string()));
        };

        match tokio::time::timeout(self.send_timeout, handle.sender.send(command)).await {
            Ok(Ok(())) => Ok(handle.connection_id),
            Ok(Err(_)) => {
                warn!(%device_id, connection_id = %handle.connection_id, "device channel closed");
                self.unregister(device_id, &handle.connection_id).await;
                Err(SendError::Closed(device_id.to_string()))
            }
            Err(_) => {
                warn!(%device_id, timeout = ?self.send_timeout, "device send timed out");
                Err(SendError::Timeout(device_id.to_string()))
            }
        }
    }

    /// Current connection id of a device, if connected.
    pub async fn connection_id(&self, device_id: &str) -> Option<String> {
        let channels = self.channels.read().await;
        channels.get(device_id).map(|h| h.connection_id.clone())
    }

    /// Whether a device currently holds a channel.
    pub async fn is_connected(&self, device_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.contains_key(device_id)
    }

    /// IDs of all connected devices, sorted.
    pub async fn connected_devices(&self) -> Vec<String> {
        let channels = self.channels.read().await;
        let mut ids: Vec<String> = channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of connected devices.
    pub async fn connected_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollback(id: &str) -> ControlMessage {
        ControlMessage::Rollback {
            rollout_id: id.to_string(),
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn send_to_unregistered_device_is_not_connected() {
        let registry = ConnectivityRegistry::new();
        let err = registry.send("dev-1", rollback("r-1")).await.unwrap_err();
        assert_eq!(err, SendError::NotConnected("dev-1".to_string()));
    }

    #[tokio::test]
    async fn send_delivers_to_registered_channel() {
        let registry = ConnectivityRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let conn = registry.register("dev-1", tx).await;

        let accepted = registry.send("dev-1", rollback("r-1")).await.unwrap();
        assert_eq!(accepted, conn);
        assert_eq!(rx.recv().await, Some(rollback("r-1")));
    }

    #[tokio::test]
    async fn second_register_replaces_handle() {
        let registry = ConnectivityRegistry::new();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);
        let old_conn = registry.register("dev-1", old_tx).await;
        let new_conn = registry.register("dev-1", new_tx).await;
        assert_ne!(old_conn, new_conn);
        assert_eq!(registry.connected_count().await, 1);

        registry.send("dev-1", rollback("r-1")).await.unwrap();
        assert_eq!(new_rx.recv().await, Some(rollback("r-1")));
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_unregister_keeps_replacement() {
        let registry = ConnectivityRegistry::new();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);
        let old_conn = registry.register("dev-1", old_tx).await;
        let new_conn = registry.register("dev-1", new_tx).await;

        assert!(!registry.unregister("dev-1", &old_conn).await);
        assert_eq!(registry.connection_id("dev-1").await, Some(new_conn.clone()));
        assert!(registry.unregister("dev-1", &new_conn).await);
        assert!(!registry.is_connected("dev-1").await);
    }

    #[tokio::test]
    async fn closed_channel_is_unregistered() {
        let registry = ConnectivityRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        registry.register("dev-1", tx).await;
        drop(rx);

        let err = registry.send("dev-1", rollback("r-1")).await.unwrap_err();
        assert_eq!(err, SendError::Closed("dev-1".to_string()));
        assert!(!registry.is_connected("dev-1").await);
    }

    #[tokio::test]
    async fn full_channel_times_out() {
        let registry = ConnectivityRegistry::new().with_send_timeout(Duration::from_millis(20));
        let (tx, _rx) = mpsc::channel(1);
        registry.register("dev-1", tx).await;

        registry.send("dev-1", rollback("r-1")).await.unwrap();
        let err = registry.send("dev-1", rollback("r-2")).await.unwrap_err();
        assert_eq!(err, SendError::Timeout("dev-1".to_string()));
        // A slow device stays registered.
        assert!(registry.is_connected("dev-1").await);
    }

    #[tokio::test]
    async fn connected_devices_sorted() {
        let registry = ConnectivityRegistry::new();
        for id in ["dev-c", "dev-a", "dev-b"] {
            let (tx, _rx) = mpsc::channel(1);
            registry.register(id, tx).await;
        }
        assert_eq!(
            registry.connected_devices().await,
            vec!["dev-a".to_string(), "dev-b".to_string(), "dev-c".to_string()]
        );
    }
}
