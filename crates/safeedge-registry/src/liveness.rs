//! Liveness tracker — device online/offline state from heartbeat recency.
//!
//! There is no background sweep. Every reader re-checks freshness at the
//! moment it asks, against the injected clock.

use std::sync::Arc;
use std::time::Duration;

use safeedge_state::{Device, FleetRepository};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::messages::ControlMessage;

/// Default heartbeat cadence expected from agents.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Default staleness threshold before a device counts as offline.
pub const DEFAULT_OFFLINE_AFTER: Duration = Duration::from_secs(300);

/// Records heartbeats and answers "is this device online".
pub struct LivenessTracker {
    repo: Arc<dyn FleetRepository>,
    clock: Arc<dyn Clock>,
    offline_after: Duration,
    heartbeat_interval: Duration,
}

impl LivenessTracker {
    pub fn new(repo: Arc<dyn FleetRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            clock,
            offline_after: DEFAULT_OFFLINE_AFTER,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Override the staleness threshold.
    pub fn with_offline_after(mut self, offline_after: Duration) -> Self {
        self.offline_after = offline_after;
        self
    }

    /// Override the expected heartbeat cadence.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn offline_after(&self) -> Duration {
        self.offline_after
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Consecutive heartbeats a device may miss before it counts as offline.
    pub fn tolerated_missed_heartbeats(&self) -> u64 {
        let interval = self.heartbeat_interval.as_secs().max(1);
        (self.offline_after.as_secs() / interval).saturating_sub(1)
    }

    /// Record a heartbeat and build the ack to send back.
    ///
    /// The write is best-effort: a failure is logged and the ack is still
    /// returned. `last_seen_at` is the control plane's time, not the
    /// device-reported `timestamp`.
    pub fn record_heartbeat(
        &self,
        device_id: &str,
        timestamp: u64,
        echo_token: &str,
    ) -> ControlMessage {
        let now = self.clock.now();
        match self.repo.update_device_last_seen(device_id, now) {
            Ok(()) => debug!(%device_id, at = now, "heartbeat recorded"),
            Err(e) => warn!(%device_id, error = %e, "failed to record heartbeat"),
        }
        ControlMessage::HeartbeatAck {
            timestamp,
            echo_token: echo_token.to_string(),
        }
    }

    /// Whether `device` has heartbeated within the staleness threshold.
    pub fn is_online(&self, device: &Device) -> bool {
        is_fresh(device.last_seen_at, self.clock.now(), self.offline_after)
    }

    /// Lookup-then-check variant. Unknown devices and read failures are offline.
    pub fn is_device_online(&self, device_id: &str) -> bool {
        match self.repo.get_device(device_id) {
            Ok(Some(device)) => self.is_online(&device),
            Ok(None) => false,
            Err(e) => {
                warn!(%device_id, error = %e, "liveness lookup failed");
                false
            }
        }
    }
}

/// `now - last_seen <= offline_after`. Never-seen devices are offline.
pub fn is_fresh(last_seen_at: Option<u64>, now: u64, offline_after: Duration) -> bool {
    last_seen_at.is_some_and(|seen| now.saturating_sub(seen) <= offline_after.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use safeedge_state::{DeviceStatus, StateStore};

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            org_id: "org-1".to_string(),
            public_key: String::new(),
            tunnel_public_key: String::new(),
            tunnel_address: "100.64.0.2".to_string(),
            platform: "linux/arm64".to_string(),
            version: "1.0.0".to_string(),
            group_tag: "warehouse-5".to_string(),
            status: DeviceStatus::Active,
            last_seen_at: None,
            created_at: 0,
        }
    }

    fn setup() -> (StateStore, Arc<ManualClock>, LivenessTracker) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let tracker = LivenessTracker::new(Arc::new(store.clone()), clock.clone());
        (store, clock, tracker)
    }

    #[test]
    fn heartbeat_updates_last_seen_and_echoes() {
        let (store, _clock, tracker) = setup();
        store.put_device(&device("dev-1")).unwrap();

        let ack = tracker.record_heartbeat("dev-1", 42, "tok-7");
        assert_eq!(
            ack,
            ControlMessage::HeartbeatAck {
                timestamp: 42,
                echo_token: "tok-7".to_string(),
            }
        );
        let stored = store.get_device("dev-1").unwrap().unwrap();
        assert_eq!(stored.last_seen_at, Some(10_000));
    }

    #[test]
    fn heartbeat_for_unknown_device_still_acks() {
        let (_store, _clock, tracker) = setup();
        let ack = tracker.record_heartbeat("ghost", 1, "t");
        assert!(matches!(ack, ControlMessage::HeartbeatAck { timestamp: 1, .. }));
    }

    #[test]
    fn device_goes_offline_after_threshold() {
        let (store, clock, tracker) = setup();
        store.put_device(&device("dev-1")).unwrap();
        assert!(!tracker.is_device_online("dev-1"));

        tracker.record_heartbeat("dev-1", 0, "");
        assert!(tracker.is_device_online("dev-1"));

        clock.advance(Duration::from_secs(300));
        assert!(tracker.is_device_online("dev-1"));

        clock.advance(Duration::from_secs(1));
        assert!(!tracker.is_device_online("dev-1"));
    }

    #[test]
    fn missed_heartbeat_tolerance() {
        let (_store, clock, tracker) = setup();
        assert_eq!(tracker.heartbeat_interval(), DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(tracker.tolerated_missed_heartbeats(), 4);

        let tight = LivenessTracker::new(Arc::new(StateStore::open_in_memory().unwrap()), clock)
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_offline_after(Duration::from_secs(90));
        assert_eq!(tight.tolerated_missed_heartbeats(), 0);
    }

    #[test]
    fn fresh_boundary() {
        let window = Duration::from_secs(300);
        assert!(is_fresh(Some(100), 400, window));
        assert!(!is_fresh(Some(100), 401, window));
        assert!(!is_fresh(None, 0, window));
        // Clock skew into the future counts as fresh.
        assert!(is_fresh(Some(500), 400, window));
    }
}
