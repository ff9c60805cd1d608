//! safeedge-registry — live device connectivity for the SafeEdge control plane.
//!
//! Tracks which devices currently hold a command channel, routes outbound
//! commands to them, and dispatches inbound device messages to the
//! liveness tracker and the rollout engine.
//!
//! # Architecture
//!
//! ```text
//! per-device session task (one per connected device)
//!   ├── ConnectivityRegistry::register() → connection id
//!   ├── loop: inbound DeviceMessage
//!   │   └── Dispatcher::dispatch()
//!   │       ├── Heartbeat          → LivenessTracker → HeartbeatAck reply
//!   │       ├── UpdateAcknowledged → RolloutEvents::on_update_ack()
//!   │       └── HealthReport       → RolloutEvents::on_health_report()
//!   └── ConnectivityRegistry::unregister() on close
//!
//! rollout engine
//!   └── ConnectivityRegistry::send() → Ok(connection id) | NotConnected | Timeout | Closed
//! ```
//!
//! The registry is an explicit object injected into both the session tasks
//! and the rollout engine; there is no process-wide connection map.

pub mod clock;
pub mod dispatcher;
pub mod liveness;
pub mod messages;
pub mod registry;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{Dispatcher, RolloutEvents};
pub use liveness::LivenessTracker;
pub use messages::{AckStatus, ControlMessage, DeviceMessage, HeartbeatMetrics};
pub use registry::{ConnectivityRegistry, SendError};
pub use session::run_device_session;
