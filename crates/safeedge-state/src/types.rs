//! Domain types for the fleet repository.
//!
//! These types represent the persisted state of devices, artifacts,
//! rollouts, and per-device rollout status. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable identifier of an enrolled device.
pub type DeviceId = String;

/// Identifier of the organization owning devices, artifacts and rollouts.
pub type OrgId = String;

/// Identifier of an immutable artifact record.
pub type ArtifactId = String;

/// Identifier of a rollout.
pub type RolloutId = String;

// ── Device ─────────────────────────────────────────────────────────

/// An enrolled edge device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub org_id: OrgId,
    /// Device identity key (base64 Ed25519).
    pub public_key: String,
    /// Tunnel public key (base64 WireGuard).
    pub tunnel_public_key: String,
    /// Address assigned inside the tunnel overlay.
    pub tunnel_address: String,
    /// Declared platform, e.g. `linux/arm64`.
    pub platform: String,
    /// Declared agent version.
    pub version: String,
    /// Group/site tag used by rollout selectors.
    pub group_tag: String,
    pub status: DeviceStatus,
    /// Unix timestamp of the last heartbeat, if any.
    pub last_seen_at: Option<u64>,
    pub created_at: u64,
}

/// Lifecycle status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Suspended,
    Decommissioned,
}

// ── Artifact ───────────────────────────────────────────────────────

/// Metadata for a content-addressed, signed artifact.
///
/// The bytes live in external blob storage; only the hash and the
/// detached signature are kept here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub org_id: OrgId,
    pub artifact_type: ArtifactType,
    /// BLAKE3-256 of the artifact body, lowercase hex.
    pub content_hash: String,
    /// Detached Ed25519 signature, lowercase hex.
    pub signature: String,
    /// Identifier of the key that produced `signature`.
    pub signing_key_id: String,
    pub size_bytes: u64,
    pub created_at: u64,
}

/// Declared artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Container,
    Binary,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Binary => "binary",
        }
    }
}

// ── Selector ───────────────────────────────────────────────────────

/// Device fields a selector may match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorField {
    GroupTag,
    Platform,
    Version,
}

impl SelectorField {
    /// Parse a selector key. `site_tag` is accepted as an alias of `group_tag`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "group_tag" | "site_tag" => Some(Self::GroupTag),
            "platform" => Some(Self::Platform),
            "version" => Some(Self::Version),
            _ => None,
        }
    }

    fn value_of<'a>(&self, device: &'a Device) -> &'a str {
        match self {
            Self::GroupTag => &device.group_tag,
            Self::Platform => &device.platform,
            Self::Version => &device.version,
        }
    }
}

/// Attribute-match predicate over device fields, AND-combined.
///
/// Serialized as a flat JSON object, e.g. `{"site_tag": "warehouse-5"}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct DeviceSelector(BTreeMap<String, String>);

impl DeviceSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `field == value` term.
    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.0.insert(field.to_string(), value.to_string());
        self
    }

    pub fn terms(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Structural equality on every term. Unknown fields never match.
    pub fn matches(&self, device: &Device) -> bool {
        self.0.iter().all(|(field, expected)| {
            SelectorField::parse(field)
                .is_some_and(|f| f.value_of(device) == expected.as_str())
        })
    }
}

// ── Rollout ────────────────────────────────────────────────────────

/// Lifecycle state of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Draft,
    Canary,
    Full,
    Complete,
    Rollback,
    Failed,
}

impl RolloutState {
    /// COMPLETE and FAILED accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// States in which the rollout may send commands to devices.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Canary | Self::Full | Self::Rollback)
    }
}

/// Where devices report health for this rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSpec {
    /// Device-local health endpoint, e.g. `http://127.0.0.1:8080/healthz`.
    pub endpoint: String,
    /// Per-probe timeout on the device, seconds.
    pub timeout_secs: u64,
}

/// A staged software rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub org_id: OrgId,
    /// Immutable after creation.
    pub artifact_id: ArtifactId,
    pub selector: DeviceSelector,
    /// Share of targets in the canary cohort, 0-100.
    pub canary_percent: u8,
    /// Soak window per cohort, seconds.
    pub soak_secs: u64,
    /// How long a cohort may have PENDING rows before failing.
    /// `None` uses the engine default.
    pub apply_timeout_secs: Option<u64>,
    pub health_check: HealthCheckSpec,
    pub state: RolloutState,
    pub created_at: u64,
    /// Set once, on DRAFT → CANARY.
    pub started_at: Option<u64>,
    /// Set once, on entry to COMPLETE or FAILED.
    pub completed_at: Option<u64>,
    /// When the current state was entered.
    pub phase_entered_at: u64,
    pub failure_reason: Option<String>,
    pub updated_at: u64,
}

/// Per-device progress within a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRolloutStatus {
    Pending,
    InProgress,
    Healthy,
    Unhealthy,
    RolledBack,
}

/// Status row for one (rollout, device) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutDeviceStatus {
    pub rollout_id: RolloutId,
    pub device_id: DeviceId,
    pub is_canary: bool,
    pub status: DeviceRolloutStatus,
    /// Last health report detail from the device.
    pub health_detail: Option<String>,
    /// When the device acknowledged applying the update.
    pub applied_at: Option<u64>,
    /// Registry connection the current command was handed to.
    pub delivered_connection: Option<String>,
    /// When the current command was handed to `delivered_connection`.
    #[serde(default)]
    pub delivered_at: Option<u64>,
    pub delivery_attempts: u32,
    /// Device confirmed it reverted after a Rollback command.
    pub rollback_acknowledged: bool,
    pub updated_at: u64,
}

impl RolloutDeviceStatus {
    /// A fresh PENDING row.
    pub fn pending(rollout_id: &str, device_id: &str, is_canary: bool, now: u64) -> Self {
        Self {
            rollout_id: rollout_id.to_string(),
            device_id: device_id.to_string(),
            is_canary,
            status: DeviceRolloutStatus::Pending,
            health_detail: None,
            applied_at: None,
            delivered_connection: None,
            delivered_at: None,
            delivery_attempts: 0,
            rollback_acknowledged: false,
            updated_at: now,
        }
    }

    /// Build the composite key for the status table.
    pub fn table_key(&self) -> String {
        status_key(&self.rollout_id, &self.device_id)
    }
}

/// Composite key `{rollout_id}:{device_id}`.
pub fn status_key(rollout_id: &str, device_id: &str) -> String {
    format!("{rollout_id}:{device_id}")
}

/// One atomic rollout state change.
///
/// Applied by the repository in a single write transaction: the stored
/// rollout must still be in `expected_state`, every row in `create_rows`
/// must be new, every row in `update_rows` must exist, and every device in
/// `claim_devices` must be unclaimed or already claimed by this rollout.
#[derive(Debug, Clone)]
pub struct RolloutTransition {
    pub expected_state: RolloutState,
    /// The rollout record to store.
    pub rollout: Rollout,
    pub create_rows: Vec<RolloutDeviceStatus>,
    pub update_rows: Vec<RolloutDeviceStatus>,
    pub claim_devices: Vec<DeviceId>,
    /// Drop every claim held by this rollout.
    pub release_claims: bool,
}

impl RolloutTransition {
    /// A transition that only rewrites the rollout record.
    pub fn new(expected_state: RolloutState, rollout: Rollout) -> Self {
        Self {
            expected_state,
            rollout,
            create_rows: Vec::new(),
            update_rows: Vec::new(),
            claim_devices: Vec::new(),
            release_claims: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(group: &str, platform: &str) -> Device {
        Device {
            id: "dev-1".to_string(),
            org_id: "org-1".to_string(),
            public_key: String::new(),
            tunnel_public_key: String::new(),
            tunnel_address: "100.64.0.2".to_string(),
            platform: platform.to_string(),
            version: "1.4.0".to_string(),
            group_tag: group.to_string(),
            status: DeviceStatus::Active,
            last_seen_at: None,
            created_at: 1000,
        }
    }

    #[test]
    fn selector_matches_all_terms() {
        let sel = DeviceSelector::new()
            .with("site_tag", "warehouse-5")
            .with("platform", "linux/arm64");
        assert!(sel.matches(&device("warehouse-5", "linux/arm64")));
        assert!(!sel.matches(&device("warehouse-5", "linux/amd64")));
        assert!(!sel.matches(&device("warehouse-6", "linux/arm64")));
    }

    #[test]
    fn selector_unknown_field_never_matches() {
        let sel = DeviceSelector::new().with("region", "eu");
        assert!(!sel.matches(&device("warehouse-5", "linux/arm64")));
    }

    #[test]
    fn selector_serializes_flat() {
        let sel = DeviceSelector::new().with("site_tag", "warehouse-5");
        let json = serde_json::to_string(&sel).unwrap();
        assert_eq!(json, r#"{"site_tag":"warehouse-5"}"#);
    }

    #[test]
    fn terminal_states() {
        assert!(RolloutState::Complete.is_terminal());
        assert!(RolloutState::Failed.is_terminal());
        assert!(!RolloutState::Rollback.is_terminal());
        assert!(!RolloutState::Draft.is_active());
        assert!(RolloutState::Rollback.is_active());
    }
}
