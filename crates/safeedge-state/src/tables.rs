//! redb table definitions for the fleet repository.
//!
//! Each table uses `&str` keys. Record tables hold JSON-serialized domain
//! types in `&[u8]` values; the claims table maps a device id straight to
//! the owning rollout id.

use redb::TableDefinition;

/// Device inventory keyed by `{device_id}`.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

/// Artifact metadata keyed by `{artifact_id}`.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");

/// Rollouts keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Per-device rollout status keyed by `{rollout_id}:{device_id}`.
pub const ROLLOUT_DEVICES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("rollout_device_status");

/// Active rollout claims: `{device_id}` → `{rollout_id}`.
pub const DEVICE_CLAIMS: TableDefinition<&str, &str> = TableDefinition::new("device_claims");

/// Shape shared by the JSON record tables.
pub type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;
