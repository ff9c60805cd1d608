//! StateStore — redb-backed fleet repository.
//!
//! Provides typed operations over devices, artifacts, rollouts, status
//! rows, and device claims. All record values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe fleet repository backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUT_DEVICES).map_err(map_err!(Table))?;
        txn.open_table(DEVICE_CLAIMS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read one JSON record by key.
    fn get_record<T: DeserializeOwned>(
        &self,
        def: RecordTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Scan a table, keeping records whose key starts with `prefix`.
    fn scan_records<T: DeserializeOwned>(
        &self,
        def: RecordTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device record.
    pub fn put_device(&self, device: &Device) -> StateResult<()> {
        let value = encode(device)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            table
                .insert(device.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(device_id = %device.id, "device stored");
        Ok(())
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> StateResult<Option<Device>> {
        self.get_record(DEVICES, device_id)
    }

    /// List all devices.
    pub fn list_devices(&self) -> StateResult<Vec<Device>> {
        self.scan_records(DEVICES, "")
    }

    /// ACTIVE devices of `org_id` matching `selector`, in no particular order.
    pub fn list_active_devices_matching(
        &self,
        org_id: &str,
        selector: &DeviceSelector,
    ) -> StateResult<Vec<Device>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .filter(|d| {
                d.org_id == org_id && d.status == DeviceStatus::Active && selector.matches(d)
            })
            .collect())
    }

    /// Record a heartbeat time. Last write wins.
    pub fn update_device_last_seen(&self, device_id: &str, at: u64) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let mut device: Device = match table.get(device_id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("device {device_id}"))),
            };
            device.last_seen_at = Some(at);
            let value = encode(&device)?;
            table
                .insert(device_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Set a device's lifecycle status. Returns the updated record.
    pub fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> StateResult<Device> {
        let mut device = self
            .get_device(device_id)?
            .ok_or_else(|| StateError::NotFound(format!("device {device_id}")))?;
        device.status = status;
        self.put_device(&device)?;
        Ok(device)
    }

    // ── Artifacts ──────────────────────────────────────────────────

    /// Store an artifact. Artifacts are immutable: re-creating an identical
    /// record is a no-op, a different record under the same id is a conflict.
    pub fn create_artifact(&self, artifact: &Artifact) -> StateResult<()> {
        let value = encode(artifact)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
            let existing: Option<Artifact> = match table
                .get(artifact.id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match existing {
                Some(ref stored) if stored == artifact => return Ok(()),
                Some(_) => {
                    return Err(StateError::Conflict(format!(
                        "artifact {} already exists with different content",
                        artifact.id
                    )));
                }
                None => {
                    table
                        .insert(artifact.id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(artifact_id = %artifact.id, "artifact stored");
        Ok(())
    }

    /// Get an artifact by ID.
    pub fn get_artifact(&self, artifact_id: &str) -> StateResult<Option<Artifact>> {
        self.get_record(ARTIFACTS, artifact_id)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Store a new rollout. Fails if the id is taken.
    pub fn create_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        let value = encode(rollout)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let exists = table
                .get(rollout.id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                return Err(StateError::Conflict(format!("rollout {} exists", rollout.id)));
            }
            table
                .insert(rollout.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout_id = %rollout.id, "rollout created");
        Ok(())
    }

    /// Get a rollout by ID.
    pub fn get_rollout(&self, rollout_id: &str) -> StateResult<Option<Rollout>> {
        self.get_record(ROLLOUTS, rollout_id)
    }

    /// List all rollouts.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        self.scan_records(ROLLOUTS, "")
    }

    /// Move a rollout to `state` without touching status rows.
    ///
    /// Sets `started_at` on entry to CANARY and `completed_at` on entry to a
    /// terminal state, each only if unset. Terminal entry releases claims.
    pub fn update_rollout_state(
        &self,
        rollout_id: &str,
        state: RolloutState,
        at: u64,
    ) -> StateResult<Rollout> {
        let current = self
            .get_rollout(rollout_id)?
            .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
        if current.state.is_terminal() {
            return Err(StateError::RolloutTerminal(rollout_id.to_string()));
        }
        let mut next = current.clone();
        next.state = state;
        next.phase_entered_at = at;
        next.updated_at = at;
        if state == RolloutState::Canary && next.started_at.is_none() {
            next.started_at = Some(at);
        }
        if state.is_terminal() && next.completed_at.is_none() {
            next.completed_at = Some(at);
        }
        let mut transition = RolloutTransition::new(current.state, next);
        transition.release_claims = state.is_terminal();
        self.apply_transition(&transition)
    }

    /// Enter COMPLETE.
    pub fn complete_rollout(&self, rollout_id: &str, at: u64) -> StateResult<Rollout> {
        self.update_rollout_state(rollout_id, RolloutState::Complete, at)
    }

    /// Enter FAILED.
    pub fn fail_rollout(&self, rollout_id: &str, at: u64) -> StateResult<Rollout> {
        self.update_rollout_state(rollout_id, RolloutState::Failed, at)
    }

    /// Apply a rollout transition atomically. Returns the stored rollout.
    pub fn apply_transition(&self, t: &RolloutTransition) -> StateResult<Rollout> {
        let rollout_id = t.rollout.id.as_str();
        let value = encode(&t.rollout)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let current: Rollout = match rollouts.get(rollout_id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("rollout {rollout_id}"))),
            };
            if current.state != t.expected_state {
                return Err(StateError::StaleState {
                    rollout_id: rollout_id.to_string(),
                    expected: t.expected_state,
                    actual: current.state,
                });
            }
            if current.started_at.is_some() && current.started_at != t.rollout.started_at {
                return Err(StateError::Conflict(format!(
                    "rollout {rollout_id} started_at is already set"
                )));
            }
            if current.completed_at.is_some() && current.completed_at != t.rollout.completed_at {
                return Err(StateError::Conflict(format!(
                    "rollout {rollout_id} completed_at is already set"
                )));
            }
            if current.artifact_id != t.rollout.artifact_id {
                return Err(StateError::Conflict(format!(
                    "rollout {rollout_id} artifact reference is immutable"
                )));
            }

            let mut claims = txn.open_table(DEVICE_CLAIMS).map_err(map_err!(Table))?;
            let mut taken = Vec::new();
            for device_id in &t.claim_devices {
                if let Some(owner) = claims.get(device_id.as_str()).map_err(map_err!(Read))? {
                    if owner.value() != rollout_id {
                        taken.push(format!("{device_id} (held by {})", owner.value()));
                    }
                }
            }
            if !taken.is_empty() {
                return Err(StateError::Conflict(format!(
                    "devices already claimed: {}",
                    taken.join(", ")
                )));
            }
            for device_id in &t.claim_devices {
                claims
                    .insert(device_id.as_str(), rollout_id)
                    .map_err(map_err!(Write))?;
            }
            if t.release_claims {
                let mut owned = Vec::new();
                for entry in claims.iter().map_err(map_err!(Read))? {
                    let (key, owner) = entry.map_err(map_err!(Read))?;
                    if owner.value() == rollout_id {
                        owned.push(key.value().to_string());
                    }
                }
                for device_id in &owned {
                    claims.remove(device_id.as_str()).map_err(map_err!(Write))?;
                }
            }

            let mut rows = txn.open_table(ROLLOUT_DEVICES).map_err(map_err!(Table))?;
            for row in &t.create_rows {
                let key = row.table_key();
                if rows.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                    return Err(StateError::Conflict(format!("status row {key} exists")));
                }
                let row_value = encode(row)?;
                rows.insert(key.as_str(), row_value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            for row in &t.update_rows {
                let key = row.table_key();
                if rows.get(key.as_str()).map_err(map_err!(Read))?.is_none() {
                    return Err(StateError::NotFound(format!("status row {key}")));
                }
                let row_value = encode(row)?;
                rows.insert(key.as_str(), row_value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            rollouts
                .insert(rollout_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %rollout_id,
            from = ?t.expected_state,
            to = ?t.rollout.state,
            created = t.create_rows.len(),
            updated = t.update_rows.len(),
            "rollout transition applied"
        );
        Ok(t.rollout.clone())
    }

    /// Rollout currently holding a claim on `device_id`.
    pub fn device_claim(&self, device_id: &str) -> StateResult<Option<RolloutId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICE_CLAIMS).map_err(map_err!(Table))?;
        Ok(table
            .get(device_id)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string()))
    }

    // ── Rollout device status ──────────────────────────────────────

    /// Create a status row. At most one row per (rollout, device).
    pub fn create_rollout_device_status(&self, row: &RolloutDeviceStatus) -> StateResult<()> {
        self.write_status_row(row, true)
    }

    /// Update an existing status row, provided its rollout is not terminal.
    pub fn update_rollout_device_status(&self, row: &RolloutDeviceStatus) -> StateResult<()> {
        self.write_status_row(row, false)
    }

    fn write_status_row(&self, row: &RolloutDeviceStatus, create: bool) -> StateResult<()> {
        let key = row.table_key();
        let value = encode(row)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let rollout: Rollout = match rollouts
                .get(row.rollout_id.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("rollout {}", row.rollout_id))),
            };
            if rollout.state.is_terminal() {
                return Err(StateError::RolloutTerminal(row.rollout_id.clone()));
            }

            let mut rows = txn.open_table(ROLLOUT_DEVICES).map_err(map_err!(Table))?;
            let exists = rows.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if create && exists {
                return Err(StateError::Conflict(format!("status row {key} exists")));
            }
            if !create && !exists {
                return Err(StateError::NotFound(format!("status row {key}")));
            }
            rows.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get one status row.
    pub fn get_rollout_device_status(
        &self,
        rollout_id: &str,
        device_id: &str,
    ) -> StateResult<Option<RolloutDeviceStatus>> {
        self.get_record(ROLLOUT_DEVICES, &status_key(rollout_id, device_id))
    }

    /// All status rows of a rollout, ordered by device id.
    pub fn list_rollout_device_statuses(
        &self,
        rollout_id: &str,
    ) -> StateResult<Vec<RolloutDeviceStatus>> {
        let prefix = format!("{rollout_id}:");
        // redb iterates in key order, so rows come back sorted by device id.
        self.scan_records(ROLLOUT_DEVICES, &prefix)
    }
}
