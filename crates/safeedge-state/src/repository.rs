//! The repository contract consumed by the rollout core.
//!
//! The core never talks to redb directly; it goes through this trait so
//! that ownership of rollouts can later be sharded across instances that
//! share an external store, and so tests can inject write failures.

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::*;

/// Typed, transactional access to fleet state.
///
/// Reads are eventually consistent with concurrent writers. Status row
/// writes are conditioned on the owning rollout being non-terminal, and
/// terminal timestamps are set exactly once.
pub trait FleetRepository: Send + Sync {
    fn get_device(&self, device_id: &str) -> StateResult<Option<Device>>;

    fn list_active_devices_matching(
        &self,
        org_id: &str,
        selector: &DeviceSelector,
    ) -> StateResult<Vec<Device>>;

    /// Idempotent, last write wins.
    fn update_device_last_seen(&self, device_id: &str, at: u64) -> StateResult<()>;

    fn get_artifact(&self, artifact_id: &str) -> StateResult<Option<Artifact>>;

    fn create_rollout(&self, rollout: &Rollout) -> StateResult<()>;

    fn get_rollout(&self, rollout_id: &str) -> StateResult<Option<Rollout>>;

    fn list_rollouts(&self) -> StateResult<Vec<Rollout>>;

    fn create_rollout_device_status(&self, row: &RolloutDeviceStatus) -> StateResult<()>;

    fn update_rollout_device_status(&self, row: &RolloutDeviceStatus) -> StateResult<()>;

    fn get_rollout_device_status(
        &self,
        rollout_id: &str,
        device_id: &str,
    ) -> StateResult<Option<RolloutDeviceStatus>>;

    fn list_rollout_device_statuses(&self, rollout_id: &str)
    -> StateResult<Vec<RolloutDeviceStatus>>;

    fn update_rollout_state(
        &self,
        rollout_id: &str,
        state: RolloutState,
        at: u64,
    ) -> StateResult<Rollout>;

    fn complete_rollout(&self, rollout_id: &str, at: u64) -> StateResult<Rollout>;

    fn fail_rollout(&self, rollout_id: &str, at: u64) -> StateResult<Rollout>;

    /// All-or-nothing state change with its status rows and claims.
    fn apply_transition(&self, transition: &RolloutTransition) -> StateResult<Rollout>;

    fn device_claim(&self, device_id: &str) -> StateResult<Option<RolloutId>>;
}

impl FleetRepository for StateStore {
    fn get_device(&self, device_id: &str) -> StateResult<Option<Device>> {
        StateStore::get_device(self, device_id)
    }

    fn list_active_devices_matching(
        &self,
        org_id: &str,
        selector: &DeviceSelector,
    ) -> StateResult<Vec<Device>> {
        StateStore::list_active_devices_matching(self, org_id, selector)
    }

    fn update_device_last_seen(&self, device_id: &str, at: u64) -> StateResult<()> {
        StateStore::update_device_last_seen(self, device_id, at)
    }

    fn get_artifact(&self, artifact_id: &str) -> StateResult<Option<Artifact>> {
        StateStore::get_artifact(self, artifact_id)
    }

    fn create_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        StateStore::create_rollout(self, rollout)
    }

    fn get_rollout(&self, rollout_id: &str) -> StateResult<Option<Rollout>> {
        StateStore::get_rollout(self, rollout_id)
    }

    fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        StateStore::list_rollouts(self)
    }

    fn create_rollout_device_status(&self, row: &RolloutDeviceStatus) -> StateResult<()> {
        StateStore::create_rollout_device_status(self, row)
    }

    fn update_rollout_device_status(&self, row: &RolloutDeviceStatus) -> StateResult<()> {
        StateStore::update_rollout_device_status(self, row)
    }

    fn get_rollout_device_status(
        &self,
        rollout_id: &str,
        device_id: &str,
    ) -> StateResult<Option<RolloutDeviceStatus>> {
        StateStore::get_rollout_device_status(self, rollout_id, device_id)
    }

    fn list_rollout_device_statuses(
        &self,
        rollout_id: &str,
    ) -> StateResult<Vec<RolloutDeviceStatus>> {
        StateStore::list_rollout_device_statuses(self, rollout_id)
    }

    fn update_rollout_state(
        &self,
        rollout_id: &str,
        state: RolloutState,
        at: u64,
    ) -> StateResult<Rollout> {
        StateStore::update_rollout_state(self, rollout_id, state, at)
    }

    fn complete_rollout(&self, rollout_id: &str, at: u64) -> StateResult<Rollout> {
        StateStore::complete_rollout(self, rollout_id, at)
    }

    fn fail_rollout(&self, rollout_id: &str, at: u64) -> StateResult<Rollout> {
        StateStore::fail_rollout(self, rollout_id, at)
    }

    fn apply_transition(&self, transition: &RolloutTransition) -> StateResult<Rollout> {
        StateStore::apply_transition(self, transition)
    }

    fn device_claim(&self, device_id: &str) -> StateResult<Option<RolloutId>> {
        StateStore::device_claim(self, device_id)
    }
}
