//! Health evaluator — promotion verdict for one cohort.
//!
//! A pure function of the status snapshot, the clock reading and the set of
//! currently reachable devices. Rules, first match wins:
//!
//! 1. any UNHEALTHY row fails immediately, soak or not;
//! 2. an empty cohort passes;
//! 3. a PENDING row whose device is reachable and holds the update on its
//!    live connection fails once a soak period has passed since delivery;
//! 4. other PENDING rows keep the verdict pending until the apply timeout,
//!    then fail;
//! 5. the soak window opens when the last row left PENDING;
//! 6. after soak, rows still IN_PROGRESS fail; otherwise the cohort passes.

use std::collections::HashSet;
use std::time::Duration;

use safeedge_state::{DeviceId, DeviceRolloutStatus, RolloutDeviceStatus};

/// Outcome of evaluating a cohort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not decidable yet.
    Pending,
    Pass,
    Fail {
        devices: Vec<DeviceId>,
        reason: String,
    },
}

/// Everything the evaluator looks at.
#[derive(Debug, Clone, Copy)]
pub struct CohortSnapshot<'a> {
    pub rows: &'a [RolloutDeviceStatus],
    pub now: u64,
    /// When the rollout entered its current phase.
    pub phase_entered_at: u64,
    pub soak: Duration,
    pub apply_timeout: Duration,
    /// Devices connected with a fresh heartbeat.
    pub reachable: &'a HashSet<DeviceId>,
    /// Devices whose current command went to the connection they are on now.
    pub delivered_live: &'a HashSet<DeviceId>,
}

/// Compute the verdict for a cohort.
pub fn evaluate_cohort(snapshot: &CohortSnapshot<'_>) -> Verdict {
    let rows = snapshot.rows;

    let unhealthy = ids_with(rows, DeviceRolloutStatus::Unhealthy);
    if !unhealthy.is_empty() {
        return Verdict::Fail {
            reason: format!("{} device(s) reported unhealthy", unhealthy.len()),
            devices: unhealthy,
        };
    }

    if rows.is_empty() {
        return Verdict::Pass;
    }

    let ignored: Vec<DeviceId> = rows
        .iter()
        .filter(|r| r.status == DeviceRolloutStatus::Pending)
        .filter(|r| {
            snapshot.reachable.contains(&r.device_id) && snapshot.delivered_live.contains(&r.device_id)
        })
        .filter(|r| {
            r.delivered_at
                .is_some_and(|at| snapshot.now.saturating_sub(at) >= snapshot.soak.as_secs())
        })
        .map(|r| r.device_id.clone())
        .collect();
    if !ignored.is_empty() {
        return Verdict::Fail {
            reason: format!(
                "{} reachable device(s) did not acknowledge the update within {}s",
                ignored.len(),
                snapshot.soak.as_secs()
            ),
            devices: ignored,
        };
    }

    let pending = ids_with(rows, DeviceRolloutStatus::Pending);
    if !pending.is_empty() {
        let waited = snapshot.now.saturating_sub(snapshot.phase_entered_at);
        if waited < snapshot.apply_timeout.as_secs() {
            return Verdict::Pending;
        }
        let unreachable = count_unreachable(&pending, snapshot.reachable);
        return Verdict::Fail {
            reason: format!(
                "{} device(s) never applied the update within {}s ({} unreachable)",
                pending.len(),
                snapshot.apply_timeout.as_secs(),
                unreachable
            ),
            devices: pending,
        };
    }

    let soak_started = rows
        .iter()
        .filter_map(|r| r.applied_at)
        .max()
        .unwrap_or(snapshot.phase_entered_at);
    if snapshot.now.saturating_sub(soak_started) < snapshot.soak.as_secs() {
        return Verdict::Pending;
    }

    let silent = ids_with(rows, DeviceRolloutStatus::InProgress);
    if !silent.is_empty() {
        let unreachable = count_unreachable(&silent, snapshot.reachable);
        return Verdict::Fail {
            reason: format!(
                "{} device(s) sent no health report by the end of soak ({} unreachable)",
                silent.len(),
                unreachable
            ),
            devices: silent,
        };
    }

    // Only HEALTHY rows remain. Those that went unreachable after reporting
    // do not block promotion.
    Verdict::Pass
}

fn ids_with(rows: &[RolloutDeviceStatus], status: DeviceRolloutStatus) -> Vec<DeviceId> {
    rows.iter()
        .filter(|r| r.status == status)
        .map(|r| r.device_id.clone())
        .collect()
}

fn count_unreachable(ids: &[DeviceId], reachable: &HashSet<DeviceId>) -> usize {
    ids.iter().filter(|id| !reachable.contains(*id)).count()
}
