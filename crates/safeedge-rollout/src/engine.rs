//! Rollout engine — drives rollouts through their lifecycle.
//!
//! Every state change is one repository transaction guarded by a
//! compare-and-set on the current state. Each command is stamped on its
//! status row with the connection it targets, inside that transaction.
//! The sends themselves run in a detached task after the commit; a failed
//! delivery clears the stamp so the reconciler retries it.
//!
//! All work on one rollout (API calls, inbound device events, reconciler
//! passes) runs under that rollout's mutex, so two evaluations of the same
//! rollout never race. Different rollouts proceed independently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use safeedge_registry::{
    AckStatus, Clock, ConnectivityRegistry, ControlMessage, LivenessTracker, RolloutEvents,
};
use safeedge_state::{
    Artifact, DeviceId, DeviceRolloutStatus, DeviceSelector, FleetRepository, HealthCheckSpec,
    Rollout, RolloutDeviceStatus, RolloutId, RolloutState, RolloutTransition, StateError,
};

use crate::error::{RolloutError, RolloutResult};
use crate::evaluator::{CohortSnapshot, Verdict, evaluate_cohort};
use crate::machine::check_transition;
use crate::resolver::{partition, resolve_targets, validate_selector};
use crate::retry::{PendingWrite, RetryPolicy, RetryQueue};
use crate::verifier::ArtifactVerifier;

/// Tunables of the rollout engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a cohort may keep PENDING rows, unless the rollout overrides it.
    pub default_apply_timeout: Duration,
    /// How long ROLLBACK waits for device acknowledgements.
    pub rollback_timeout: Duration,
    /// Phase age after which an active rollout is reported as stuck.
    pub stuck_after: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_apply_timeout: Duration::from_secs(900),
            rollback_timeout: Duration::from_secs(300),
            stuck_after: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Operator request to create a rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRollout {
    pub org_id: String,
    pub artifact_id: String,
    pub selector: DeviceSelector,
    pub canary_percent: u32,
    pub soak_secs: u64,
    #[serde(default)]
    pub apply_timeout_secs: Option<u64>,
    pub health_check: HealthCheckSpec,
}

/// An active rollout that needs operator attention.
#[derive(Debug, Clone, Serialize)]
pub struct StuckRollout {
    pub rollout: Rollout,
    pub reason: String,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rollouts visited.
    pub rollouts: usize,
    /// Commands resent to reconnected devices.
    pub redelivered: usize,
    /// Rollouts whose state changed.
    pub transitions: usize,
    /// Deferred writes that landed.
    pub retried: usize,
    /// Deferred writes given up on.
    pub dropped: usize,
}

/// The rollout state machine and its side effects.
pub struct RolloutEngine {
    repo: Arc<dyn FleetRepository>,
    registry: Arc<ConnectivityRegistry>,
    liveness: Arc<LivenessTracker>,
    verifier: ArtifactVerifier,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    /// rollout_id → exclusion scope. Only rollouts that exist and are not
    /// finished get an entry.
    locks: std::sync::Mutex<HashMap<RolloutId, Arc<Mutex<()>>>>,
    retries: RetryQueue,
    /// rollout_id → why a status write was given up on.
    dropped_writes: std::sync::Mutex<HashMap<RolloutId, String>>,
    /// Handle for detached delivery tasks.
    this: Weak<RolloutEngine>,
}

/// A command stamped on a status row, waiting to be handed to the registry.
struct Outbound {
    /// The row as stamped.
    row: RolloutDeviceStatus,
    connection_id: String,
    command: ControlMessage,
}

impl RolloutEngine {
    pub fn new(
        repo: Arc<dyn FleetRepository>,
        registry: Arc<ConnectivityRegistry>,
        liveness: Arc<LivenessTracker>,
        verifier: ArtifactVerifier,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            repo,
            registry,
            liveness,
            verifier,
            clock,
            retries: RetryQueue::new(config.retry),
            config,
            locks: std::sync::Mutex::new(HashMap::new()),
            dropped_writes: std::sync::Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of status writes waiting for a retry.
    pub async fn pending_retries(&self) -> usize {
        self.retries.len().await
    }

    /// Number of rollouts currently holding an exclusion scope.
    pub fn tracked_rollouts(&self) -> usize {
        lock_map(&self.locks).len()
    }

    // ── Operator operations ────────────────────────────────────────

    /// Validate and persist a new rollout in DRAFT.
    pub async fn create(&self, req: NewRollout) -> RolloutResult<Rollout> {
        if req.org_id.is_empty() {
            return Err(RolloutError::Validation("org_id is required".to_string()));
        }
        if req.artifact_id.is_empty() {
            return Err(RolloutError::Validation("artifact_id is required".to_string()));
        }
        let canary_percent = u8::try_from(req.canary_percent)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                RolloutError::Validation(format!(
                    "canary_percent must be between 0 and 100, got {}",
                    req.canary_percent
                ))
            })?;
        if req.soak_secs == 0 {
            return Err(RolloutError::Validation("soak_secs must be positive".to_string()));
        }
        if req.apply_timeout_secs == Some(0) {
            return Err(RolloutError::Validation(
                "apply_timeout_secs must be positive".to_string(),
            ));
        }
        if req.health_check.endpoint.is_empty() {
            return Err(RolloutError::Validation(
                "health_check.endpoint is required".to_string(),
            ));
        }
        validate_selector(&req.selector)?;

        let artifact = self.load_artifact(&req.artifact_id)?;
        if artifact.org_id != req.org_id {
            return Err(RolloutError::Validation(format!(
                "artifact {} belongs to another organization",
                artifact.id
            )));
        }

        let now = self.clock.now();
        let rollout = Rollout {
            id: Uuid::new_v4().to_string(),
            org_id: req.org_id,
            artifact_id: req.artifact_id,
            selector: req.selector,
            canary_percent,
            soak_secs: req.soak_secs,
            apply_timeout_secs: req.apply_timeout_secs,
            health_check: req.health_check,
            state: RolloutState::Draft,
            created_at: now,
            started_at: None,
            completed_at: None,
            phase_entered_at: now,
            failure_reason: None,
            updated_at: now,
        };
        self.repo.create_rollout(&rollout)?;
        info!(
            rollout_id = %rollout.id,
            artifact_id = %rollout.artifact_id,
            canary_percent,
            soak_secs = rollout.soak_secs,
            "rollout created"
        );
        Ok(rollout)
    }

    pub fn get(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        self.load(rollout_id)
    }

    pub fn list(&self) -> RolloutResult<Vec<Rollout>> {
        Ok(self.repo.list_rollouts()?)
    }

    /// Status rows of a rollout, ordered by device id.
    pub fn device_statuses(&self, rollout_id: &str) -> RolloutResult<Vec<RolloutDeviceStatus>> {
        self.load(rollout_id)?;
        Ok(self.repo.list_rollout_device_statuses(rollout_id)?)
    }

    /// DRAFT → CANARY.
    ///
    /// Verifies the artifact, resolves and claims targets, creates the canary
    /// rows and sends them the update. With no targets the rollout runs
    /// straight through to COMPLETE.
    pub async fn start(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        self.load(rollout_id)?;
        let lock = self.lock_for(rollout_id);
        let _guard = lock.lock().await;

        let result = self.start_locked(rollout_id).await;
        if result.is_err() {
            self.forget_if_finished(rollout_id);
        }
        result
    }

    async fn start_locked(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        let rollout = self.load(rollout_id)?;
        check_transition(rollout_id, rollout.state, RolloutState::Canary)?;

        let artifact = self.load_artifact(&rollout.artifact_id)?;
        self.verifier.verify(&artifact)?;

        let targets = resolve_targets(self.repo.as_ref(), &rollout.org_id, &rollout.selector)?;
        let held = self.claimed_elsewhere(rollout_id, &targets)?;
        if !held.is_empty() {
            return Err(RolloutError::conflict(
                rollout_id,
                rollout.state,
                format!(
                    "devices already driven by another rollout: {}",
                    held.join(", ")
                ),
            ));
        }

        let cohorts = partition(targets.clone(), rollout.canary_percent);
        let now = self.clock.now();
        let mut next = rollout.clone();
        next.state = RolloutState::Canary;
        next.started_at = Some(now);
        next.phase_entered_at = now;
        next.updated_at = now;

        let mut transition = RolloutTransition::new(RolloutState::Draft, next);
        transition.create_rows = cohorts
            .canary
            .iter()
            .map(|d| RolloutDeviceStatus::pending(rollout_id, d, true, now))
            .collect();
        let outbound = self
            .stamp_all(&mut transition.create_rows, &apply_update(&artifact, rollout_id), now)
            .await;
        transition.claim_devices = targets;
        let stored = self.commit(&transition)?;
        info!(
            %rollout_id,
            targets = cohorts.total(),
            canary = cohorts.canary.len(),
            "rollout started"
        );

        self.fan_out(outbound);
        Ok(self.advance(stored).await)
    }

    /// Operator abort from DRAFT, CANARY or FULL.
    pub async fn abort(&self, rollout_id: &str, reason: &str) -> RolloutResult<Rollout> {
        self.load(rollout_id)?;
        let lock = self.lock_for(rollout_id);
        let _guard = lock.lock().await;

        let result = self.abort_locked(rollout_id, reason).await;
        if result.is_err() {
            self.forget_if_finished(rollout_id);
        }
        result
    }

    async fn abort_locked(&self, rollout_id: &str, reason: &str) -> RolloutResult<Rollout> {
        let rollout = self.load(rollout_id)?;
        let reason = if reason.is_empty() {
            "aborted by operator"
        } else {
            reason
        };
        info!(%rollout_id, state = ?rollout.state, %reason, "rollout abort requested");
        let now = self.clock.now();
        let rolled = self.enter_rollback(&rollout, reason, now).await?;
        Ok(self.advance(rolled).await)
    }

    /// Evaluate a rollout now and apply whatever transition is due.
    pub async fn evaluate(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        let rollout = self.load(rollout_id)?;
        if rollout.state.is_terminal() {
            return Ok(rollout);
        }
        let lock = self.lock_for(rollout_id);
        let _guard = lock.lock().await;

        let rollout = self.load(rollout_id)?;
        let settled = self.advance(rollout).await;
        if settled.state.is_terminal() {
            self.forget(rollout_id);
        }
        Ok(settled)
    }

    /// Active rollouts that need attention: phase older than `stuck_after`,
    /// or status writes dropped after retries.
    pub async fn stuck_rollouts(&self) -> RolloutResult<Vec<StuckRollout>> {
        let now = self.clock.now();
        let dropped = lock_map(&self.dropped_writes).clone();
        let mut stuck = Vec::new();
        for rollout in self.repo.list_rollouts()? {
            if !rollout.state.is_active() {
                continue;
            }
            let age = now.saturating_sub(rollout.phase_entered_at);
            let reason = if let Some(reason) = dropped.get(&rollout.id) {
                reason.clone()
            } else if age > self.config.stuck_after.as_secs() {
                format!("in {:?} for {age}s", rollout.state)
            } else {
                continue;
            };
            stuck.push(StuckRollout { rollout, reason });
        }
        Ok(stuck)
    }

    // ── Device events ──────────────────────────────────────────────

    /// Apply an update acknowledgement from a device.
    pub async fn handle_update_ack(
        &self,
        device_id: &str,
        rollout_id: &str,
        status: AckStatus,
    ) -> RolloutResult<()> {
        if self.event_target(device_id, rollout_id)?.is_none() {
            return Ok(());
        }
        let lock = self.lock_for(rollout_id);
        let _guard = lock.lock().await;

        let Some((rollout, row)) = self.event_target(device_id, rollout_id)? else {
            self.forget_if_finished(rollout_id);
            return Ok(());
        };
        let now = self.clock.now();
        let rolling_back = rollout.state == RolloutState::Rollback;
        let mut next = row.clone();
        let mut outbound = Vec::new();

        match (status, row.status) {
            (AckStatus::Applied, DeviceRolloutStatus::Pending) if rolling_back => {
                next.applied_at = Some(now);
                outbound.extend(self.revert_late_apply(&rollout, &mut next, now).await);
            }
            (AckStatus::Applied, DeviceRolloutStatus::Pending) => {
                next.status = DeviceRolloutStatus::InProgress;
                next.applied_at = Some(now);
            }
            (AckStatus::Failed, DeviceRolloutStatus::Pending) if rolling_back => {
                // Nothing was installed, so there is nothing to revert.
                next.status = DeviceRolloutStatus::RolledBack;
                next.rollback_acknowledged = true;
            }
            (AckStatus::Failed, DeviceRolloutStatus::Pending | DeviceRolloutStatus::InProgress)
                if !rolling_back =>
            {
                next.status = DeviceRolloutStatus::Unhealthy;
                next.health_detail = Some("update failed to apply".to_string());
            }
            (AckStatus::RolledBack, DeviceRolloutStatus::RolledBack)
                if !row.rollback_acknowledged =>
            {
                next.rollback_acknowledged = true;
            }
            (status, current) => {
                debug!(%device_id, %rollout_id, ?status, ?current, "ack ignored");
                return Ok(());
            }
        }

        next.updated_at = now;
        debug!(%device_id, %rollout_id, from = ?row.status, to = ?next.status, "device row updated");
        self.write_row(&row, next.clone()).await;
        self.fan_out(outbound);

        if next.status == DeviceRolloutStatus::Unhealthy || rolling_back {
            self.advance(rollout).await;
        }
        Ok(())
    }

    /// Apply a health report from a device.
    pub async fn handle_health_report(
        &self,
        device_id: &str,
        rollout_id: &str,
        healthy: bool,
        detail: Option<String>,
    ) -> RolloutResult<()> {
        if self.event_target(device_id, rollout_id)?.is_none() {
            return Ok(());
        }
        let lock = self.lock_for(rollout_id);
        let _guard = lock.lock().await;

        let Some((rollout, row)) = self.event_target(device_id, rollout_id)? else {
            self.forget_if_finished(rollout_id);
            return Ok(());
        };
        let now = self.clock.now();
        let mut next = row.clone();
        let mut outbound = Vec::new();

        if rollout.state == RolloutState::Rollback {
            if row.status != DeviceRolloutStatus::Pending {
                debug!(%device_id, %rollout_id, "health report ignored during rollback");
                return Ok(());
            }
            next.applied_at = Some(now);
            outbound.extend(self.revert_late_apply(&rollout, &mut next, now).await);
        } else {
            let target = if healthy {
                DeviceRolloutStatus::Healthy
            } else {
                DeviceRolloutStatus::Unhealthy
            };
            match row.status {
                DeviceRolloutStatus::RolledBack => {
                    debug!(%device_id, %rollout_id, "health report for rolled back device ignored");
                    return Ok(());
                }
                current if current == target => {
                    debug!(%device_id, %rollout_id, ?current, "duplicate health report");
                    return Ok(());
                }
                DeviceRolloutStatus::Pending => {
                    // Report overtook the ack.
                    next.applied_at = Some(now);
                }
                _ => {}
            }
            if row.status == DeviceRolloutStatus::Healthy && !healthy {
                warn!(%device_id, %rollout_id, "device downgraded to unhealthy");
            }
            next.status = target;
            next.health_detail = detail;
        }

        next.updated_at = now;
        debug!(%device_id, %rollout_id, from = ?row.status, to = ?next.status, "device row updated");
        self.write_row(&row, next.clone()).await;
        self.fan_out(outbound);

        if next.status == DeviceRolloutStatus::Unhealthy {
            self.advance(rollout).await;
        }
        Ok(())
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// One reconciliation pass over deferred writes and active rollouts.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.drain_retries(&mut report).await;

        let rollouts = match self.repo.list_rollouts() {
            Ok(rollouts) => rollouts,
            Err(e) => {
                error!(error = %e, "reconcile: failed to list rollouts");
                return report;
            }
        };
        for rollout in rollouts.into_iter().filter(|r| r.state.is_active()) {
            report.rollouts += 1;
            if let Err(e) = self.reconcile_rollout(&rollout.id, &mut report).await {
                warn!(rollout_id = %rollout.id, error = %e, "reconcile failed");
            }
        }
        if report.redelivered > 0 || report.transitions > 0 || report.dropped > 0 {
            info!(
                rollouts = report.rollouts,
                redelivered = report.redelivered,
                transitions = report.transitions,
                retried = report.retried,
                dropped = report.dropped,
                "reconcile pass"
            );
        }
        report
    }

    async fn reconcile_rollout(
        &self,
        rollout_id: &str,
        report: &mut ReconcileReport,
    ) -> RolloutResult<()> {
        let lock = self.lock_for(rollout_id);
        let _guard = lock.lock().await;

        let rollout = self.load(rollout_id)?;
        match rollout.state {
            RolloutState::Canary | RolloutState::Full => {
                report.redelivered += self.redeliver_updates(&rollout).await?;
            }
            RolloutState::Rollback => {
                report.redelivered += self.redeliver_rollbacks(&rollout).await?;
            }
            _ => {
                self.forget_if_finished(rollout_id);
                return Ok(());
            }
        }
        let before = rollout.state;
        if self.advance(rollout).await.state != before {
            report.transitions += 1;
        }
        Ok(())
    }

    /// Resend ApplyUpdate to PENDING devices that reconnected since the
    /// last delivery.
    async fn redeliver_updates(&self, rollout: &Rollout) -> RolloutResult<usize> {
        let rows = self.repo.list_rollout_device_statuses(&rollout.id)?;
        let due = self
            .reconnected(rows, |r| r.status == DeviceRolloutStatus::Pending)
            .await;
        if due.is_empty() {
            return Ok(0);
        }
        let artifact = self.load_artifact(&rollout.artifact_id)?;
        debug!(rollout_id = %rollout.id, devices = due.len(), "redelivering update");
        Ok(self.redeliver(due, &apply_update(&artifact, &rollout.id)).await)
    }

    /// Resend Rollback to unacknowledged devices that reconnected.
    async fn redeliver_rollbacks(&self, rollout: &Rollout) -> RolloutResult<usize> {
        let rows = self.repo.list_rollout_device_statuses(&rollout.id)?;
        let due = self
            .reconnected(rows, |r| {
                r.status == DeviceRolloutStatus::RolledBack && !r.rollback_acknowledged
            })
            .await;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(rollout_id = %rollout.id, devices = due.len(), "redelivering rollback");
        Ok(self.redeliver(due, &rollback(rollout)).await)
    }

    /// Stamp `rows` with their devices' current connections, persist the
    /// stamps and send `command`. Returns how many were stamped.
    async fn redeliver(&self, rows: Vec<RolloutDeviceStatus>, command: &ControlMessage) -> usize {
        let now = self.clock.now();
        let mut outbound = Vec::new();
        for previous in rows {
            let mut row = previous.clone();
            row.updated_at = now;
            if let Some(sent) = self.stamp(&mut row, command, now).await {
                self.write_row(&previous, row).await;
                outbound.push(sent);
            }
        }
        let stamped = outbound.len();
        self.fan_out(outbound);
        stamped
    }

    /// Rows matching `wanted` whose device is connected on a connection
    /// that has not received the row's command yet.
    async fn reconnected(
        &self,
        rows: Vec<RolloutDeviceStatus>,
        wanted: impl Fn(&RolloutDeviceStatus) -> bool,
    ) -> Vec<RolloutDeviceStatus> {
        let mut due = Vec::new();
        for row in rows.into_iter().filter(|r| wanted(r)) {
            let Some(conn) = self.registry.connection_id(&row.device_id).await else {
                continue;
            };
            if row.delivered_connection.as_deref() != Some(conn.as_str()) {
                due.push(row);
            }
        }
        due
    }

    async fn drain_retries(&self, report: &mut ReconcileReport) {
        let now = self.clock.now();
        for entry in self.retries.take_due(now).await {
            let rollout_id = entry.row.rollout_id.clone();
            let device_id = entry.row.device_id.clone();
            if !self.is_active(&rollout_id) {
                debug!(%rollout_id, %device_id, "deferred write discarded, rollout finished");
                continue;
            }
            let lock = self.lock_for(&rollout_id);
            let _guard = lock.lock().await;

            match self.retry_write(&entry) {
                Ok(()) => report.retried += 1,
                Err(StateError::RolloutTerminal(_)) => {
                    debug!(%rollout_id, %device_id, "deferred write discarded, rollout finished");
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    if !self.retries.requeue(entry, now).await {
                        error!(
                            %rollout_id,
                            %device_id,
                            attempts,
                            error = %e,
                            "status write dropped after retries"
                        );
                        lock_map(&self.dropped_writes).insert(
                            rollout_id.clone(),
                            format!(
                                "status write for device {device_id} dropped after {attempts} attempts: {e}"
                            ),
                        );
                        report.dropped += 1;
                    }
                }
            }
        }
    }

    /// Apply a deferred write if the stored row is still the one it was
    /// computed from.
    fn retry_write(&self, entry: &PendingWrite) -> Result<(), StateError> {
        let current = self
            .repo
            .get_rollout_device_status(&entry.row.rollout_id, &entry.row.device_id)?;
        match current {
            Some(current) if current == entry.row => Ok(()),
            Some(current) if current == entry.expected => {
                self.repo.update_rollout_device_status(&entry.row)
            }
            _ => {
                debug!(
                    rollout_id = %entry.row.rollout_id,
                    device_id = %entry.row.device_id,
                    "deferred write superseded"
                );
                Ok(())
            }
        }
    }

    // ── Transitions (caller holds the rollout lock) ────────────────

    /// Keep applying transitions until the rollout settles.
    ///
    /// Errors are logged; the last stored rollout is returned.
    async fn advance(&self, mut rollout: Rollout) -> Rollout {
        loop {
            let step = match rollout.state {
                RolloutState::Canary | RolloutState::Full => self.evaluate_phase(&rollout).await,
                RolloutState::Rollback => self.finish_rollback(&rollout),
                _ => Ok(None),
            };
            match step {
                Ok(Some(next)) => rollout = next,
                Ok(None) => return rollout,
                Err(e) => {
                    warn!(rollout_id = %rollout.id, state = ?rollout.state, error = %e, "rollout step failed");
                    return rollout;
                }
            }
        }
    }

    /// Evaluate the current cohort and apply the resulting transition.
    async fn evaluate_phase(&self, rollout: &Rollout) -> RolloutResult<Option<Rollout>> {
        let now = self.clock.now();
        let rows = self.repo.list_rollout_device_statuses(&rollout.id)?;
        let cohort: Vec<RolloutDeviceStatus> = match rollout.state {
            RolloutState::Canary => rows.iter().filter(|r| r.is_canary).cloned().collect(),
            _ => rows.clone(),
        };
        let (reachable, delivered_live) = self.reachable(&cohort).await;
        let verdict = evaluate_cohort(&CohortSnapshot {
            rows: &cohort,
            now,
            phase_entered_at: rollout.phase_entered_at,
            soak: Duration::from_secs(rollout.soak_secs),
            apply_timeout: self.apply_timeout(rollout),
            reachable: &reachable,
            delivered_live: &delivered_live,
        });

        match verdict {
            Verdict::Pending => Ok(None),
            Verdict::Pass if rollout.state == RolloutState::Canary => {
                self.promote(rollout, &rows, now).await.map(Some)
            }
            Verdict::Pass => self.complete(rollout, now).map(Some),
            Verdict::Fail { devices, reason } => {
                warn!(
                    rollout_id = %rollout.id,
                    state = ?rollout.state,
                    failing = ?devices,
                    %reason,
                    "cohort failed health evaluation"
                );
                self.enter_rollback(rollout, &reason, now).await.map(Some)
            }
        }
    }

    /// CANARY → FULL with the re-resolved remainder cohort.
    async fn promote(
        &self,
        rollout: &Rollout,
        rows: &[RolloutDeviceStatus],
        now: u64,
    ) -> RolloutResult<Rollout> {
        let artifact = self.load_artifact(&rollout.artifact_id)?;
        let covered: HashSet<&str> = rows.iter().map(|r| r.device_id.as_str()).collect();
        let mut remainder = Vec::new();
        for device_id in resolve_targets(self.repo.as_ref(), &rollout.org_id, &rollout.selector)? {
            if covered.contains(device_id.as_str()) {
                continue;
            }
            match self.repo.device_claim(&device_id)? {
                Some(owner) if owner != rollout.id => {
                    warn!(rollout_id = %rollout.id, %device_id, %owner, "skipping device held by another rollout");
                }
                _ => remainder.push(device_id),
            }
        }

        let mut next = rollout.clone();
        next.state = RolloutState::Full;
        next.phase_entered_at = now;
        next.updated_at = now;
        let mut transition = RolloutTransition::new(rollout.state, next);
        transition.create_rows = remainder
            .iter()
            .map(|d| RolloutDeviceStatus::pending(&rollout.id, d, false, now))
            .collect();
        let outbound = self
            .stamp_all(&mut transition.create_rows, &apply_update(&artifact, &rollout.id), now)
            .await;
        transition.claim_devices = remainder;
        let stored = self.commit(&transition)?;
        info!(
            rollout_id = %rollout.id,
            remainder = transition.create_rows.len(),
            "canary passed, rollout promoted to full"
        );

        self.fan_out(outbound);
        Ok(stored)
    }

    /// FULL → COMPLETE.
    fn complete(&self, rollout: &Rollout, now: u64) -> RolloutResult<Rollout> {
        let mut next = rollout.clone();
        next.state = RolloutState::Complete;
        next.completed_at = Some(now);
        next.phase_entered_at = now;
        next.updated_at = now;
        let mut transition = RolloutTransition::new(rollout.state, next);
        transition.release_claims = true;
        let stored = self.commit(&transition)?;
        info!(rollout_id = %rollout.id, "rollout complete");
        Ok(stored)
    }

    /// Any pre-terminal state → ROLLBACK, reverting every device that may
    /// run the new artifact.
    async fn enter_rollback(
        &self,
        rollout: &Rollout,
        reason: &str,
        now: u64,
    ) -> RolloutResult<Rollout> {
        check_transition(&rollout.id, rollout.state, RolloutState::Rollback)?;
        let rows = self.repo.list_rollout_device_statuses(&rollout.id)?;
        let reverted: Vec<RolloutDeviceStatus> = rows
            .into_iter()
            .filter(|r| {
                matches!(
                    r.status,
                    DeviceRolloutStatus::InProgress
                        | DeviceRolloutStatus::Healthy
                        | DeviceRolloutStatus::Unhealthy
                )
            })
            .map(|mut r| {
                r.status = DeviceRolloutStatus::RolledBack;
                r.rollback_acknowledged = false;
                r.updated_at = now;
                r
            })
            .collect();

        let mut next = rollout.clone();
        next.state = RolloutState::Rollback;
        next.phase_entered_at = now;
        next.updated_at = now;
        next.failure_reason = Some(reason.to_string());
        let command = rollback(&next);
        let mut transition = RolloutTransition::new(rollout.state, next);
        transition.update_rows = reverted;
        let outbound = self.stamp_all(&mut transition.update_rows, &command, now).await;
        let stored = self.commit(&transition)?;
        warn!(
            rollout_id = %rollout.id,
            from = ?rollout.state,
            devices = transition.update_rows.len(),
            %reason,
            "rollout rolling back"
        );

        self.fan_out(outbound);
        Ok(stored)
    }

    /// ROLLBACK → FAILED once every reverted device acknowledged, or the
    /// rollback timeout passed.
    fn finish_rollback(&self, rollout: &Rollout) -> RolloutResult<Option<Rollout>> {
        let now = self.clock.now();
        let rows = self.repo.list_rollout_device_statuses(&rollout.id)?;
        let unacked = rows
            .iter()
            .filter(|r| r.status == DeviceRolloutStatus::RolledBack && !r.rollback_acknowledged)
            .count();
        let timed_out =
            now.saturating_sub(rollout.phase_entered_at) >= self.config.rollback_timeout.as_secs();
        if unacked > 0 && !timed_out {
            return Ok(None);
        }
        if unacked > 0 {
            warn!(rollout_id = %rollout.id, unacked, "rollback timed out waiting for devices");
        }

        let mut next = rollout.clone();
        next.state = RolloutState::Failed;
        next.completed_at = Some(now);
        next.phase_entered_at = now;
        next.updated_at = now;
        let mut transition = RolloutTransition::new(rollout.state, next);
        transition.release_claims = true;
        let stored = self.commit(&transition)?;
        info!(
            rollout_id = %rollout.id,
            reason = stored.failure_reason.as_deref().unwrap_or(""),
            "rollout failed"
        );
        Ok(Some(stored))
    }

    /// Apply a transition, checking the lifecycle edge first.
    fn commit(&self, transition: &RolloutTransition) -> RolloutResult<Rollout> {
        let rollout_id = transition.rollout.id.as_str();
        check_transition(rollout_id, transition.expected_state, transition.rollout.state)?;
        let stored = match self.repo.apply_transition(transition) {
            Ok(stored) => stored,
            Err(StateError::StaleState { actual, .. }) => {
                return Err(RolloutError::conflict(
                    rollout_id,
                    actual,
                    "rollout state changed concurrently",
                ));
            }
            Err(StateError::Conflict(reason)) => {
                return Err(RolloutError::conflict(
                    rollout_id,
                    transition.expected_state,
                    reason,
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if stored.state.is_terminal() {
            self.forget(rollout_id);
        }
        Ok(stored)
    }

    // ── Delivery ───────────────────────────────────────────────────

    /// Stamp every row whose device is connected. Rows of offline devices
    /// are left unstamped for the reconciler.
    async fn stamp_all(
        &self,
        rows: &mut [RolloutDeviceStatus],
        command: &ControlMessage,
        now: u64,
    ) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for row in rows.iter_mut() {
            if let Some(sent) = self.stamp(row, command, now).await {
                outbound.push(sent);
            }
        }
        outbound
    }

    /// Bind `row` to its device's current connection.
    async fn stamp(
        &self,
        row: &mut RolloutDeviceStatus,
        command: &ControlMessage,
        now: u64,
    ) -> Option<Outbound> {
        let connection_id = self.registry.connection_id(&row.device_id).await;
        row.delivered_connection = connection_id.clone();
        row.delivered_at = connection_id.as_ref().map(|_| now);
        let Some(connection_id) = connection_id else {
            debug!(rollout_id = %row.rollout_id, device_id = %row.device_id, "device offline, command deferred");
            return None;
        };
        row.delivery_attempts += 1;
        Some(Outbound {
            row: row.clone(),
            connection_id,
            command: command.clone(),
        })
    }

    /// Hand stamped commands to the registry from a detached task.
    ///
    /// Sends run concurrently, so a batch takes at most one send timeout and
    /// the caller never waits on a device channel.
    fn fan_out(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let sends = outbound
                .iter()
                .map(|o| engine.send_command(&o.row.device_id, o.command.clone()));
            let results = join_all(sends).await;
            for (sent, result) in outbound.into_iter().zip(results) {
                engine.record_delivery(sent, result).await;
            }
        });
    }

    async fn send_command(&self, device_id: &str, command: ControlMessage) -> RolloutResult<String> {
        Ok(self.registry.send(device_id, command).await?)
    }

    /// Correct a row's stamp after its send completed.
    ///
    /// The outcome is dropped when the rollout has finished or the row has
    /// been re-stamped since.
    async fn record_delivery(&self, sent: Outbound, result: RolloutResult<String>) {
        let rollout_id = sent.row.rollout_id.as_str();
        let device_id = sent.row.device_id.as_str();
        let actual = match result {
            Ok(connection_id) if connection_id == sent.connection_id => return,
            Ok(connection_id) => Some(connection_id),
            Err(RolloutError::NotConnected(_)) => {
                debug!(%rollout_id, %device_id, "device left before delivery, command deferred");
                None
            }
            Err(e) => {
                warn!(%rollout_id, %device_id, error = %e, "command delivery failed");
                None
            }
        };
        if !self.is_active(rollout_id) {
            return;
        }

        let lock = self.lock_for(rollout_id);
        let _guard = lock.lock().await;
        if self.is_active(rollout_id) {
            self.restamp(&sent, actual).await;
        }
        self.forget_if_finished(rollout_id);
    }

    /// Replace the stamp `sent` left on its row, unless the row moved on.
    async fn restamp(&self, sent: &Outbound, actual: Option<String>) {
        let rollout_id = sent.row.rollout_id.as_str();
        let device_id = sent.row.device_id.as_str();
        let current = match self.repo.get_rollout_device_status(rollout_id, device_id) {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(%rollout_id, %device_id, error = %e, "delivery outcome not recorded");
                return;
            }
        };
        if current.status != sent.row.status
            || current.delivered_connection != sent.row.delivered_connection
            || current.delivered_at != sent.row.delivered_at
        {
            debug!(%rollout_id, %device_id, "delivery outcome superseded");
            return;
        }
        let now = self.clock.now();
        let mut next = current.clone();
        next.delivered_at = actual.as_ref().map(|_| now);
        next.delivered_connection = actual;
        next.updated_at = now;
        self.write_row(&current, next).await;
    }

    /// A device applied an update after its rollout began rolling back.
    async fn revert_late_apply(
        &self,
        rollout: &Rollout,
        row: &mut RolloutDeviceStatus,
        now: u64,
    ) -> Option<Outbound> {
        warn!(
            rollout_id = %rollout.id,
            device_id = %row.device_id,
            "late apply during rollback, reverting device"
        );
        row.status = DeviceRolloutStatus::RolledBack;
        row.rollback_acknowledged = false;
        self.stamp(row, &rollback(rollout), now).await
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Write a status row; park it for the reconciler if the write fails.
    async fn write_row(&self, previous: &RolloutDeviceStatus, row: RolloutDeviceStatus) {
        match self.repo.update_rollout_device_status(&row) {
            Ok(()) => {}
            Err(StateError::RolloutTerminal(_)) => {
                debug!(rollout_id = %row.rollout_id, device_id = %row.device_id, "row write discarded, rollout finished");
            }
            Err(e) => {
                warn!(
                    rollout_id = %row.rollout_id,
                    device_id = %row.device_id,
                    error = %e,
                    "status write failed, deferring"
                );
                self.retries
                    .push(row, previous.clone(), self.clock.now())
                    .await;
            }
        }
    }

    /// The rollout and row an inbound device event refers to, if it should
    /// be applied at all.
    fn event_target(
        &self,
        device_id: &str,
        rollout_id: &str,
    ) -> RolloutResult<Option<(Rollout, RolloutDeviceStatus)>> {
        let Some(rollout) = self.repo.get_rollout(rollout_id)? else {
            warn!(%device_id, %rollout_id, "event for unknown rollout discarded");
            return Ok(None);
        };
        if rollout.state.is_terminal() {
            warn!(%device_id, %rollout_id, state = ?rollout.state, "event for finished rollout discarded");
            return Ok(None);
        }
        let Some(row) = self.repo.get_rollout_device_status(rollout_id, device_id)? else {
            warn!(%device_id, %rollout_id, "event from device outside the rollout discarded");
            return Ok(None);
        };
        Ok(Some((rollout, row)))
    }

    /// Devices of `rows` that are connected and heartbeating, and those
    /// whose stamped connection is the one they are on now.
    async fn reachable(
        &self,
        rows: &[RolloutDeviceStatus],
    ) -> (HashSet<DeviceId>, HashSet<DeviceId>) {
        let mut reachable = HashSet::new();
        let mut delivered_live = HashSet::new();
        for row in rows {
            let Some(connection_id) = self.registry.connection_id(&row.device_id).await else {
                continue;
            };
            if row.delivered_connection.as_deref() == Some(connection_id.as_str()) {
                delivered_live.insert(row.device_id.clone());
            }
            if self.liveness.is_device_online(&row.device_id) {
                reachable.insert(row.device_id.clone());
            }
        }
        (reachable, delivered_live)
    }

    fn claimed_elsewhere(&self, rollout_id: &str, targets: &[DeviceId]) -> RolloutResult<Vec<String>> {
        let mut held = Vec::new();
        for device_id in targets {
            if let Some(owner) = self.repo.device_claim(device_id)? {
                if owner != rollout_id {
                    held.push(format!("{device_id} ({owner})"));
                }
            }
        }
        Ok(held)
    }

    fn apply_timeout(&self, rollout: &Rollout) -> Duration {
        rollout
            .apply_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_apply_timeout)
    }

    fn load(&self, rollout_id: &str) -> RolloutResult<Rollout> {
        self.repo
            .get_rollout(rollout_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("rollout {rollout_id}")))
    }

    fn load_artifact(&self, artifact_id: &str) -> RolloutResult<Artifact> {
        self.repo
            .get_artifact(artifact_id)?
            .ok_or_else(|| RolloutError::NotFound(format!("artifact {artifact_id}")))
    }

    fn is_active(&self, rollout_id: &str) -> bool {
        matches!(self.repo.get_rollout(rollout_id), Ok(Some(r)) if r.state.is_active())
    }

    fn lock_for(&self, rollout_id: &str) -> Arc<Mutex<()>> {
        lock_map(&self.locks)
            .entry(rollout_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop bookkeeping for a finished rollout.
    fn forget(&self, rollout_id: &str) {
        lock_map(&self.locks).remove(rollout_id);
        lock_map(&self.dropped_writes).remove(rollout_id);
    }

    /// [`forget`](Self::forget) if the rollout is gone or terminal.
    fn forget_if_finished(&self, rollout_id: &str) {
        match self.repo.get_rollout(rollout_id) {
            Ok(Some(r)) if !r.state.is_terminal() => {}
            Ok(_) => self.forget(rollout_id),
            Err(e) => debug!(%rollout_id, error = %e, "rollout lookup failed, scope kept"),
        }
    }
}

fn lock_map<T>(map: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn apply_update(artifact: &Artifact, rollout_id: &str) -> ControlMessage {
    ControlMessage::ApplyUpdate {
        rollout_id: rollout_id.to_string(),
        artifact_id: artifact.id.clone(),
        content_hash: artifact.content_hash.clone(),
        signature: artifact.signature.clone(),
    }
}

fn rollback(rollout: &Rollout) -> ControlMessage {
    ControlMessage::Rollback {
        rollout_id: rollout.id.clone(),
        reason: rollout.failure_reason.clone().unwrap_or_default(),
    }
}

#[async_trait]
impl RolloutEvents for RolloutEngine {
    async fn on_update_ack(&self, device_id: &str, rollout_id: &str, status: AckStatus) {
        if let Err(e) = self.handle_update_ack(device_id, rollout_id, status).await {
            warn!(%device_id, %rollout_id, error = %e, "update ack not applied");
        }
    }

    async fn on_health_report(
        &self,
        device_id: &str,
        rollout_id: &str,
        healthy: bool,
        detail: Option<String>,
    ) {
        if let Err(e) = self
            .handle_health_report(device_id, rollout_id, healthy, detail)
            .await
        {
            warn!(%device_id, %rollout_id, error = %e, "health report not applied");
        }
    }
}
