//! Deferred status-row writes.
//!
//! Inline message handlers never retry a failed repository write
//! themselves. They park the row here and the reconciler drains it with
//! exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use safeedge_state::RolloutDeviceStatus;
use tokio::sync::Mutex;

/// Backoff schedule for deferred writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped at `max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// A status row write that failed and waits for another try.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// The row as it should be stored.
    pub row: RolloutDeviceStatus,
    /// The stored row the write was computed from. The retry only applies
    /// while the stored row still equals this.
    pub expected: RolloutDeviceStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Clock reading after which the next attempt is due.
    pub next_at: u64,
}

/// Deferred writes keyed by `(rollout_id, device_id)`. A newer write for
/// the same row replaces the queued one.
#[derive(Debug, Default)]
pub struct RetryQueue {
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, PendingWrite>>,
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Park a write that failed once.
    pub async fn push(&self, row: RolloutDeviceStatus, expected: RolloutDeviceStatus, now: u64) {
        let entry = PendingWrite {
            next_at: now + secs_ceil(self.policy.backoff(0)),
            row,
            expected,
            attempts: 1,
        };
        let mut entries = self.entries.lock().await;
        // Keep the oldest snapshot so the CAS still matches the stored row.
        let key = entry.row.table_key();
        let entry = match entries.remove(&key) {
            Some(old) => PendingWrite {
                expected: old.expected,
                attempts: old.attempts,
                ..entry
            },
            None => entry,
        };
        entries.insert(key, entry);
    }

    /// Remove and return every entry due at `now`.
    pub async fn take_due(&self, now: u64) -> Vec<PendingWrite> {
        let mut entries = self.entries.lock().await;
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.next_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out: Vec<PendingWrite> = due.iter().filter_map(|k| entries.remove(k)).collect();
        out.sort_by(|a, b| a.row.table_key().cmp(&b.row.table_key()));
        out
    }

    /// Put back an entry whose attempt failed again.
    ///
    /// Returns `false`, dropping the entry, once `max_attempts` is reached.
    pub async fn requeue(&self, mut entry: PendingWrite, now: u64) -> bool {
        entry.attempts += 1;
        if entry.attempts >= self.policy.max_attempts {
            return false;
        }
        entry.next_at = now + secs_ceil(self.policy.backoff(entry.attempts - 1));
        let mut entries = self.entries.lock().await;
        // A newer write may have been parked meanwhile.
        entries.entry(entry.row.table_key()).or_insert(entry);
        true
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn secs_ceil(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000).max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use safeedge_state::DeviceRolloutStatus;

    fn rows(status: DeviceRolloutStatus) -> (RolloutDeviceStatus, RolloutDeviceStatus) {
        let expected = RolloutDeviceStatus::pending("r-1", "dev-1", true, 0);
        let mut row = expected.clone();
        row.status = status;
        (row, expected)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(6), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn entries_become_due_after_backoff() {
        let queue = RetryQueue::new(RetryPolicy::default());
        let (row, expected) = rows(DeviceRolloutStatus::InProgress);
        queue.push(row, expected, 100).await;

        assert!(queue.take_due(100).await.is_empty());
        let due = queue.take_due(101).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn newer_write_replaces_queued_row() {
        let queue = RetryQueue::new(RetryPolicy::default());
        let (first, expected) = rows(DeviceRolloutStatus::InProgress);
        let (second, _) = rows(DeviceRolloutStatus::Healthy);
        queue.push(first, expected.clone(), 0).await;
        queue.push(second, first_expected_mismatch(), 0).await;

        let due = queue.take_due(10).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].row.status, DeviceRolloutStatus::Healthy);
        assert_eq!(due[0].expected, expected);
    }

    fn first_expected_mismatch() -> RolloutDeviceStatus {
        let mut r = RolloutDeviceStatus::pending("r-1", "dev-1", true, 0);
        r.status = DeviceRolloutStatus::InProgress;
        r
    }

    #[tokio::test]
    async fn requeue_gives_up_after_max_attempts() {
        let queue = RetryQueue::new(RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        });
        let (row, expected) = rows(DeviceRolloutStatus::Healthy);
        queue.push(row, expected, 0).await;

        let entry = queue.take_due(1).await.remove(0);
        assert!(queue.requeue(entry, 1).await);
        // Second backoff is 2s.
        assert!(queue.take_due(2).await.is_empty());
        let entry = queue.take_due(3).await.remove(0);
        assert_eq!(entry.attempts, 2);
        assert!(!queue.requeue(entry, 3).await);
        assert_eq!(queue.len().await, 0);
    }
}
