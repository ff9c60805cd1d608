//! Error types for rollout orchestration.

use safeedge_registry::SendError;
use safeedge_state::{RolloutState, StateError};
use thiserror::Error;

/// Result type alias for rollout operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors surfaced by the rollout engine.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Malformed selector, out-of-range percentage, bad durations.
    /// Rejected at creation; the rollout never enters DRAFT.
    #[error("validation error: {0}")]
    Validation(String),

    /// The artifact failed trust verification. The rollout stays in DRAFT.
    #[error("untrusted artifact {artifact_id}: {reason}")]
    UntrustedArtifact { artifact_id: String, reason: String },

    /// The device has no live session. The command stays pending until it
    /// reconnects.
    #[error("device {0} is not connected")]
    NotConnected(String),

    /// The device channel stayed full past the send timeout, or closed.
    #[error("command delivery failed: {0}")]
    Delivery(SendError),

    /// The requested transition is not valid from the current state, or
    /// target devices are held by another active rollout.
    #[error("conflicting transition for rollout {rollout_id} in {state:?}: {reason}")]
    ConflictingTransition {
        rollout_id: String,
        state: RolloutState,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<SendError> for RolloutError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::NotConnected(device_id) => Self::NotConnected(device_id),
            other => Self::Delivery(other),
        }
    }
}

impl RolloutError {
    pub(crate) fn untrusted(artifact_id: &str, reason: impl Into<String>) -> Self {
        Self::UntrustedArtifact {
            artifact_id: artifact_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn conflict(rollout_id: &str, state: RolloutState, reason: impl Into<String>) -> Self {
        Self::ConflictingTransition {
            rollout_id: rollout_id.to_string(),
            state,
            reason: reason.into(),
        }
    }
}
