//! Error types for the SafeEdge fleet repository.

use thiserror::Error;

use crate::types::RolloutState;

/// Result type alias for repository operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A create collided with an existing record, or a device is already
    /// claimed by another rollout.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Compare-and-set on the rollout state failed.
    #[error("rollout {rollout_id} is {actual:?}, expected {expected:?}")]
    StaleState {
        rollout_id: String,
        expected: RolloutState,
        actual: RolloutState,
    },

    /// A write conditioned on a non-terminal rollout hit a finished one.
    #[error("rollout {0} is terminal")]
    RolloutTerminal(String),
}
