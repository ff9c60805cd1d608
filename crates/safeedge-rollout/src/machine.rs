//! Rollout lifecycle edges.
//!
//! ```text
//! DRAFT ──start──▶ CANARY ──pass──▶ FULL ──pass──▶ COMPLETE
//!   │                │                │
//!   └──abort──┐      └──fail/abort──┐ └──fail/abort──┐
//!             ▼                     ▼                ▼
//!          ROLLBACK ◀───────────────┴────────────────┘
//!             │
//!             └──acked/timeout──▶ FAILED
//! ```

use safeedge_state::RolloutState;

use crate::error::{RolloutError, RolloutResult};

/// Whether `from → to` is an edge of the lifecycle.
pub fn is_valid_transition(from: RolloutState, to: RolloutState) -> bool {
    use RolloutState::*;
    matches!(
        (from, to),
        (Draft, Canary)
            | (Draft, Rollback)
            | (Canary, Full)
            | (Canary, Rollback)
            | (Full, Complete)
            | (Full, Rollback)
            | (Rollback, Failed)
    )
}

/// `Ok` if `from → to` is an edge, `ConflictingTransition` otherwise.
pub fn check_transition(rollout_id: &str, from: RolloutState, to: RolloutState) -> RolloutResult<()> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(RolloutError::conflict(
            rollout_id,
            from,
            format!("{from:?} cannot move to {to:?}"),
        ))
    }
}
