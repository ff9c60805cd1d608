//! safeedge-rollout — staged software rollouts with health-driven rollback.
//!
//! # Components
//!
//! - **`resolver`**: selector validation, deterministic target ordering, canary split
//! - **`verifier`**: artifact hash/signature checks against trusted keys
//! - **`evaluator`**: pure cohort health verdict (pending / pass / fail)
//! - **`machine`**: the lifecycle edge table
//! - **`engine`**: the state machine with its side effects (rows, claims, commands)
//! - **`retry`**: deferred status writes with exponential backoff
//! - **`reconciler`**: periodic pass driving soak expiry, timeouts and redelivery
//!
//! ```text
//!            start()                 pass                 pass
//!   DRAFT ───────────▶ CANARY ───────────▶ FULL ───────────▶ COMPLETE
//!     │                  │ fail/abort        │ fail/abort
//!     │ abort            ▼                   ▼
//!     └────────────▶ ROLLBACK ──acked/timeout──▶ FAILED
//! ```

pub mod engine;
pub mod error;
pub mod evaluator;
pub mod machine;
pub mod reconciler;
pub mod resolver;
pub mod retry;
pub mod verifier;

pub use engine::{EngineConfig, NewRollout, ReconcileReport, RolloutEngine, StuckRollout};
pub use error::{RolloutError, RolloutResult};
pub use evaluator::{CohortSnapshot, Verdict, evaluate_cohort};
pub use machine::{check_transition, is_valid_transition};
pub use reconciler::{DEFAULT_RECONCILE_INTERVAL, Reconciler};
pub use resolver::{Cohorts, canary_size, partition, resolve_targets, validate_selector};
pub use retry::RetryPolicy;
pub use safeedge_registry::{Clock, ManualClock, SystemClock};
pub use verifier::{ArtifactVerifier, TrustedKeys, hash_content, sign_artifact, signing_message};
