//! safeedge-state — the fleet repository for the SafeEdge control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for devices, artifacts, rollouts, per-device rollout status rows,
//! and the device claims that keep two rollouts from driving the same device.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Status rows use the composite key `{rollout_id}:{device_id}`, so the key
//! itself enforces at most one row per pair.
//!
//! Rollout state changes go through [`StateStore::apply_transition`], which
//! compares-and-sets the rollout state and writes every touched status row
//! and claim in a single write transaction.
//!
//! The rollout core consumes the store through the [`FleetRepository`]
//! trait; `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use repository::FleetRepository;
pub use store::StateStore;
pub use types::*;
