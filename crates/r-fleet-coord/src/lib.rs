//! ---
//! fleet_section: "04-coordination"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Coordination store and distributed network lock."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Shared coordination primitives.
//!
//! Every call goes to the [`CoordinationStore`]; nothing about lock state is
//! cached in process, so two launchers sharing a store observe the same lease.

pub mod lock;
pub mod store;

pub use lock::{DistributedLock, LockError, LockToken};
pub use store::{CoordinationStore, MemoryStore, Namespace, StoreError};
