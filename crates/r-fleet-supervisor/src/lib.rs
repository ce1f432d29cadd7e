//! ---
//! fleet_section: "06-supervision"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch worker supervision."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Launch worker supervision.
//!
//! Each in-flight launch runs on its own thread and is registered here under
//! its network. Workers touch their entry while making progress; entries that
//! go quiet for longer than the activity timeout are interrupted and, after a
//! grace period, abandoned.

#![warn(missing_docs)]

pub mod interrupt;
pub mod supervisor;

pub use interrupt::{Interrupt, Interrupted};
pub use supervisor::{LaunchSupervisor, LaunchWorker, SupervisorError, TerminateHook};
