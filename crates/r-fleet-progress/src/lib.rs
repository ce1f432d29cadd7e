//! ---
//! fleet_section: "05-observability"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch progress tracking."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Launch progress tracking.
//!
//! Provisioning output is matched line by line against an ordered tick list
//! ([`TickCatalog`]); each match publishes a [`ProgressTick`] to the
//! coordination store where status readers pick it up.

pub mod catalog;
pub mod cursor;
pub mod meter;
pub mod status;
pub mod tick;

pub use catalog::{error_message_key, lines, ErrorLine, TickCatalog};
pub use cursor::{Advance, TickCursor};
pub use meter::{LivenessHook, MeterError, MeterIdentity, ProgressMeter};
pub use status::LaunchStatusStore;
pub use tick::{ProgressTick, TickError, TickMatch, TickPattern, TickSpec};

/// Key of the terminal tick published on success.
pub const METER_COMPLETED: &str = "meter_completed";
/// Key of the terminal tick published on cancellation.
pub const METER_CANCELED: &str = "meter_canceled";
/// Key published when node start or DNS setup failed without a specific line.
pub const METER_START_OR_DNS_ERROR: &str = "meter_start_or_dns_error";
/// Key of error ticks whose line is not in the error table.
pub const METER_UNKNOWN_ERROR: &str = "meter_unknown_error";
/// Prefix shared by the keys of every progress tick.
pub const TICK_PREFIX: &str = "meter_tick_";
