//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Network, node, and launch request records."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Entity records the launch engine reads and mutates.
//!
//! Persistence is an external concern; [`FleetRepository`] is the narrow
//! interface the engine needs and [`InMemoryRepository`] backs tests and the
//! simulator.

#![warn(missing_docs)]

pub mod cloud;
pub mod network;
pub mod node;
pub mod repository;
pub mod request;
pub mod state;

pub use cloud::{CloudService, Subscription};
pub use network::Network;
pub use node::Node;
pub use repository::{FleetRepository, InMemoryRepository, RepositoryError};
pub use request::{CloudRegion, LaunchRequest, NetLocation};
pub use state::{NetworkState, NodeState};
