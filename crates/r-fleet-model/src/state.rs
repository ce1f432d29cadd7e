//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Lifecycle state machines for networks and nodes."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Lifecycle of a network.
///
/// `created -> setup -> running -> stopping -> stopped -> setup ...`, with
/// `restoring` as the parallel branch of `setup` used by restore flows and
/// `error_stopping` reachable from any active state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetworkState {
    /// Freshly defined, never launched.
    Created,
    /// A launch is in progress.
    Setup,
    /// At least one node is running.
    Running,
    /// Nodes are being torn down.
    Stopping,
    /// No nodes are running.
    Stopped,
    /// A launch from backup is in progress.
    Restoring,
    /// Teardown failed or an inconsistency was detected.
    ErrorStopping,
}

impl NetworkState {
    /// Only `created` and `stopped` networks accept a new launch.
    pub fn can_start(self) -> bool {
        matches!(self, NetworkState::Created | NetworkState::Stopped)
    }
}

/// Lifecycle of a single node.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeState {
    /// Record exists, nothing allocated yet.
    Created,
    /// Allocation requested from the compute driver.
    Starting,
    /// Compute driver is bringing the instance up.
    Booting,
    /// Instance is up with an address.
    Booted,
    /// Install files are being staged.
    PreparingInstall,
    /// Waiting for DNS records to resolve.
    AwaitingDns,
    /// Remote install is running.
    Installing,
    /// Fully provisioned.
    Running,
    /// Operator requested stop.
    Stopping,
    /// Deallocated.
    Stopped,
    /// Instance stopped answering.
    Unreachable,
    /// Being torn down after a failure.
    ErrorStopping,
    /// Torn down after a failure.
    ErrorStopped,
    /// A launch step failed in an unclassified way.
    UnknownError,
}

impl NodeState {
    /// `running` and `stopped` are the only settled states.
    pub fn is_settled(self) -> bool {
        matches!(self, NodeState::Running | NodeState::Stopped)
    }

    /// Whether the node may still hold cloud resources or be mid-launch.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            NodeState::Stopped | NodeState::ErrorStopped | NodeState::UnknownError
        )
    }
}
