//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Cloud service and subscription records."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// A configured cloud provider account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudService {
    /// Stable identifier, also the driver registry key.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owning account.
    pub account: String,
    /// Cloud this one delegates its calls to.
    #[serde(default)]
    pub delegated_to: Option<String>,
    /// Node that hosts the delegate.
    #[serde(default)]
    pub delegate_node: Option<String>,
}

impl CloudService {
    /// Build a cloud that runs its own driver.
    pub fn new(id: impl Into<String>, name: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            account: account.into(),
            delegated_to: None,
            delegate_node: None,
        }
    }

    /// Whether calls go through another cloud.
    pub fn is_delegated(&self) -> bool {
        self.delegated_to.is_some()
    }
}

/// Billing plan attached to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Owning account.
    pub account: String,
    /// Covered network.
    pub network: String,
    /// Whether the plan currently permits launches.
    pub enabled: bool,
    /// Node entitlement.
    pub nodes_included: usize,
}
