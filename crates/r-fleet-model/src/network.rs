//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Network records."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::CloudRegion;
use crate::state::NetworkState;

/// A logical group of nodes owned by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Stable identifier.
    pub id: String,
    /// Owning account.
    pub account: String,
    /// Short name, used as the first label of the network domain.
    pub name: String,
    /// Parent DNS domain.
    pub domain: String,
    /// Cloud service that publishes DNS records for this network.
    pub dns_cloud: String,
    /// Provider-neutral compute size type for new nodes.
    pub compute_size: String,
    /// Host to reuse when the network is a fork of an existing one.
    #[serde(default)]
    pub fork_host: Option<String>,
    /// Admin public key installed on every node.
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Allowed placements, in order of preference.
    #[serde(default)]
    pub footprint: Vec<CloudRegion>,
    /// Lifecycle state.
    pub state: NetworkState,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl Network {
    /// Build a network in the `created` state.
    pub fn new(
        id: impl Into<String>,
        account: impl Into<String>,
        name: impl Into<String>,
        domain: impl Into<String>,
        dns_cloud: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            account: account.into(),
            name: name.into(),
            domain: domain.into(),
            dns_cloud: dns_cloud.into(),
            compute_size: "small".to_owned(),
            fork_host: None,
            ssh_key: None,
            footprint: Vec::new(),
            state: NetworkState::Created,
            updated_at: Utc::now(),
        }
    }

    /// DNS suffix shared by every node of this network.
    pub fn network_domain(&self) -> String {
        format!("{}.{}", self.name, self.domain)
    }

    /// Fully qualified name of `host` inside this network.
    pub fn node_fqdn(&self, host: &str) -> String {
        format!("{}.{}", host, self.network_domain())
    }

    /// Whether this network reuses an existing host name.
    pub fn is_fork(&self) -> bool {
        self.fork_host.is_some()
    }

    /// Move to `state`, stamping the modification time.
    pub fn transition(&mut self, state: NetworkState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}
