//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Node records."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::request::LaunchRequest;
use crate::state::NodeState;

/// Tag carrying the provider instance identifier.
pub const TAG_INSTANCE_ID: &str = "instance_id";
/// Tag carrying the message of the failure that stopped the node.
pub const TAG_ERROR: &str = "error";

/// One launched instance of the software stack.
///
/// Created in a minimal form and enriched as the launch pipeline advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier.
    pub id: String,
    /// Owning network.
    pub network: String,
    /// Owning account.
    pub account: String,
    /// Short host name.
    pub host: String,
    /// Fully qualified domain name.
    pub fqdn: String,
    /// Cloud service hosting the node.
    pub cloud: String,
    /// Region within that cloud.
    pub region: String,
    /// Provider specific size name.
    #[serde(default)]
    pub size: Option<String>,
    /// Public IPv4 address, once allocated.
    #[serde(default)]
    pub ip4: Option<Ipv4Addr>,
    /// Public IPv6 address, once allocated.
    #[serde(default)]
    pub ip6: Option<Ipv6Addr>,
    /// User for remote execution, once allocated.
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Lifecycle state.
    pub state: NodeState,
    /// Node that vouches for this one.
    #[serde(default)]
    pub sage: Option<String>,
    /// Ephemeral provider and diagnostic tags.
    #[serde(default)]
    pub tags: IndexMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Minimal node record for a launch request targeting `cloud`/`region`.
    pub fn for_request(request: &LaunchRequest, cloud: &str, region: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            network: request.network.clone(),
            account: request.account.clone(),
            host: request.host.clone(),
            fqdn: request.fqdn.clone(),
            cloud: cloud.to_owned(),
            region: region.to_owned(),
            size: None,
            ip4: None,
            ip6: None,
            ssh_user: None,
            state: NodeState::Created,
            sage: None,
            tags: IndexMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `state`, stamping the modification time.
    pub fn transition(&mut self, state: NodeState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Whether the node holds a routable address.
    pub fn has_address(&self) -> bool {
        self.ip4.is_some() || self.ip6.is_some()
    }

    /// Preferred address for remote execution.
    pub fn address(&self) -> Option<String> {
        self.ip4
            .map(|ip| ip.to_string())
            .or_else(|| self.ip6.map(|ip| ip.to_string()))
    }

    /// Set or replace a tag.
    pub fn tag(&mut self, key: &str, value: impl Into<String>) {
        self.tags.insert(key.to_owned(), value.into());
    }

    /// Whether the node may still hold cloud resources.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
