//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Record repository interface and in-memory implementation."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use indexmap::IndexMap;
use parking_lot::RwLock;
use thiserror::Error;

use crate::cloud::{CloudService, Subscription};
use crate::network::Network;
use crate::node::Node;
use crate::state::{NetworkState, NodeState};

/// Errors raised by record repositories.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind, e.g. `network`.
        kind: &'static str,
        /// Requested identifier.
        id: String,
    },
    /// The backing store failed.
    #[error("repository backend failure: {0}")]
    Backend(String),
}

/// Convenience alias for repository results.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Persistence of the records the launch engine reads and mutates.
pub trait FleetRepository: Send + Sync {
    /// Look up a network.
    fn network(&self, id: &str) -> Result<Option<Network>>;
    /// Insert or replace a network.
    fn save_network(&self, network: &Network) -> Result<()>;
    /// Look up a node.
    fn node(&self, id: &str) -> Result<Option<Node>>;
    /// Insert or replace a node.
    fn save_node(&self, node: &Node) -> Result<()>;
    /// Remove a node record.
    fn delete_node(&self, id: &str) -> Result<()>;
    /// All nodes belonging to `network`.
    fn nodes_for_network(&self, network: &str) -> Result<Vec<Node>>;
    /// Look up a cloud service.
    fn cloud(&self, id: &str) -> Result<Option<CloudService>>;
    /// Plan covering `network` for `account`.
    fn subscription(&self, account: &str, network: &str) -> Result<Option<Subscription>>;

    /// Look up a network, failing when it is missing.
    fn require_network(&self, id: &str) -> Result<Network> {
        self.network(id)?.ok_or_else(|| RepositoryError::NotFound {
            kind: "network",
            id: id.to_owned(),
        })
    }

    /// Reload a network, move it to `state` and persist it.
    fn update_network_state(&self, id: &str, state: NetworkState) -> Result<Network> {
        let mut network = self.require_network(id)?;
        network.transition(state);
        self.save_network(&network)?;
        Ok(network)
    }

    /// Move `node` to `state` and persist it.
    fn update_node_state(&self, node: &mut Node, state: NodeState) -> Result<()> {
        node.transition(state);
        self.save_node(node)
    }

    /// Nodes of `network` that may still hold cloud resources.
    fn active_nodes(&self, network: &str) -> Result<Vec<Node>> {
        Ok(self
            .nodes_for_network(network)?
            .into_iter()
            .filter(Node::is_active)
            .collect())
    }
}

#[derive(Debug, Default)]
struct Tables {
    networks: IndexMap<String, Network>,
    nodes: IndexMap<String, Node>,
    clouds: IndexMap<String, CloudService>,
    subscriptions: IndexMap<(String, String), Subscription>,
}

/// Repository keeping every record in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a cloud service.
    pub fn save_cloud(&self, cloud: CloudService) {
        self.tables.write().clouds.insert(cloud.id.clone(), cloud);
    }

    /// Insert or replace a subscription.
    pub fn save_subscription(&self, subscription: Subscription) {
        let key = (subscription.account.clone(), subscription.network.clone());
        self.tables.write().subscriptions.insert(key, subscription);
    }
}

impl FleetRepository for InMemoryRepository {
    fn network(&self, id: &str) -> Result<Option<Network>> {
        Ok(self.tables.read().networks.get(id).cloned())
    }

    fn save_network(&self, network: &Network) -> Result<()> {
        self.tables
            .write()
            .networks
            .insert(network.id.clone(), network.clone());
        Ok(())
    }

    fn node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.tables.read().nodes.get(id).cloned())
    }

    fn save_node(&self, node: &Node) -> Result<()> {
        self.tables
            .write()
            .nodes
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    fn delete_node(&self, id: &str) -> Result<()> {
        self.tables.write().nodes.shift_remove(id);
        Ok(())
    }

    fn nodes_for_network(&self, network: &str) -> Result<Vec<Node>> {
        Ok(self
            .tables
            .read()
            .nodes
            .values()
            .filter(|node| node.network == network)
            .cloned()
            .collect())
    }

    fn cloud(&self, id: &str) -> Result<Option<CloudService>> {
        Ok(self.tables.read().clouds.get(id).cloned())
    }

    fn subscription(&self, account: &str, network: &str) -> Result<Option<Subscription>> {
        Ok(self
            .tables
            .read()
            .subscriptions
            .get(&(account.to_owned(), network.to_owned()))
            .cloned())
    }
}
