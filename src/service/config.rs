use std::time::Duration;

use hashbrown::HashSet;
use typed_builder::TypedBuilder;

use super::{net::Link, NodeId, COORDINATOR};
use crate::service::net::Error;

pub const DEFAULT_SNAPSHOT_DELAY: Duration = Duration::from_millis(1000);

/// A directly connected node and the link to it.
pub struct Neighbor {
    pub id: NodeId,
    pub link: Link,
}

impl Neighbor {
    pub fn new(id: NodeId, link: Link) -> Self {
        Self { id, link }
    }
}

/// Everything a node needs to know about itself and the fixed topology around
/// it. Built once by whoever bootstraps the process.
#[derive(TypedBuilder)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Total number of nodes in the system, and the length of every clock.
    pub node_count: usize,
    #[builder(default)]
    pub neighbors: Vec<Neighbor>,
    /// How long the coordinator waits between snapshot rounds. Also bounds
    /// how long the dispatcher blocks waiting for input.
    #[builder(default = DEFAULT_SNAPSHOT_DELAY)]
    pub snapshot_delay: Duration,
}

impl NodeConfig {
    pub fn is_coordinator(&self) -> bool {
        self.id == COORDINATOR
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.node_count == 0 {
            Err(Error::InvalidConfig("node count must be at least 1".into()))?
        }
        if self.id as usize >= self.node_count {
            Err(Error::InvalidConfig(format!(
                "node id {} is out of range for {} nodes",
                self.id, self.node_count
            )))?
        }
        if self.snapshot_delay.is_zero() {
            Err(Error::InvalidConfig("snapshot delay must be non-zero".into()))?
        }
        let mut seen = HashSet::new();
        for neighbor in &self.neighbors {
            if neighbor.id as usize >= self.node_count {
                Err(Error::InvalidConfig(format!(
                    "neighbor id {} is out of range for {} nodes",
                    neighbor.id, self.node_count
                )))?
            }
            if neighbor.id == self.id {
                Err(Error::InvalidConfig(format!(
                    "node {} lists itself as a neighbor",
                    self.id
                )))?
            }
            if !seen.insert(neighbor.id) {
                Err(Error::InvalidConfig(format!(
                    "neighbor {} is listed more than once",
                    neighbor.id
                )))?
            }
        }
        Ok(())
    }

    pub fn neighbor_ids(&self) -> Vec<NodeId> {
        self.neighbors.iter().map(|n| n.id).collect()
    }
}

/// Wires every edge of an undirected topology with an in-memory link pair and
/// returns each node's neighbors, indexed by node id.
pub fn in_memory_neighbors(
    node_count: usize,
    edges: &[(NodeId, NodeId)],
    max_buf_size: usize,
) -> Vec<Vec<Neighbor>> {
    let mut neighbors: Vec<Vec<Neighbor>> = (0..node_count).map(|_| Vec::new()).collect();
    for &(a, b) in edges {
        let (a_end, b_end) = Link::pair(max_buf_size);
        neighbors[a as usize].push(Neighbor::new(b, a_end));
        neighbors[b as usize].push(Neighbor::new(a, b_end));
    }
    neighbors
}

/// The read-only part of [`NodeConfig`] that outlives the links.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub node_count: usize,
    pub neighbors: Vec<NodeId>,
    pub snapshot_delay: Duration,
}

impl NodeInfo {
    pub fn is_coordinator(&self) -> bool {
        self.id == COORDINATOR
    }
}

impl From<&NodeConfig> for NodeInfo {
    fn from(config: &NodeConfig) -> Self {
        Self {
            id: config.id,
            node_count: config.node_count,
            neighbors: config.neighbor_ids(),
            snapshot_delay: config.snapshot_delay,
        }
    }
}
