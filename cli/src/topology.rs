use clap::ValueEnum;
use petgraph::{algo::connected_components, graphmap::UnGraphMap};
use vigil::service::NodeId;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Preset {
    /// 0 - 1 - 2 - ... - n-1
    Line,
    /// A line closed back onto node 0
    Ring,
    /// Every node linked to node 0 only
    Star,
    /// Every node linked to every other node
    Complete,
}

pub struct Topology {
    graph: UnGraphMap<NodeId, ()>,
    node_count: usize,
}

impl Topology {
    pub fn preset(preset: Preset, node_count: usize) -> Self {
        let n = node_count as NodeId;
        let edges: Vec<(NodeId, NodeId)> = match preset {
            Preset::Line => (1..n).map(|i| (i - 1, i)).collect(),
            Preset::Ring => {
                let mut edges: Vec<_> = (1..n).map(|i| (i - 1, i)).collect();
                if n > 2 {
                    edges.push((n - 1, 0));
                }
                edges
            }
            Preset::Star => (1..n).map(|i| (0, i)).collect(),
            Preset::Complete => (0..n)
                .flat_map(|a| (a + 1..n).map(move |b| (a, b)))
                .collect(),
        };
        Self::from_edges(node_count, &edges)
    }

    pub fn from_edges(node_count: usize, edges: &[(NodeId, NodeId)]) -> Self {
        let mut graph = UnGraphMap::new();
        for id in 0..node_count as NodeId {
            graph.add_node(id);
        }
        for &(a, b) in edges {
            graph.add_edge(a, b, ());
        }
        Self { graph, node_count }
    }

    /// Parses `a-b,c-d,...`.
    pub fn parse_edges(list: &str) -> Result<Vec<(NodeId, NodeId)>, String> {
        list.split(',')
            .map(str::trim)
            .filter(|edge| !edge.is_empty())
            .map(|edge| {
                let (a, b) = edge
                    .split_once('-')
                    .ok_or_else(|| format!("edge `{}` is not of the form a-b", edge))?;
                let a = a.trim().parse().map_err(|_| format!("bad node id in `{}`", edge))?;
                let b = b.trim().parse().map_err(|_| format!("bad node id in `{}`", edge))?;
                Ok((a, b))
            })
            .collect()
    }

    /// Every node can reach the coordinator and every edge joins two real,
    /// distinct nodes.
    pub fn check(&self) -> Result<(), String> {
        if self.graph.node_count() != self.node_count {
            return Err(format!(
                "edges mention nodes outside 0..{}",
                self.node_count
            ));
        }
        if let Some((a, _, _)) = self.graph.all_edges().find(|(a, b, _)| a == b) {
            return Err(format!("node {} is linked to itself", a));
        }
        if connected_components(&self.graph) != 1 {
            return Err("topology is not connected".into());
        }
        Ok(())
    }

    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.graph.all_edges().map(|(a, b, _)| (a, b)).collect()
    }
}
