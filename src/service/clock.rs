use crate::service::NodeId;

/// A node's vector clock. Only the dispatcher owns one, and entries only ever
/// move forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorClock {
    node: NodeId,
    entries: Vec<u32>,
}

impl VectorClock {
    /// A zeroed clock for `node` in a system of `node_count` nodes.
    pub fn new(node: NodeId, node_count: usize) -> Self {
        Self {
            node,
            entries: vec![0; node_count],
        }
    }

    /// Advances this node's own entry for an outgoing application message and
    /// returns the clock to attach to it.
    pub fn stamp_outgoing(&mut self) -> Vec<u32> {
        self.tick();
        self.entries.clone()
    }

    /// Folds a delivered message's clock into ours (pointwise max), then
    /// counts the delivery itself as a local event.
    ///
    /// Entries beyond this system's node count are ignored.
    pub fn merge_incoming(&mut self, remote: &[u32]) {
        for (local, remote) in self.entries.iter_mut().zip(remote) {
            *local = (*local).max(*remote);
        }
        self.tick();
    }

    /// A copy of the current clock, which keeps advancing independently.
    pub fn snapshot(&self) -> Vec<u32> {
        self.entries.clone()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.entries
    }

    pub fn own(&self) -> u32 {
        self.entries[self.node as usize]
    }

    fn tick(&mut self) {
        let own = &mut self.entries[self.node as usize];
        *own = own.saturating_add(1);
    }
}
