use crate::common::{Config, NodeId};

#[derive(Debug, Clone)]
pub struct Peers {
    pub me: NodeId,
    pub neighbors: Vec<NodeId>,
    pub node_count: usize,
}

impl Peers {
    pub fn new(me: NodeId, neighbors: Vec<NodeId>, node_count: usize) -> Self {
        Peers {
            me,
            neighbors,
            node_count,
        }
    }

    pub fn from_config(config: &Config, me: NodeId) -> Option<Self> {
        config
            .neighbors_of(me)
            .map(|neighbors| Peers::new(me, neighbors.to_vec(), config.node_count))
    }

    pub fn is_neighbor(&self, node: NodeId) -> bool {
        self.neighbors.contains(&node)
    }

    /// Every servent in the system except this one.
    pub fn others(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.node_count as NodeId).filter(move |id| *id != self.me)
    }
}
