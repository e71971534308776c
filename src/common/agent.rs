use super::Path;
use crate::graph::{Graph, NodeId};
use crate::physics::Physics;
use crate::reservation::Interval;

pub type AgentId = usize;

/// Per-cycle snapshot of a robot. Planning only writes `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    /// Node the agent stands on or is driving to.
    pub next_node: NodeId,
    /// Occupancy the agent already committed to while reaching `next_node`.
    pub reservations_to_next_node: Vec<Interval>,
    pub arrival_time_at_next_node: f64,
    /// Radians.
    pub orientation_at_next_node: f64,
    pub destination_node: NodeId,
    pub fixed_position: bool,
    pub can_go_through_obstacles: bool,
    pub request_reoptimization: bool,
    pub physics: Physics,
    pub path: Path,
}

impl Agent {
    pub fn new(id: AgentId, node: NodeId, destination: NodeId, physics: Physics) -> Self {
        Agent {
            id,
            next_node: node,
            reservations_to_next_node: Vec::new(),
            arrival_time_at_next_node: 0.0,
            orientation_at_next_node: 0.0,
            destination_node: destination,
            fixed_position: false,
            can_go_through_obstacles: false,
            request_reoptimization: true,
            physics,
            path: Path::new(),
        }
    }

    pub fn at_destination(&self) -> bool {
        self.next_node == self.destination_node
    }

    /// Agents that are free to move and still have somewhere to go.
    pub fn needs_planning(&self) -> bool {
        !self.fixed_position && !self.at_destination()
    }

    pub fn verify(&self, graph: &Graph) -> bool {
        graph.contains(self.next_node)
            && graph.contains(self.destination_node)
            && !graph.node_info(self.next_node).is_locked
            && !graph.node_info(self.destination_node).is_locked
    }
}
