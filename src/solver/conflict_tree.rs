use std::collections::HashMap;

use crate::common::{AgentId, Path};
use crate::reservation::Interval;

pub type CtNodeId = usize;

/// Route of one agent and the intervals it occupies.
#[derive(Debug, Clone)]
pub struct Solution {
    pub path: Path,
    pub reservations: Vec<Interval>,
}

impl Solution {
    /// Time from the first to the last occupied instant.
    pub fn cost(&self) -> f64 {
        match (self.reservations.first(), self.reservations.last()) {
            (Some(first), Some(last)) => last.end - first.start,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct CtNode {
    parent: Option<CtNodeId>,
    /// Agent the constraint applies to, `None` at the root.
    agent: Option<AgentId>,
    constraint: Option<Interval>,
    depth: usize,
    cost: f64,
    /// Only the re-solved agent here; the root holds everyone.
    solutions: HashMap<AgentId, Solution>,
}

/// Arena of conflict-tree nodes. A child adds one interval an agent must
/// keep clear of and stores only that agent's new solution; everything else
/// is inherited from the ancestors.
#[derive(Debug, Clone)]
pub struct ConflictTree {
    nodes: Vec<CtNode>,
}

impl ConflictTree {
    pub const ROOT: CtNodeId = 0;

    pub fn new() -> Self {
        ConflictTree {
            nodes: vec![CtNode {
                parent: None,
                agent: None,
                constraint: None,
                depth: 0,
                cost: 0.0,
                solutions: HashMap::new(),
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_child(&mut self, parent: CtNodeId, agent: AgentId, constraint: Interval) -> CtNodeId {
        let depth = self.nodes[parent].depth + 1;
        let cost = self.nodes[parent].cost;
        self.nodes.push(CtNode {
            parent: Some(parent),
            agent: Some(agent),
            constraint: Some(constraint),
            depth,
            cost,
            solutions: HashMap::new(),
        });
        self.nodes.len() - 1
    }

    pub fn depth(&self, id: CtNodeId) -> usize {
        self.nodes[id].depth
    }

    /// Summed cost of all solutions visible from `id`.
    pub fn cost(&self, id: CtNodeId) -> f64 {
        self.nodes[id].cost
    }

    /// Stores the agent's solution at `id`, updating the node cost from the
    /// cost the agent had before.
    pub fn set_solution(&mut self, id: CtNodeId, agent: AgentId, solution: Solution) {
        let previous = match self.nodes[id].parent {
            Some(parent) => self.solution(parent, agent).map_or(0.0, Solution::cost),
            None => self.nodes[id].solutions.get(&agent).map_or(0.0, Solution::cost),
        };
        let node = &mut self.nodes[id];
        node.cost += solution.cost() - previous;
        node.solutions.insert(agent, solution);
    }

    /// Removes the agent's root solution.
    pub fn forget_root_solution(&mut self, agent: AgentId) {
        let root = &mut self.nodes[Self::ROOT];
        if let Some(solution) = root.solutions.remove(&agent) {
            root.cost -= solution.cost();
        }
    }

    /// The agent's solution as seen from `id`.
    pub fn solution(&self, id: CtNodeId, agent: AgentId) -> Option<&Solution> {
        let mut current = Some(id);
        while let Some(node) = current {
            if let Some(solution) = self.nodes[node].solutions.get(&agent) {
                return Some(solution);
            }
            debug_assert!(
                self.nodes[node].agent != Some(agent),
                "constrained agent {agent} has no solution at node {node}"
            );
            current = self.nodes[node].parent;
        }
        None
    }

    /// All intervals the agent must keep clear of at `id`.
    pub fn constraints(&self, id: CtNodeId, agent: AgentId) -> Vec<Interval> {
        let mut constraints = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            let node = &self.nodes[node];
            if node.agent == Some(agent) {
                constraints.extend(node.constraint);
            }
            current = node.parent;
        }
        constraints
    }
}

impl Default for ConflictTree {
    fn default() -> Self {
        Self::new()
    }
}
