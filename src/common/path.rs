use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::graph::{Graph, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Action {
    pub node: NodeId,
    pub stop_at_node: bool,
    pub wait_after_stop: f64,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Goto {}", self.node)?;
        if self.stop_at_node {
            write!(f, " and Stop")?;
        }
        if self.wait_after_stop > 0.0 {
            write!(f, " and Wait {}", self.wait_after_stop)?;
        }
        Ok(())
    }
}

/// Timed sequence of moves handed to an agent. The first action is the node
/// the agent is currently heading to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Path {
    actions: VecDeque<Action>,
}

impl Path {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single stop at `node` followed by `wait` seconds of waiting.
    pub fn wait_at(node: NodeId, wait: f64) -> Self {
        let mut path = Path::new();
        path.add_last(node, true, wait);
        path
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn action(&self, index: usize) -> Option<&Action> {
        self.actions.get(index)
    }

    pub fn next_action(&self) -> Option<&Action> {
        self.actions.front()
    }

    pub fn last_action(&self) -> Option<&Action> {
        self.actions.back()
    }

    pub fn add_first(&mut self, node: NodeId, stop_at_node: bool, wait_after_stop: f64) {
        self.actions.push_front(Action {
            node,
            stop_at_node,
            wait_after_stop,
        });
    }

    pub fn add_last(&mut self, node: NodeId, stop_at_node: bool, wait_after_stop: f64) {
        self.actions.push_back(Action {
            node,
            stop_at_node,
            wait_after_stop,
        });
    }

    pub fn remove_first(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// A path must end with a stop.
    pub fn is_consistent(&self) -> bool {
        self.actions.back().map_or(true, |action| action.stop_at_node)
    }

    /// Every pair of consecutive actions is a graph edge or a repeated node.
    pub fn is_contiguous(&self, graph: &Graph) -> bool {
        self.actions.iter().zip(self.actions.iter().skip(1)).all(|(a, b)| {
            a.node == b.node || graph.edge_between(a.node, b.node).is_some()
        })
    }

    /// Makes the path start at `node`, keeping an existing stop there.
    pub fn ensure_starts_at(&mut self, node: NodeId) {
        match self.actions.front() {
            Some(action) if action.node == node && action.stop_at_node => {}
            _ => self.add_first(node, true, 0.0),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for action in &self.actions {
            write!(f, "{action}; ")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_operations() {
        let mut path = Path::new();
        assert!(path.is_consistent());
        path.add_last(1, false, 0.0);
        assert!(!path.is_consistent());
        path.add_last(2, true, 5.0);
        path.add_first(0, true, 0.0);

        assert_eq!(path.len(), 3);
        assert_eq!(path.next_action().unwrap().node, 0);
        assert_eq!(path.last_action().unwrap().wait_after_stop, 5.0);
        assert!(path.is_consistent());
        assert_eq!(path.to_string(), "Goto 0 and Stop; Goto 1; Goto 2 and Stop and Wait 5; ");

        assert_eq!(path.remove_first().unwrap().node, 0);
        path.clear();
        assert!(path.is_empty());
    }

    #[test]
    fn test_ensure_starts_at() {
        let graph = Graph::grid(3, 1, 1.0);
        let mut path = Path::new();
        path.add_last(1, true, 0.0);
        path.ensure_starts_at(0);
        assert_eq!(path.len(), 2);
        assert!(path.is_contiguous(&graph));
        path.ensure_starts_at(0);
        assert_eq!(path.len(), 2);
    }
}
