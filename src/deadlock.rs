use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::common::{Agent, AgentId};
use crate::graph::{degree_to_rad, Graph, NodeId};
use crate::reservation::{create_intervals_between, Interval, ReservationTable};

/// Default waiting time after which an agent counts as deadlocked.
pub const DEFAULT_MAXIMUM_WAIT_TIME: f64 = 30.0;

/// Tracks since when each agent has been standing on the same node and
/// breaks deadlocks by sending agents to a random free neighbor.
#[derive(Debug, Clone)]
pub struct DeadlockHandler {
    pub maximum_wait_time: f64,
    pub wait_step: f64,
    waiting_since: HashMap<AgentId, f64>,
    wait_node: HashMap<AgentId, NodeId>,
    rng: StdRng,
}

impl DeadlockHandler {
    pub fn new(seed: u64, maximum_wait_time: f64, wait_step: f64) -> Self {
        DeadlockHandler {
            maximum_wait_time,
            wait_step,
            waiting_since: HashMap::new(),
            wait_node: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Refreshes the bookkeeping. Fixed agents are not waiting by choice, and
    /// an agent that is driving or changed its node has just moved.
    pub fn update(&mut self, agents: &[Agent], current_time: f64) {
        for agent in agents {
            let moved = match self.wait_node.get(&agent.id) {
                None => true,
                Some(&node) => {
                    agent.fixed_position
                        || !agent.reservations_to_next_node.is_empty()
                        || node != agent.next_node
                }
            };
            if moved {
                self.waiting_since.insert(agent.id, current_time);
                self.wait_node.insert(agent.id, agent.next_node);
            }
        }
    }

    pub fn waiting_since(&self, agent: AgentId) -> Option<f64> {
        self.waiting_since.get(&agent).copied()
    }

    pub fn is_in_deadlock(&self, agent: &Agent, current_time: f64) -> bool {
        !agent.fixed_position
            && self
                .waiting_since
                .get(&agent.id)
                .is_some_and(|since| current_time - since > self.maximum_wait_time)
    }

    fn random_wait(&mut self) -> f64 {
        self.rng.gen::<f64>() * self.wait_step
    }

    fn candidate_neighbors(&mut self, graph: &Graph, agent: &Agent) -> Vec<NodeId> {
        let mut neighbors: Vec<NodeId> = graph
            .edges(agent.next_node)
            .iter()
            .map(|edge| edge.to)
            .filter(|&to| !graph.is_blocked(to, agent.can_go_through_obstacles))
            .collect();
        neighbors.shuffle(&mut self.rng);
        neighbors
    }

    fn hop_to(&mut self, agent: &mut Agent, to: NodeId) {
        let wait = self.random_wait();
        agent.path.clear();
        agent.path.add_last(to, true, wait);
        agent.path.ensure_starts_at(agent.next_node);
        debug!("agent {} hops {} -> {to}", agent.id, agent.next_node);
    }

    /// Sends the agent to a random neighbor, ignoring other agents.
    pub fn random_hop(&mut self, graph: &Graph, agent: &mut Agent) -> bool {
        let Some(&to) = self.candidate_neighbors(graph, agent).first() else {
            return false;
        };
        self.hop_to(agent, to);
        true
    }

    /// Sends the agent to a random neighbor whose drive, including the turn
    /// towards it, is free in `table`. The occupancy of the chosen hop is
    /// returned and optionally committed, with a permanent hold at the end
    /// if `final_reservation` is set.
    pub fn random_hop_reserved(
        &mut self,
        graph: &Graph,
        agent: &mut Agent,
        table: &mut ReservationTable,
        start_time: f64,
        final_reservation: bool,
        insert_reservation: bool,
    ) -> Option<Vec<Interval>> {
        for to in self.candidate_neighbors(graph, agent) {
            let Some(edge) = graph.edge_between(agent.next_node, to) else {
                continue;
            };
            let time_to_turn = agent
                .physics
                .time_to_turn(agent.orientation_at_next_node, degree_to_rad(edge.angle));
            let Some(intervals) = create_intervals_between(
                graph,
                &agent.physics,
                start_time,
                start_time + time_to_turn,
                0.0,
                agent.next_node,
                to,
                final_reservation,
            ) else {
                continue;
            };
            if !table.intervals_free(&intervals) {
                continue;
            }
            if insert_reservation && table.try_add_all(&intervals, Some(agent.id), 0).is_err() {
                continue;
            }
            self.hop_to(agent, to);
            return Some(intervals);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::Physics;
    use crate::reservation::ConflictPolicy;

    fn agent(id: AgentId, next: NodeId, destination: NodeId) -> Agent {
        Agent::new(id, next, destination, Physics::default())
    }

    #[test]
    fn test_deadlock_after_maximum_wait_time() {
        let mut handler = DeadlockHandler::new(0, 30.0, 5.0);
        let mut agents = vec![agent(0, 4, 8)];

        handler.update(&agents, 0.0);
        assert!(!handler.is_in_deadlock(&agents[0], 30.0));
        handler.update(&agents, 31.0);
        assert!(handler.is_in_deadlock(&agents[0], 31.0));

        // moving resets the clock
        agents[0].next_node = 5;
        handler.update(&agents, 32.0);
        assert!(!handler.is_in_deadlock(&agents[0], 32.0));
        assert_eq!(handler.waiting_since(0), Some(32.0));
    }

    #[test]
    fn test_fixed_agents_are_never_deadlocked() {
        let mut handler = DeadlockHandler::new(0, 30.0, 5.0);
        let mut agents = vec![agent(0, 4, 8)];
        handler.update(&agents, 0.0);
        agents[0].fixed_position = true;
        handler.update(&agents, 50.0);
        assert!(!handler.is_in_deadlock(&agents[0], 50.0));
    }

    #[test]
    fn test_random_hop() {
        let graph = Graph::grid(3, 3, 1.0);
        let mut handler = DeadlockHandler::new(7, 30.0, 5.0);
        let mut agent = agent(0, 4, 8);

        assert!(handler.random_hop(&graph, &mut agent));
        assert_eq!(agent.path.len(), 2);
        assert_eq!(agent.path.next_action().unwrap().node, 4);
        let hop = agent.path.last_action().unwrap();
        assert!(graph.edge_between(4, hop.node).is_some());
        assert!(hop.wait_after_stop >= 0.0 && hop.wait_after_stop < 5.0);
    }

    #[test]
    fn test_random_hop_respects_reservations() {
        let graph = Graph::grid(3, 1, 1.0);
        let mut table = ReservationTable::new(&graph, ConflictPolicy::Strict);
        table.try_add(&Interval::permanent(0, 0.0), Some(9), 0).unwrap();
        let mut handler = DeadlockHandler::new(3, 30.0, 5.0);
        let mut agent = agent(0, 1, 2);

        let intervals = handler
            .random_hop_reserved(&graph, &mut agent, &mut table, 0.0, true, true)
            .unwrap();
        assert_eq!(agent.path.last_action().unwrap().node, 2);
        assert!(intervals.last().unwrap().end.is_infinite());
        assert!(!table.is_free(2, 10.0, 11.0));

        let mut blocked = agent.clone();
        blocked.path.clear();
        let mut full = ReservationTable::new(&graph, ConflictPolicy::Strict);
        full.try_add(&Interval::permanent(0, 0.0), Some(8), 0).unwrap();
        full.try_add(&Interval::permanent(2, 0.0), Some(9), 0).unwrap();
        assert!(handler
            .random_hop_reserved(&graph, &mut blocked, &mut full, 0.0, false, false)
            .is_none());
        assert!(blocked.path.is_empty());
    }
}
