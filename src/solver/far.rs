use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, instrument, trace};

use super::comm::{block_agents, hold, planned_indices, release_hold, PlannerCore};
use super::{PathFinder, PlanningOutcome};
use crate::common::{Agent, AgentId, Path};
use crate::communicator::Communicator;
use crate::config::{EvadingStrategy, PlannerConfig};
use crate::graph::{degree_to_rad, Graph, NodeId};
use crate::reservation::{create_intervals_between, Interval, ReservationTable};
use crate::stat::Stats;

/// Next straight hop of an agent, cut short before the first reserved node.
#[derive(Debug, Clone, Default)]
struct Hop {
    nodes: Vec<NodeId>,
    intervals: Vec<Interval>,
    /// Owner and node of the reservation that cut the hop short.
    blocker: Option<(AgentId, NodeId)>,
}

/// Flow-annotation replanning. Agents follow their RRA* route one straight
/// hop at a time and wait when the hop is taken. Waiting in a circle, or for
/// too long, triggers an evading maneuver.
pub struct FAR<'a> {
    core: PlannerCore<'a>,
    table: ReservationTable,
    rng: StdRng,
    wait_for: HashMap<AgentId, AgentId>,
    move_time: HashMap<AgentId, f64>,
    wait_until: HashMap<AgentId, f64>,
    evaded_from: HashMap<AgentId, HashSet<NodeId>>,
    destinations: HashMap<AgentId, NodeId>,
}

impl<'a> FAR<'a> {
    pub fn new(graph: &'a Graph, config: &PlannerConfig, communicator: Box<dyn Communicator>) -> Self {
        FAR {
            core: PlannerCore::new(graph, config, communicator),
            table: ReservationTable::strict(graph),
            rng: StdRng::seed_from_u64(config.seed),
            wait_for: HashMap::new(),
            move_time: HashMap::new(),
            wait_until: HashMap::new(),
            evaded_from: HashMap::new(),
            destinations: HashMap::new(),
        }
    }

    pub fn reservation_table(&self) -> &ReservationTable {
        &self.table
    }

    /// Whether following the wait-for relation from `agent` runs in a circle.
    fn waits_in_circle(&self, agent: AgentId) -> bool {
        let mut seen = HashSet::new();
        let mut current = agent;
        while let Some(&next) = self.wait_for.get(&current) {
            if !seen.insert(current) {
                return true;
            }
            current = next;
        }
        false
    }

    fn wait_step(&mut self, agent: &mut Agent, waiting_for: AgentId, current_time: f64) {
        self.core.wait(agent);
        self.wait_for.insert(agent.id, waiting_for);
        for err in self.table.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
            debug!("agent {} wait hold skipped: {err}", agent.id);
        }
        self.wait_until
            .insert(agent.id, current_time + self.core.config.wait_step);
    }

    fn next_hop(&mut self, agent: &Agent, current_time: f64) -> Hop {
        let graph = self.core.graph;
        let rra = self.core.rra.get(graph, agent, false);
        let mut hop = Hop {
            nodes: rra.next_nodes_until_turn(agent.next_node),
            ..Hop::default()
        };

        while hop.nodes.len() > 1 {
            let (from, to) = (hop.nodes[0], hop.nodes[hop.nodes.len() - 1]);
            let Some(edge) = graph.edge_between(from, hop.nodes[1]) else {
                break;
            };
            let turn = agent
                .physics
                .time_to_turn(agent.orientation_at_next_node, degree_to_rad(edge.angle));
            let Some(intervals) = create_intervals_between(
                graph,
                &agent.physics,
                current_time,
                current_time + turn,
                0.0,
                from,
                to,
                true,
            ) else {
                break;
            };

            match self.table.first_collision_in(&intervals) {
                None => {
                    hop.intervals = intervals;
                    return hop;
                }
                Some(collision) => {
                    hop.blocker = Some((collision.owner.unwrap_or(agent.id), collision.node));
                    let cut = hop
                        .nodes
                        .iter()
                        .position(|&node| node == collision.node)
                        .unwrap_or(hop.nodes.len() - 1);
                    hop.nodes.truncate(cut);
                }
            }
        }
        hop.intervals.clear();
        hop
    }

    /// Drives the hop, stopping only at its last node.
    fn set_path(&mut self, agent: &mut Agent, hop: &Hop) -> bool {
        if let Err(err) = self.table.try_add_all(&hop.intervals, Some(agent.id), 0) {
            debug!("agent {} hop rejected: {err}", agent.id);
            return false;
        }
        let mut path = Path::new();
        let last = hop.nodes.len() - 1;
        for (i, &node) in hop.nodes.iter().enumerate() {
            path.add_last(node, i == 0 || i == last, 0.0);
        }
        agent.path = path;
        true
    }

    fn evade_by_rerouting(
        &mut self,
        agent: &mut Agent,
        current_time: f64,
        mut blocker: Option<(AgentId, NodeId)>,
    ) {
        let graph = self.core.graph;
        // the last of the tries is spent waiting
        let tries = self.core.config.far.es1_maximum_breaking_tries;
        for _ in 1..tries {
            let Some((owner, node)) = blocker else {
                break;
            };
            self.wait_for.insert(agent.id, owner);

            let rra = self.core.rra.get(graph, agent, false);
            rra.add_custom_lock(node);
            rra.reset();
            if !rra.search(graph, agent.next_node) {
                break;
            }
            let hop = self.next_hop(agent, current_time);
            if hop.nodes.len() > 1 && self.set_path(agent, &hop) {
                trace!("agent {} reroutes around node {node}", agent.id);
                return;
            }
            blocker = hop.blocker;
        }
        self.wait_step(agent, agent.id, current_time);
    }

    fn evade_to_next_node(&mut self, agent: &mut Agent, current_time: f64) {
        let graph = self.core.graph;
        let evaded = self.evaded_from.entry(agent.id).or_default();
        let mut candidates: Vec<NodeId> = graph
            .edges(agent.next_node)
            .iter()
            .filter(|edge| {
                !graph.is_blocked(edge.to, agent.can_go_through_obstacles)
                    && !evaded.contains(&edge.to)
            })
            .map(|edge| edge.to)
            .collect();
        candidates.shuffle(&mut self.rng);

        for to in candidates {
            let Some(edge) = graph.edge_between(agent.next_node, to) else {
                continue;
            };
            let turn = agent
                .physics
                .time_to_turn(agent.orientation_at_next_node, degree_to_rad(edge.angle));
            let Some(intervals) = create_intervals_between(
                graph,
                &agent.physics,
                current_time,
                current_time + turn,
                0.0,
                agent.next_node,
                to,
                true,
            ) else {
                continue;
            };
            if self.table.try_add_all(&intervals, Some(agent.id), 0).is_err() {
                continue;
            }
            if self.core.config.far.es2_back_evading_avoidance {
                self.evaded_from.entry(agent.id).or_default().insert(to);
            }
            let mut path = Path::new();
            path.add_last(agent.next_node, true, 0.0);
            path.add_last(to, true, self.core.config.wait_step);
            agent.path = path;
            trace!("agent {} evades to node {to}", agent.id);
            return;
        }

        self.evaded_from.entry(agent.id).or_default().clear();
        self.wait_step(agent, agent.id, current_time);
    }

    #[instrument(skip_all, name = "far_agent", fields(agent = agent.id), level = "debug")]
    fn plan_agent(&mut self, agent: &mut Agent, current_time: f64) {
        let graph = self.core.graph;
        let id = agent.id;
        if self.destinations.insert(id, agent.destination_node) != Some(agent.destination_node) {
            self.move_time.insert(id, current_time);
        }

        let rra = self.core.rra.get(graph, agent, false);
        let found = rra.is_closed(agent.next_node) || rra.search(graph, agent.next_node);

        let mut breaking = false;
        let mut blocker = None;
        if !found {
            self.core.rra.invalidate(id);
            let wait_until = self.wait_until.get(&id).copied().unwrap_or(f64::NEG_INFINITY);
            if wait_until < current_time - self.core.config.wait_step * 2.0 {
                self.wait_step(agent, id, current_time);
                return;
            }
            breaking = true;
        }

        if !breaking {
            let hop = self.next_hop(agent, current_time);
            blocker = hop.blocker;
            let es2 = self.core.config.far.es2_back_evading_avoidance;
            let evaded = self.evaded_from.entry(id).or_default();
            if es2 && hop.nodes.len() > 1 && evaded.contains(&hop.nodes[1]) {
                breaking = true;
            } else if es2 {
                evaded.clear();
            }

            if !breaking && hop.nodes.len() > 1 && self.set_path(agent, &hop) {
                self.move_time.insert(id, current_time);
                return;
            }
        }

        if !breaking {
            let move_time = self.move_time.get(&id).copied().unwrap_or(current_time);
            breaking = current_time - move_time > self.core.config.maximum_wait_time
                || self.waits_in_circle(id);
        }
        if !breaking {
            let owner = blocker.map_or(id, |(owner, _)| owner);
            self.wait_step(agent, owner, current_time);
            return;
        }

        debug!("agent {id} starts a breaking maneuver");
        match self.core.config.far.evading_strategy {
            EvadingStrategy::EvadeByRerouting => {
                self.evade_by_rerouting(agent, current_time, blocker)
            }
            EvadingStrategy::EvadeToNextNode => self.evade_to_next_node(agent, current_time),
        }
    }
}

impl PathFinder for FAR<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        let budget = self.core.begin_cycle(current_time, agents);

        self.table.clear();
        block_agents(&mut self.table, agents, current_time, 0);
        for agent in agents.iter() {
            self.move_time.entry(agent.id).or_insert(current_time);
        }

        let order: Vec<usize> = planned_indices(agents)
            .into_iter()
            .filter(|&index| agents[index].arrival_time_at_next_node <= current_time)
            .collect();

        for index in order {
            if budget.exceeded() {
                self.core.signal_timeout();
                break;
            }
            let agent = &mut agents[index];
            let wait_until = self
                .wait_until
                .get(&agent.id)
                .copied()
                .unwrap_or(f64::NEG_INFINITY);
            if current_time < wait_until {
                continue;
            }

            self.core.stats.planned_agents += 1;
            release_hold(&mut self.table, agent, current_time);
            if self.core.is_in_deadlock(agent, current_time)
                && self
                    .core
                    .break_deadlock(agent, &mut self.table, current_time, true, true)
                    .is_some()
            {
                self.move_time.insert(agent.id, current_time);
                continue;
            }
            self.plan_agent(agent, current_time);
        }

        // agents still driving or skipped keep a path from their next node
        for index in planned_indices(agents) {
            let agent = &mut agents[index];
            let starts_at_next = agent
                .path
                .next_action()
                .is_some_and(|action| action.node == agent.next_node);
            if !starts_at_next {
                self.core.wait(agent);
            }
        }

        self.core.end_cycle(&budget)
    }

    fn name(&self) -> &'static str {
        "FAR"
    }

    fn stats(&self) -> &Stats {
        &self.core.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::RecordingCommunicator;
    use crate::physics::Physics;

    fn far(graph: &Graph) -> FAR<'_> {
        FAR::new(graph, &PlannerConfig::default(), Box::new(RecordingCommunicator::new()))
    }

    #[test]
    fn test_drives_one_straight_hop() {
        let graph = Graph::grid(4, 2, 1.0);
        let mut far = far(&graph);
        let mut agents = vec![Agent::new(0, 0, 7, Physics::default())];

        far.find_paths(0.0, &mut agents);
        assert_eq!(
            agents[0].path.to_string(),
            "Goto 0 and Stop; Goto 1; Goto 2; Goto 3 and Stop; "
        );
        assert!(!far.reservation_table().is_free(3, 100.0, 101.0));
    }

    #[test]
    fn test_hop_stops_before_reserved_node() {
        let graph = Graph::grid(4, 1, 1.0);
        let mut far = far(&graph);
        // parked on its destination, so it holds node 2
        let blocker = Agent::new(1, 2, 2, Physics::default());
        let mut agents = vec![Agent::new(0, 0, 3, Physics::default()), blocker];

        far.find_paths(0.0, &mut agents);
        assert_eq!(agents[0].path.to_string(), "Goto 0 and Stop; Goto 1 and Stop; ");
    }

    #[test]
    fn test_blocked_agent_waits_for_blocker() {
        let graph = Graph::grid(3, 1, 1.0);
        let mut far = far(&graph);
        let blocker = Agent::new(1, 1, 1, Physics::default());
        let mut agents = vec![Agent::new(0, 0, 2, Physics::default()), blocker];

        far.find_paths(0.0, &mut agents);
        assert_eq!(agents[0].path, Path::wait_at(0, 5.0));
        assert_eq!(far.wait_for.get(&0), Some(&1));

        // still waiting: the path is kept as it is
        agents[0].path = Path::wait_at(0, 2.0);
        far.find_paths(1.0, &mut agents);
        assert_eq!(agents[0].path, Path::wait_at(0, 2.0));
    }

    #[test]
    fn test_fixed_agent_is_routed_around() {
        let graph = Graph::grid(3, 2, 1.0);
        let mut far = far(&graph);
        let mut blocker = Agent::new(1, 1, 1, Physics::default());
        blocker.fixed_position = true;
        let mut agents = vec![Agent::new(0, 0, 2, Physics::default()), blocker];

        far.find_paths(0.0, &mut agents);
        assert_eq!(agents[0].path.to_string(), "Goto 0 and Stop; Goto 3 and Stop; ");
    }

    #[test]
    fn test_rerouting_around_the_blocker() {
        let graph = Graph::grid(3, 3, 1.0);
        let mut far = far(&graph);
        far.table
            .try_add(&Interval::permanent(1, 0.0), Some(1), 0)
            .unwrap();
        let mut agent = Agent::new(0, 0, 2, Physics::default());

        far.evade_by_rerouting(&mut agent, 0.0, Some((1, 1)));
        assert_eq!(agent.path.to_string(), "Goto 0 and Stop; Goto 3 and Stop; ");
        assert_eq!(far.wait_for.get(&0), Some(&1));
        assert_eq!(far.stats().wait_steps, 0);
    }

    #[test]
    fn test_rerouting_gives_up_after_maximum_tries() {
        let graph = Graph::grid(3, 3, 1.0);
        let mut config = PlannerConfig::default();
        config.far.es1_maximum_breaking_tries = 1;
        let mut far = FAR::new(&graph, &config, Box::new(RecordingCommunicator::new()));
        far.table
            .try_add(&Interval::permanent(1, 0.0), Some(1), 0)
            .unwrap();
        let mut agent = Agent::new(0, 0, 2, Physics::default());

        far.evade_by_rerouting(&mut agent, 0.0, Some((1, 1)));
        assert_eq!(agent.path, Path::wait_at(0, config.wait_step));
        assert_eq!(far.wait_for.get(&0), Some(&0));
        assert_eq!(far.stats().wait_steps, 1);
        assert!(!far.reservation_table().is_free(0, 100.0, 101.0));
    }

    #[test]
    fn test_wait_for_circle() {
        let graph = Graph::grid(2, 1, 1.0);
        let mut far = far(&graph);
        far.wait_for.insert(0, 1);
        assert!(!far.waits_in_circle(0));
        far.wait_for.insert(1, 2);
        far.wait_for.insert(2, 1);
        assert!(far.waits_in_circle(0));
        far.wait_for.insert(3, 3);
        assert!(far.waits_in_circle(3));
    }

    #[test]
    fn test_evade_to_next_node_avoids_going_back() {
        let graph = Graph::grid(3, 1, 1.0);
        let mut config = PlannerConfig::default();
        config.far.evading_strategy = EvadingStrategy::EvadeToNextNode;
        let mut far = FAR::new(&graph, &config, Box::new(RecordingCommunicator::new()));
        let mut agent = Agent::new(0, 1, 1, Physics::default());
        far.evaded_from.insert(0, HashSet::from([2]));

        far.evade_to_next_node(&mut agent, 0.0);
        assert_eq!(agent.path.last_action().unwrap().node, 0);
        assert!(far.evaded_from[&0].contains(&0));
    }
}
