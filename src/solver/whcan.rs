use std::collections::HashMap;

use tracing::{debug, instrument};

use super::comm::{
    block_agents, planned_indices, release_hold, start_time, hold, PlannerCore,
};
use super::{PathFinder, PlanningOutcome};
use crate::algorithm::{Deadline, SearchOutcome, SpaceTimeAStar};
use crate::common::Agent;
use crate::communicator::Communicator;
use crate::config::PlannerConfig;
use crate::graph::{Graph, NodeId};
use crate::reservation::{is_well_formed, Interval, ReservationTable};
use crate::stat::Stats;

/// Windowed hierarchical cooperative A*. Agents closest to their destination
/// plan first; each one reserves its windowed route plus a permanent hold at
/// its end, so later agents treat it as an obstacle.
pub struct WHCAn<'a> {
    core: PlannerCore<'a>,
    table: ReservationTable,
}

impl<'a> WHCAn<'a> {
    pub fn new(graph: &'a Graph, config: &PlannerConfig, communicator: Box<dyn Communicator>) -> Self {
        WHCAn {
            core: PlannerCore::new(graph, config, communicator),
            table: ReservationTable::strict(graph),
        }
    }

    pub fn reservation_table(&self) -> &ReservationTable {
        &self.table
    }

    /// Nodes of the agent's RRA* route, its next node included.
    fn route_nodes(&mut self, agent: &Agent) -> Vec<NodeId> {
        let graph = self.core.graph;
        let rra = self.core.rra.get(graph, agent, false);
        if !rra.is_closed(agent.next_node) && !rra.search(graph, agent.next_node) {
            return Vec::new();
        }
        let mut nodes = rra.path_as_node_list(agent.next_node);
        nodes.push(agent.next_node);
        nodes
    }

    fn wait(&mut self, agent: &mut Agent, current_time: f64) {
        self.core.wait(agent);
        for err in self.table.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
            debug!("agent {} wait hold skipped: {err}", agent.id);
        }
    }

    #[instrument(skip_all, name = "whcan_agent", fields(agent = agent.id), level = "debug")]
    fn plan_agent(
        &mut self,
        agent: &mut Agent,
        current_time: f64,
        biased_cost: HashMap<NodeId, f64>,
        deadline: Deadline,
    ) -> SearchOutcome {
        let graph = self.core.graph;
        let start = start_time(agent, current_time);
        let mut search = SpaceTimeAStar::new(
            agent,
            start,
            self.core.config.wait_step,
            start + self.core.config.whcan.window,
        );
        search.final_reservation = true;
        search.biased_cost = biased_cost;

        let rra = self.core.rra.get(graph, agent, false);
        let outcome = search.search(graph, &self.table, rra, deadline);
        self.core.stats.low_level_expand_nodes += search.expansions();

        let SearchOutcome::Found(_) = outcome else {
            self.wait(agent, current_time);
            return outcome;
        };
        let Some((mut path, reservations)) = search.result() else {
            self.wait(agent, current_time);
            return SearchOutcome::Exhausted;
        };
        let Some(last) = reservations.last().copied() else {
            self.wait(agent, current_time);
            return outcome;
        };
        debug_assert!(is_well_formed(&reservations), "malformed reservations for agent {}", agent.id);

        if let Err(err) = self.table.try_add_all(&reservations, Some(agent.id), 0) {
            debug!("agent {} route rejected: {err}", agent.id);
            self.wait(agent, current_time);
            return outcome;
        }
        if let Err(err) = self
            .table
            .try_add(&Interval::permanent(last.node, last.end), Some(agent.id), 0)
        {
            debug!("agent {} final hold skipped: {err}", agent.id);
        }

        path.ensure_starts_at(agent.next_node);
        agent.path = path;
        outcome
    }
}

impl PathFinder for WHCAn<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        let budget = self.core.begin_cycle(current_time, agents);
        let graph = self.core.graph;

        self.table.clear();
        block_agents(&mut self.table, agents, current_time, 0);

        let mut order = planned_indices(agents);
        order.sort_by(|&a, &b| {
            let (a, b) = (&agents[a], &agents[b]);
            a.can_go_through_obstacles
                .cmp(&b.can_go_through_obstacles)
                .then_with(|| {
                    graph
                        .distance(a.next_node, a.destination_node)
                        .total_cmp(&graph.distance(b.next_node, b.destination_node))
                })
        });

        // a deadlocked agent starts over with a fresh RRA*
        for &index in &order {
            if self.core.is_in_deadlock(&agents[index], current_time) {
                self.core.rra.invalidate(agents[index].id);
            }
        }

        let mut bias: HashMap<NodeId, f64> = HashMap::new();
        let mut routes: HashMap<usize, Vec<NodeId>> = HashMap::new();
        if self.core.config.whcan.use_bias {
            let amount = self.core.config.whcan_bias();
            for &index in &order {
                let nodes = self.route_nodes(&agents[index]);
                for &node in &nodes {
                    *bias.entry(node).or_insert(0.0) += amount;
                }
                routes.insert(index, nodes);
            }
        }

        for (position, &index) in order.iter().enumerate() {
            if budget.exceeded() {
                self.core.signal_timeout();
                for &rest in &order[position..] {
                    self.core.wait(&mut agents[rest]);
                }
                break;
            }
            self.core.stats.planned_agents += 1;
            let agent = &mut agents[index];
            release_hold(&mut self.table, agent, current_time);

            if self.core.is_in_deadlock(agent, current_time)
                && self
                    .core
                    .break_deadlock(agent, &mut self.table, current_time, true, true)
                    .is_some()
            {
                continue;
            }

            // the agent's own route does not count against it
            let mut biased_cost = bias.clone();
            for node in routes.get(&index).into_iter().flatten() {
                if let Some(cost) = biased_cost.get_mut(node) {
                    *cost -= self.core.config.whcan_bias();
                }
            }

            if self.plan_agent(agent, current_time, biased_cost, budget.deadline())
                == SearchOutcome::TimedOut
            {
                self.core.signal_timeout();
                for &rest in &order[position + 1..] {
                    self.core.wait(&mut agents[rest]);
                }
                break;
            }
        }

        self.core.end_cycle(&budget)
    }

    fn name(&self) -> &'static str {
        "WHCAn*"
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

    fn crossing_agents() -> Vec<Agent> {
        vec![
            Agent::new(0, 3, 5, Physics::default()),
            Agent::new(1, 1, 7, Physics::default()),
        ]
    }

    fn assert_both_arrive(config: &PlannerConfig) {
        let graph = Graph::grid(3, 3, 1.0);
        let mut whcan = WHCAn::new(&graph, config, Box::new(RecordingCommunicator::new()));
        let mut agents = crossing_agents();

        assert_eq!(whcan.find_paths(0.0, &mut agents), PlanningOutcome::Completed);
        for agent in &agents {
            assert_eq!(agent.path.next_action().unwrap().node, agent.next_node);
            assert_eq!(agent.path.last_action().unwrap().node, agent.destination_node);
            assert!(!whcan.reservation_table().is_free(agent.destination_node, 100.0, 101.0));
        }
        assert!(whcan.reservation_table().is_disjoint());
        assert_eq!(whcan.stats().planned_agents, 2);
    }

    #[test]
    fn test_crossing_agents_both_arrive() {
        assert_both_arrive(&PlannerConfig::default());
    }

    #[test]
    fn test_crossing_agents_with_bias() {
        let mut config = PlannerConfig::default();
        config.whcan.use_bias = true;
        assert_both_arrive(&config);
    }

    #[test]
    fn test_unreachable_destination_waits() {
        let mut graph = Graph::grid(3, 1, 1.0);
        graph.set_locked(1, true);
        let config = PlannerConfig::default();
        let mut whcan = WHCAn::new(&graph, &config, Box::new(RecordingCommunicator::new()));
        let mut agents = vec![Agent::new(0, 0, 2, Physics::default())];

        whcan.find_paths(0.0, &mut agents);
        assert_eq!(agents[0].path.to_string(), "Goto 0 and Stop and Wait 5; ");
        assert!(!whcan.reservation_table().is_free(0, 10.0, 11.0));
        assert_eq!(whcan.stats().wait_steps, 1);
    }

    #[test]
    fn test_deadlocked_agent_gets_a_fresh_rra() {
        let graph = Graph::grid(3, 1, 1.0);
        let mut whcan = WHCAn::new(
            &graph,
            &PlannerConfig::default(),
            Box::new(RecordingCommunicator::new()),
        );
        // the parked agent leaves no room for a random hop
        let mut agents = vec![
            Agent::new(0, 0, 2, Physics::default()),
            Agent::new(1, 1, 1, Physics::default()),
        ];
        whcan.find_paths(0.0, &mut agents);

        let rra = whcan.core.rra.get(&graph, &agents[0], false);
        rra.add_custom_lock(1);
        rra.reset();
        agents[0].path.clear();
        whcan.find_paths(31.0, &mut agents);

        assert_eq!(whcan.stats().random_hops, 0);
        assert!(whcan.core.rra.get(&graph, &agents[0], false).search(&graph, 0));
        assert_eq!(agents[0].path.next_action().unwrap().node, 0);
    }
}
