use std::collections::HashMap;

use tracing::{debug, trace};

use super::comm::{
    block_agents, hold, planned_indices, release_hold, start_time, with_final_hold, PlannerCore,
};
use super::{PathFinder, PlanningOutcome};
use crate::algorithm::SpaceAStar;
use crate::common::{Agent, AgentId, Path};
use crate::communicator::Communicator;
use crate::config::PlannerConfig;
use crate::graph::{Graph, NodeId};
use crate::reservation::{Interval, ReservationTable};
use crate::stat::Stats;

/// Biased-cost replanning. Every round all agents commit their unconstrained
/// A* route into a fresh table; an agent whose route hits an earlier one pays
/// a cost on the contested node and the round starts over.
pub struct BCP<'a> {
    core: PlannerCore<'a>,
    table: ReservationTable,
    biased_cost: HashMap<AgentId, HashMap<NodeId, f64>>,
}

impl<'a> BCP<'a> {
    pub fn new(graph: &'a Graph, config: &PlannerConfig, communicator: Box<dyn Communicator>) -> Self {
        BCP {
            core: PlannerCore::new(graph, config, communicator),
            table: ReservationTable::strict(graph),
            biased_cost: HashMap::new(),
        }
    }

    pub fn biased_cost(&self, agent: AgentId) -> Option<&HashMap<NodeId, f64>> {
        self.biased_cost.get(&agent)
    }

    fn restore_hold(&mut self, agent: &Agent, current_time: f64) {
        for err in self.table.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
            debug!("agent {} hold skipped: {err}", agent.id);
        }
    }

    /// Sets up a round: everyone's blockage, with deadlock hops replacing the
    /// holds of the agents that hop.
    fn reset_table(&mut self, agents: &[Agent], current_time: f64, hops: &[(usize, Vec<Interval>)]) {
        self.table.clear();
        block_agents(&mut self.table, agents, current_time, 0);
        for (index, hop) in hops {
            let agent = &agents[*index];
            release_hold(&mut self.table, agent, current_time);
            for err in self.table.add_each(hop, Some(agent.id), 0) {
                debug!("agent {} hop reservation skipped: {err}", agent.id);
            }
        }
    }

    /// Plans one round. Returns the route of every agent processed, `None`
    /// for the ones that collided or found nothing, and whether a collision
    /// occurred.
    fn round(
        &mut self,
        agents: &[Agent],
        searching: &[usize],
        current_time: f64,
        exceeded: impl Fn() -> bool,
    ) -> (Vec<(usize, Option<Path>)>, bool, bool) {
        let graph = self.core.graph;
        let amount = self.core.config.bcp.biased_cost_amount;
        let mut routes = Vec::with_capacity(searching.len());
        let mut collided = false;

        for &index in searching {
            if exceeded() {
                return (routes, collided, true);
            }
            let agent = &agents[index];
            release_hold(&mut self.table, agent, current_time);

            let bias = self.biased_cost.entry(agent.id).or_default();
            let mut search = SpaceAStar::new(agent);
            if !search.search(graph, bias) {
                debug!("agent {} has no route", agent.id);
                self.restore_hold(agent, current_time);
                routes.push((index, None));
                continue;
            }

            let (path, reservations) =
                search.reservations_and_path(start_time(agent, current_time));
            let intervals = with_final_hold(&reservations);
            if let Some(collision) = self.table.first_collision_in(&intervals) {
                trace!(
                    "agent {} collides with {:?} on node {}",
                    agent.id,
                    collision.owner,
                    collision.node
                );
                *bias.entry(collision.node).or_insert(0.0) += amount;
                collided = true;
                self.restore_hold(agent, current_time);
                routes.push((index, None));
                continue;
            }
            if let Err(err) = self.table.try_add_all(&intervals, Some(agent.id), 0) {
                debug!("agent {} route rejected: {err}", agent.id);
                self.restore_hold(agent, current_time);
                routes.push((index, None));
                continue;
            }
            routes.push((index, Some(path)));
        }
        (routes, collided, false)
    }
}

impl PathFinder for BCP<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        let budget = self.core.begin_cycle(current_time, agents);
        self.biased_cost.clear();

        let order = planned_indices(agents);
        self.core.stats.planned_agents += order.len();

        // deadlock hops are decided once and kept through all rounds
        self.table.clear();
        block_agents(&mut self.table, agents, current_time, 0);
        let mut hops = Vec::new();
        let mut searching = Vec::new();
        for &index in &order {
            let agent = &mut agents[index];
            if !self.core.is_in_deadlock(agent, current_time) {
                searching.push(index);
                continue;
            }
            release_hold(&mut self.table, agent, current_time);
            match self
                .core
                .break_deadlock(agent, &mut self.table, current_time, true, true)
            {
                Some(hop) => hops.push((index, hop)),
                None => {
                    self.restore_hold(agent, current_time);
                    searching.push(index);
                }
            }
        }

        let mut rounds = 0;
        loop {
            rounds += 1;
            self.core.stats.high_level_expand_nodes += 1;
            self.reset_table(agents, current_time, &hops);
            let (routes, collided, timed_out) =
                self.round(agents, &searching, current_time, || budget.exceeded());

            if timed_out {
                self.core.signal_timeout();
            } else if collided && rounds < self.core.config.bcp.max_rounds {
                continue;
            }

            let mut assigned = vec![false; agents.len()];
            for (index, route) in routes {
                assigned[index] = true;
                let agent = &mut agents[index];
                match route {
                    Some(mut path) => {
                        path.ensure_starts_at(agent.next_node);
                        agent.path = path;
                    }
                    None => self.core.wait(agent),
                }
            }
            for &index in &searching {
                if !assigned[index] {
                    self.core.wait(&mut agents[index]);
                }
            }
            break;
        }

        self.core.end_cycle(&budget)
    }

    fn name(&self) -> &'static str {
        "BCP"
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

    #[test]
    fn test_bias_moves_agent_around_a_blocked_node() {
        let graph = Graph::grid(3, 2, 1.0);
        let mut config = PlannerConfig::default();
        config.bcp.biased_cost_amount = 50.0;
        let mut bcp = BCP::new(&graph, &config, Box::new(RecordingCommunicator::new()));

        let mut blocker = Agent::new(1, 1, 5, Physics::default());
        blocker.fixed_position = true;
        let mut agents = vec![Agent::new(0, 0, 2, Physics::default()), blocker];

        assert_eq!(bcp.find_paths(0.0, &mut agents), PlanningOutcome::Completed);
        let path = &agents[0].path;
        assert_eq!(path.next_action().unwrap().node, 0);
        assert_eq!(path.last_action().unwrap().node, 2);
        assert!(path.actions().all(|action| action.node != 1));
        assert_eq!(bcp.stats().high_level_expand_nodes, 2);
        assert_eq!(bcp.biased_cost(0).unwrap().get(&1), Some(&50.0));
    }

    #[test]
    fn test_gives_up_after_max_rounds() {
        let graph = Graph::grid(2, 1, 1.0);
        let mut config = PlannerConfig::default();
        config.bcp.max_rounds = 3;
        let mut bcp = BCP::new(&graph, &config, Box::new(RecordingCommunicator::new()));
        let mut agents = vec![
            Agent::new(0, 0, 1, Physics::default()),
            Agent::new(1, 1, 0, Physics::default()),
        ];

        assert_eq!(bcp.find_paths(0.0, &mut agents), PlanningOutcome::Completed);
        assert_eq!(bcp.stats().high_level_expand_nodes, 3);
        assert_eq!(agents[0].path, Path::wait_at(0, config.wait_step));
        assert_eq!(agents[1].path, Path::wait_at(1, config.wait_step));
    }
}
