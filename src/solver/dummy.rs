use tracing::debug;

use super::comm::{planned_indices, PlannerCore};
use super::{PathFinder, PlanningOutcome};
use crate::common::Agent;
use crate::communicator::Communicator;
use crate::config::PlannerConfig;
use crate::graph::Graph;
use crate::stat::Stats;

/// Baseline without search: every free agent hops to a random neighbor,
/// ignoring the others.
pub struct Dummy<'a> {
    core: PlannerCore<'a>,
}

impl<'a> Dummy<'a> {
    pub fn new(graph: &'a Graph, config: &PlannerConfig, communicator: Box<dyn Communicator>) -> Self {
        Dummy {
            core: PlannerCore::new(graph, config, communicator),
        }
    }
}

impl PathFinder for Dummy<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        let budget = self.core.begin_cycle(current_time, agents);

        for index in planned_indices(agents) {
            let agent = &mut agents[index];
            if self.core.timed_out() || budget.exceeded() {
                self.core.signal_timeout();
                self.core.wait(agent);
                continue;
            }
            self.core.stats.planned_agents += 1;
            if self.core.deadlock.random_hop(self.core.graph, agent) {
                self.core.stats.random_hops += 1;
            } else {
                debug!("agent {} has no neighbor to hop to", agent.id);
                self.core.wait(agent);
            }
        }

        self.core.end_cycle(&budget)
    }

    fn name(&self) -> &'static str {
        "Dummy"
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
    fn test_hops_every_free_agent() {
        let graph = Graph::grid(3, 3, 1.0);
        let mut dummy = Dummy::new(
            &graph,
            &PlannerConfig::default(),
            Box::new(RecordingCommunicator::new()),
        );
        let mut fixed = Agent::new(1, 0, 8, Physics::default());
        fixed.fixed_position = true;
        let mut agents = vec![Agent::new(0, 4, 8, Physics::default()), fixed];

        assert_eq!(dummy.find_paths(0.0, &mut agents), PlanningOutcome::Completed);
        assert_eq!(agents[0].path.len(), 2);
        assert!(agents[1].path.is_empty());
        assert_eq!(dummy.stats().random_hops, 1);
    }
}
