mod bcp;
mod cbs;
mod comm;
mod conflict_tree;
mod dummy;
mod far;
mod od;
mod odid;
mod pas;
mod whcan;
mod whcav;

pub use bcp::BCP;
pub use cbs::CBS;
pub use comm::RuntimeBudget;
pub use dummy::Dummy;
pub use far::FAR;
pub use odid::ODID;
pub use pas::PAS;
pub use whcan::WHCAn;
pub use whcav::WHCAv;

use crate::common::Agent;
use crate::communicator::Communicator;
use crate::config::{PlannerConfig, StrategyKind};
use crate::graph::Graph;
use crate::stat::Stats;

/// How a planning cycle ended. Both leave every planned agent with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningOutcome {
    Completed,
    /// The runtime budget ran out; some agents received fallback waits.
    TimedOut,
}

/// Contract of every planning strategy.
pub trait PathFinder {
    /// Replans the agents at `current_time`, writing only their paths.
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome;

    fn name(&self) -> &'static str;

    fn stats(&self) -> &Stats;
}

/// The closed set of strategies.
pub enum Strategy<'a> {
    WHCAn(WHCAn<'a>),
    WHCAv(WHCAv<'a>),
    CBS(CBS<'a>),
    FAR(FAR<'a>),
    PAS(PAS<'a>),
    BCP(BCP<'a>),
    ODID(ODID<'a>),
    Dummy(Dummy<'a>),
}

impl<'a> Strategy<'a> {
    pub fn new(
        kind: StrategyKind,
        graph: &'a Graph,
        config: &PlannerConfig,
        communicator: Box<dyn Communicator>,
    ) -> Self {
        match kind {
            StrategyKind::Whcan => Strategy::WHCAn(WHCAn::new(graph, config, communicator)),
            StrategyKind::Whcav => Strategy::WHCAv(WHCAv::new(graph, config, communicator)),
            StrategyKind::Cbs => Strategy::CBS(CBS::new(graph, config, communicator)),
            StrategyKind::Far => Strategy::FAR(FAR::new(graph, config, communicator)),
            StrategyKind::Pas => Strategy::PAS(PAS::new(graph, config, communicator)),
            StrategyKind::Bcp => Strategy::BCP(BCP::new(graph, config, communicator)),
            StrategyKind::Odid => Strategy::ODID(ODID::new(graph, config, communicator)),
            StrategyKind::Dummy => Strategy::Dummy(Dummy::new(graph, config, communicator)),
        }
    }

    fn inner(&mut self) -> &mut dyn PathFinder {
        match self {
            Strategy::WHCAn(solver) => solver,
            Strategy::WHCAv(solver) => solver,
            Strategy::CBS(solver) => solver,
            Strategy::FAR(solver) => solver,
            Strategy::PAS(solver) => solver,
            Strategy::BCP(solver) => solver,
            Strategy::ODID(solver) => solver,
            Strategy::Dummy(solver) => solver,
        }
    }

    fn inner_ref(&self) -> &dyn PathFinder {
        match self {
            Strategy::WHCAn(solver) => solver,
            Strategy::WHCAv(solver) => solver,
            Strategy::CBS(solver) => solver,
            Strategy::FAR(solver) => solver,
            Strategy::PAS(solver) => solver,
            Strategy::BCP(solver) => solver,
            Strategy::ODID(solver) => solver,
            Strategy::Dummy(solver) => solver,
        }
    }
}

impl PathFinder for Strategy<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        self.inner().find_paths(current_time, agents)
    }

    fn name(&self) -> &'static str {
        self.inner_ref().name()
    }

    fn stats(&self) -> &Stats {
        self.inner_ref().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Path;
    use crate::communicator::RecordingCommunicator;
    use crate::physics::Physics;

    const ALL: [StrategyKind; 8] = [
        StrategyKind::Whcan,
        StrategyKind::Whcav,
        StrategyKind::Cbs,
        StrategyKind::Far,
        StrategyKind::Pas,
        StrategyKind::Bcp,
        StrategyKind::Odid,
        StrategyKind::Dummy,
    ];

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init();
    }

    fn config() -> PlannerConfig {
        PlannerConfig {
            seed: 3,
            runtime_limit_per_agent: 5.0,
            runtime_limit_overall: 10.0,
            ..PlannerConfig::default()
        }
    }

    fn agent(id: usize, next: usize, destination: usize) -> Agent {
        Agent::new(id, next, destination, Physics::default())
    }

    /// Leaves the next node without waiting first.
    fn departs_at_once(agent: &Agent) -> bool {
        agent.path.len() > 1
            && agent
                .path
                .next_action()
                .is_some_and(|action| action.wait_after_stop == 0.0)
    }

    fn starts_at_next_node(agent: &Agent) -> bool {
        agent
            .path
            .next_action()
            .is_some_and(|action| action.node == agent.next_node)
    }

    #[test]
    fn test_every_strategy_leaves_a_path() {
        init_tracing();
        let graph = Graph::grid(4, 4, 1.0);
        for kind in ALL {
            let mut strategy =
                Strategy::new(kind, &graph, &config(), Box::new(RecordingCommunicator::new()));
            let mut agents = vec![agent(0, 0, 15), agent(1, 15, 0), agent(2, 3, 12)];
            strategy.find_paths(0.0, &mut agents);
            for agent in &agents {
                assert!(starts_at_next_node(agent), "{} agent {}", strategy.name(), agent.id);
                assert!(agent.path.is_consistent());
                assert!(agent.path.is_contiguous(&graph));
            }
            assert_eq!(strategy.stats().cycles, 1);
        }
    }

    #[test]
    fn test_zero_runtime_signals_timeout() {
        let graph = Graph::grid(4, 4, 1.0);
        for kind in ALL {
            let recorder = RecordingCommunicator::new();
            let config = PlannerConfig {
                runtime_limit_overall: 0.0,
                ..config()
            };
            let mut strategy = Strategy::new(kind, &graph, &config, Box::new(recorder.clone()));
            let mut agents = vec![agent(0, 0, 15), agent(1, 15, 0)];
            let outcome = strategy.find_paths(0.0, &mut agents);
            assert_eq!(outcome, PlanningOutcome::TimedOut, "{}", strategy.name());
            assert_eq!(recorder.timeouts(), 1, "{}", strategy.name());
            assert!(agents.iter().all(starts_at_next_node), "{}", strategy.name());
        }
    }

    #[test]
    fn test_agent_at_destination_is_untouched() {
        let graph = Graph::grid(3, 3, 1.0);
        for kind in ALL {
            let mut strategy =
                Strategy::new(kind, &graph, &config(), Box::new(RecordingCommunicator::new()));
            let mut parked = agent(0, 4, 4);
            parked.path = Path::wait_at(4, 1.25);
            let mut agents = vec![parked.clone(), agent(1, 0, 8)];
            strategy.find_paths(0.0, &mut agents);
            assert_eq!(agents[0].path, parked.path, "{}", strategy.name());
        }
    }

    #[test]
    fn test_head_on_agents_never_share_a_node() {
        init_tracing();
        // two agents swapping the ends of a single lane
        let graph = Graph::grid(2, 1, 1.0);
        let config = PlannerConfig {
            runtime_limit_per_agent: 0.2,
            ..config()
        };
        for kind in ALL {
            if kind == StrategyKind::Dummy {
                continue;
            }
            let mut strategy =
                Strategy::new(kind, &graph, &config, Box::new(RecordingCommunicator::new()));
            let mut agents = vec![agent(0, 0, 1), agent(1, 1, 0)];
            strategy.find_paths(0.0, &mut agents);
            assert!(agents.iter().all(starts_at_next_node), "{}", strategy.name());
            assert!(!agents.iter().any(departs_at_once), "{}", strategy.name());
        }
    }

    #[test]
    fn test_fixed_agent_blocking_the_only_path() {
        // 3x3 grid with the middle column locked except for node 4
        let mut graph = Graph::grid(3, 3, 1.0);
        graph.set_locked(1, true);
        graph.set_locked(7, true);
        for kind in ALL {
            if kind == StrategyKind::Dummy {
                continue;
            }
            let mut strategy =
                Strategy::new(kind, &graph, &config(), Box::new(RecordingCommunicator::new()));
            let mut blocker = agent(1, 4, 4);
            blocker.fixed_position = true;
            let mut agents = vec![agent(0, 3, 5), blocker];
            strategy.find_paths(0.0, &mut agents);
            assert!(starts_at_next_node(&agents[0]), "{}", strategy.name());
            assert!(!departs_at_once(&agents[0]), "{}", strategy.name());
        }
    }

    #[test]
    fn test_deadlocked_agent_hops() {
        let graph = Graph::grid(3, 3, 1.0);
        for kind in ALL {
            let recorder = RecordingCommunicator::new();
            let mut strategy = Strategy::new(kind, &graph, &config(), Box::new(recorder.clone()));
            let mut blocker = agent(1, 5, 5);
            blocker.fixed_position = true;
            let mut agents = vec![agent(0, 4, 5), blocker];

            // the agent sat on node 4 since time 0
            strategy.find_paths(0.0, &mut agents);
            agents[0].path.clear();
            strategy.find_paths(31.0, &mut agents);

            let path = &agents[0].path;
            assert_eq!(path.len(), 2, "{}", strategy.name());
            let hop = path.last_action().unwrap().node;
            assert!(graph.edge_between(4, hop).is_some(), "{}", strategy.name());
            assert!(strategy.stats().random_hops >= 1, "{}", strategy.name());
        }
    }

    #[test]
    fn test_same_input_same_paths() {
        let graph = Graph::grid(4, 4, 1.0);
        for kind in ALL {
            let run = || {
                let mut strategy =
                    Strategy::new(kind, &graph, &config(), Box::new(RecordingCommunicator::new()));
                let mut agents = vec![agent(0, 0, 15), agent(1, 12, 3), agent(2, 5, 10)];
                strategy.find_paths(0.0, &mut agents);
                agents.into_iter().map(|agent| agent.path).collect::<Vec<_>>()
            };
            assert_eq!(run(), run(), "{kind:?}");
        }
    }
}
