//! Plumbing shared by every strategy: the cycle budget, the blockage derived
//! from agents' committed motion and the final safety commit.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::algorithm::{Deadline, RraStarCache};
use crate::common::{Agent, Path};
use crate::communicator::Communicator;
use crate::config::PlannerConfig;
use crate::deadlock::DeadlockHandler;
use crate::graph::Graph;
use crate::reservation::{is_well_formed, Interval, ReservationTable};
use crate::stat::Stats;

use super::PlanningOutcome;

/// Wall-clock budget of one planning cycle.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeBudget {
    start: Instant,
    limit: f64,
}

impl RuntimeBudget {
    /// The limit is the smaller of the per-agent share and the overall cap.
    pub fn start(config: &PlannerConfig, agent_count: usize) -> Self {
        let limit = (config.runtime_limit_per_agent * agent_count as f64)
            .min(config.runtime_limit_overall)
            .max(0.0);
        RuntimeBudget {
            start: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn exceeded(&self) -> bool {
        self.elapsed() >= self.limit
    }

    /// Whether `fraction` of the budget is used up.
    pub fn used(&self, fraction: f64) -> bool {
        self.elapsed() >= self.limit * fraction
    }

    pub fn deadline(&self) -> Deadline {
        Duration::try_from_secs_f64(self.limit)
            .ok()
            .and_then(|limit| self.start.checked_add(limit))
            .map_or(Deadline::none(), Deadline::at)
    }
}

/// State every strategy carries across cycles.
pub(crate) struct PlannerCore<'a> {
    pub graph: &'a Graph,
    pub config: PlannerConfig,
    pub communicator: Box<dyn Communicator>,
    pub deadlock: DeadlockHandler,
    pub rra: RraStarCache,
    pub stats: Stats,
    timed_out: bool,
}

impl<'a> PlannerCore<'a> {
    pub fn new(
        graph: &'a Graph,
        config: &PlannerConfig,
        communicator: Box<dyn Communicator>,
    ) -> Self {
        PlannerCore {
            graph,
            config: config.clone(),
            communicator,
            deadlock: DeadlockHandler::new(
                config.seed,
                config.maximum_wait_time,
                config.wait_step,
            ),
            rra: RraStarCache::new(),
            stats: Stats::default(),
            timed_out: false,
        }
    }

    pub fn begin_cycle(&mut self, current_time: f64, agents: &[Agent]) -> RuntimeBudget {
        self.stats.cycles += 1;
        self.timed_out = false;
        self.deadlock.update(agents, current_time);
        // fixed agents do not move away during the cycle
        self.rra.learn_obstacles(
            agents
                .iter()
                .filter(|agent| agent.fixed_position)
                .map(|agent| agent.next_node)
                .collect(),
        );
        RuntimeBudget::start(&self.config, agents.len())
    }

    pub fn end_cycle(&mut self, budget: &RuntimeBudget) -> PlanningOutcome {
        self.stats.time_us += budget.start.elapsed().as_micros();
        if self.timed_out {
            PlanningOutcome::TimedOut
        } else {
            PlanningOutcome::Completed
        }
    }

    /// Tells the communicator, once per cycle.
    pub fn signal_timeout(&mut self) {
        if !self.timed_out {
            self.timed_out = true;
            self.stats.timeouts += 1;
            self.communicator.signal_timeout();
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Replaces the agent's path with one wait step at its next node.
    pub fn wait(&mut self, agent: &mut Agent) {
        agent.path = Path::wait_at(agent.next_node, self.config.wait_step);
        self.stats.wait_steps += 1;
    }

    pub fn is_in_deadlock(&self, agent: &Agent, current_time: f64) -> bool {
        self.deadlock.is_in_deadlock(agent, current_time)
    }

    /// Sends a deadlocked agent to a random free neighbor, reserving the hop
    /// in `table`. On success the agent's search is rebuilt next time.
    pub fn break_deadlock(
        &mut self,
        agent: &mut Agent,
        table: &mut ReservationTable,
        current_time: f64,
        final_reservation: bool,
        insert_reservation: bool,
    ) -> Option<Vec<Interval>> {
        self.communicator.log_default(&format!(
            "Agent {} is in a deadlock at node {}",
            agent.id, agent.next_node
        ));
        let start = start_time(agent, current_time);
        let hop = self.deadlock.random_hop_reserved(
            self.graph,
            agent,
            table,
            start,
            final_reservation,
            insert_reservation,
        )?;
        self.stats.random_hops += 1;
        self.rra.invalidate(agent.id);
        Some(hop)
    }
}

/// Agents this cycle replans: free to move, away from their destination and
/// asking for a route.
pub(crate) fn is_planned(agent: &Agent) -> bool {
    agent.needs_planning() && agent.request_reoptimization
}

pub(crate) fn planned_indices(agents: &[Agent]) -> Vec<usize> {
    (0..agents.len()).filter(|&i| is_planned(&agents[i])).collect()
}

/// Earliest time the agent can leave its next node.
pub(crate) fn start_time(agent: &Agent, current_time: f64) -> f64 {
    agent.arrival_time_at_next_node.max(current_time)
}

/// What the agent cannot take back: its fixed position, or the remaining
/// drive to its next node.
pub(crate) fn committed_intervals(agent: &Agent, current_time: f64) -> Vec<Interval> {
    if agent.fixed_position {
        return vec![Interval::permanent(agent.next_node, current_time)];
    }
    agent
        .reservations_to_next_node
        .iter()
        .filter(|interval| interval.end > current_time)
        .map(|interval| Interval::new(interval.node, interval.start.max(current_time), interval.end))
        .collect()
}

/// The agent stays on its next node until it is planned otherwise.
pub(crate) fn hold(agent: &Agent, current_time: f64) -> Interval {
    Interval::permanent(agent.next_node, start_time(agent, current_time))
}

/// Reserves every agent's committed motion plus a hold on its next node.
/// Conflicts between these are logged and skipped.
pub(crate) fn block_agents(
    table: &mut ReservationTable,
    agents: &[Agent],
    current_time: f64,
    priority: i32,
) {
    for agent in agents {
        let mut intervals = committed_intervals(agent, current_time);
        if !agent.fixed_position {
            intervals.push(hold(agent, current_time));
        }
        for err in table.add_each(&intervals, Some(agent.id), priority) {
            debug!("agent {} blockage skipped: {err}", agent.id);
        }
    }
}

/// Like `block_agents`, but planned agents only keep their committed drive.
pub(crate) fn block_static(
    table: &mut ReservationTable,
    agents: &[Agent],
    current_time: f64,
    priority: i32,
) {
    for agent in agents {
        let mut intervals = committed_intervals(agent, current_time);
        if !is_planned(agent) && !agent.fixed_position {
            intervals.push(hold(agent, current_time));
        }
        for err in table.add_each(&intervals, Some(agent.id), priority) {
            debug!("agent {} blockage skipped: {err}", agent.id);
        }
    }
}

pub(crate) fn release_hold(table: &mut ReservationTable, agent: &Agent, current_time: f64) -> bool {
    table.remove_owned(agent.next_node, start_time(agent, current_time), agent.id)
}

/// Occupancy of a plan with the final stop held forever.
pub(crate) fn with_final_hold(reservations: &[Interval]) -> Vec<Interval> {
    let mut intervals = reservations.to_vec();
    if let Some(last) = intervals.last_mut() {
        last.end = f64::INFINITY;
    }
    intervals
}

/// A path proposed for the agent at `index` and its occupancy.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub index: usize,
    pub path: Path,
    pub reservations: Vec<Interval>,
}

/// Commits jointly planned paths on top of `base`. A plan that does not fit
/// turns its agent into a waiting one and the pass restarts, so the result
/// never double-books a node. Returns the table with everything committed.
pub(crate) fn commit_plans(
    core: &mut PlannerCore<'_>,
    base: &ReservationTable,
    agents: &mut [Agent],
    current_time: f64,
    plans: Vec<Plan>,
) -> ReservationTable {
    let mut waiting: HashSet<usize> = plans
        .iter()
        .filter(|plan| plan.path.is_empty() || plan.reservations.is_empty())
        .map(|plan| plan.index)
        .collect();

    let table = loop {
        let mut table = base.clone();
        for plan in plans.iter().filter(|plan| waiting.contains(&plan.index)) {
            let agent = &agents[plan.index];
            for err in table.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
                debug!("agent {} wait hold skipped: {err}", agent.id);
            }
        }

        let mut failed = None;
        for plan in plans.iter().filter(|plan| !waiting.contains(&plan.index)) {
            debug_assert!(
                is_well_formed(&plan.reservations),
                "malformed reservations for agent {}",
                agents[plan.index].id
            );
            let intervals = with_final_hold(&plan.reservations);
            if let Err(err) = table.try_add_all(&intervals, Some(agents[plan.index].id), 0) {
                trace!("agent {} plan rejected: {err}", agents[plan.index].id);
                failed = Some(plan.index);
                break;
            }
        }
        match failed {
            Some(index) => {
                waiting.insert(index);
            }
            None => break table,
        }
    };

    for plan in plans {
        let agent = &mut agents[plan.index];
        if waiting.contains(&plan.index) {
            core.wait(agent);
        } else {
            agent.path = plan.path;
            agent.path.ensure_starts_at(agent.next_node);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::RecordingCommunicator;
    use crate::physics::Physics;

    fn agent(id: usize, next: usize, destination: usize) -> Agent {
        Agent::new(id, next, destination, Physics::default())
    }

    #[test]
    fn test_runtime_budget() {
        let mut config = PlannerConfig::default();
        config.runtime_limit_per_agent = 0.5;
        config.runtime_limit_overall = 1.0;
        assert_eq!(RuntimeBudget::start(&config, 1).limit(), 0.5);
        assert_eq!(RuntimeBudget::start(&config, 10).limit(), 1.0);

        config.runtime_limit_overall = 0.0;
        let budget = RuntimeBudget::start(&config, 10);
        assert!(budget.exceeded());
        assert!(budget.deadline().expired());
    }

    #[test]
    fn test_block_agents_and_release_hold() {
        let graph = Graph::grid(3, 1, 1.0);
        let mut table = ReservationTable::strict(&graph);
        let mut driving = agent(0, 1, 2);
        driving.reservations_to_next_node =
            vec![Interval::new(0, 0.0, 2.0), Interval::new(1, 1.0, 3.0)];
        driving.arrival_time_at_next_node = 3.0;
        let mut fixed = agent(1, 2, 0);
        fixed.fixed_position = true;

        block_agents(&mut table, &[driving.clone(), fixed], 1.0, 0);
        assert!(!table.is_free(0, 1.0, 1.5));
        assert!(!table.is_free(1, 10.0, 11.0));
        assert!(!table.is_free(2, 1.0, 100.0));

        assert!(release_hold(&mut table, &driving, 1.0));
        assert!(table.is_free(1, 10.0, 11.0));
        assert!(!table.is_free(1, 2.0, 2.5));
        assert!(!release_hold(&mut table, &driving, 1.0));
    }

    #[test]
    fn test_commit_plans_turns_conflicting_plan_into_wait() {
        let graph = Graph::grid(3, 1, 1.0);
        let base = ReservationTable::strict(&graph);
        let config = PlannerConfig::default();
        let mut core = PlannerCore::new(&graph, &config, Box::new(RecordingCommunicator::new()));
        let mut agents = vec![agent(0, 0, 2), agent(1, 2, 0)];

        let mut first = Path::new();
        first.add_last(0, true, 0.0);
        first.add_last(1, true, 0.0);
        // both want node 1 forever
        let plans = vec![
            Plan {
                index: 0,
                path: first.clone(),
                reservations: vec![Interval::new(0, 0.0, 2.0), Interval::new(1, 1.0, 3.0)],
            },
            Plan {
                index: 1,
                path: Path::wait_at(1, 0.0),
                reservations: vec![Interval::new(2, 0.0, 2.0), Interval::new(1, 1.5, 3.0)],
            },
        ];

        let table = commit_plans(&mut core, &base, &mut agents, 0.0, plans);
        assert_eq!(agents[0].path, first);
        assert_eq!(agents[1].path, Path::wait_at(2, config.wait_step));
        assert_eq!(core.stats.wait_steps, 1);
        assert!(!table.is_free(2, 50.0, 51.0));
        assert!(table.is_disjoint());
    }

    #[test]
    fn test_timeout_is_signalled_once() {
        let graph = Graph::grid(2, 1, 1.0);
        let recorder = RecordingCommunicator::new();
        let mut core = PlannerCore::new(
            &graph,
            &PlannerConfig::default(),
            Box::new(recorder.clone()),
        );
        let budget = core.begin_cycle(0.0, &[]);
        core.signal_timeout();
        core.signal_timeout();
        assert_eq!(core.end_cycle(&budget), PlanningOutcome::TimedOut);
        assert_eq!(recorder.timeouts(), 1);
        assert_eq!(core.stats.timeouts, 1);
    }
}
