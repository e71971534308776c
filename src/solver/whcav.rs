use std::collections::HashMap;

use tracing::{debug, instrument};

use super::comm::{
    block_agents, hold, planned_indices, release_hold, start_time, PlannerCore, RuntimeBudget,
};
use super::{PathFinder, PlanningOutcome};
use crate::algorithm::{SearchOutcome, SpaceTimeAStar};
use crate::common::{Agent, AgentId};
use crate::communicator::Communicator;
use crate::config::PlannerConfig;
use crate::graph::Graph;
use crate::reservation::{Interval, ReservationTable};
use crate::stat::Stats;

/// Share of the budget after which a pass keeps going despite failures.
const LAST_RUN_FRACTION: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    ConflictFree,
    /// Some agent found no route in its window.
    Conflict,
    TimedOut,
}

/// Windowed cooperative A* with priorities. An agent that cannot find a
/// route gets a higher priority, which moves it to the front of the order
/// and makes it wait a little before leaving so others can clear the way.
/// Priorities only live for the current cycle.
pub struct WHCAv<'a> {
    core: PlannerCore<'a>,
    table: ReservationTable,
}

impl<'a> WHCAv<'a> {
    pub fn new(graph: &'a Graph, config: &PlannerConfig, communicator: Box<dyn Communicator>) -> Self {
        WHCAv {
            core: PlannerCore::new(graph, config, communicator),
            table: ReservationTable::strict(graph),
        }
    }

    fn wait(&mut self, agent: &mut Agent, current_time: f64) {
        self.core.wait(agent);
        for err in self.table.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
            debug!("agent {} wait hold skipped: {err}", agent.id);
        }
    }

    fn sorted(&self, agents: &[Agent], priorities: &HashMap<AgentId, u32>) -> Vec<usize> {
        let graph = self.core.graph;
        let mut order = planned_indices(agents);
        order.sort_by(|&a, &b| {
            let (a, b) = (&agents[a], &agents[b]);
            let priority = |agent: &Agent| priorities.get(&agent.id).copied().unwrap_or(0);
            priority(b)
                .cmp(&priority(a))
                .then_with(|| a.can_go_through_obstacles.cmp(&b.can_go_through_obstacles))
                .then_with(|| {
                    graph
                        .distance(a.next_node, a.destination_node)
                        .total_cmp(&graph.distance(b.next_node, b.destination_node))
                })
        });
        order
    }

    /// One planning pass over all agents.
    #[instrument(skip_all, name = "whcav_pass", level = "debug")]
    fn pass(
        &mut self,
        current_time: f64,
        agents: &mut [Agent],
        priorities: &mut HashMap<AgentId, u32>,
        last_run: bool,
        budget: &RuntimeBudget,
    ) -> Pass {
        let graph = self.core.graph;
        let mut result = Pass::ConflictFree;

        self.table.clear();
        block_agents(&mut self.table, agents, current_time, 0);
        let order = self.sorted(agents, priorities);

        for (position, &index) in order.iter().enumerate() {
            if budget.exceeded() {
                for &rest in &order[position..] {
                    self.core.wait(&mut agents[rest]);
                }
                return Pass::TimedOut;
            }

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

            let priority = priorities.get(&agent.id).copied().unwrap_or(0);
            let start = start_time(agent, current_time);
            let mut search = SpaceTimeAStar::new(
                agent,
                start,
                self.core.config.wait_step,
                start + self.core.config.whcav.window,
            );
            search.wait_steps_before_start = (1usize << priority.min(16)) / 2;

            let rra = self.core.rra.get(graph, agent, false);
            if search.heuristic(graph, rra, search.start()).is_infinite() {
                debug!("agent {} cannot reach its destination", agent.id);
                self.wait(agent, current_time);
                continue;
            }
            let outcome = search.search(graph, &self.table, rra, budget.deadline());
            self.core.stats.low_level_expand_nodes += search.expansions();

            match outcome {
                SearchOutcome::Found(goal) => {
                    let (mut path, reservations) = search.path_and_reservations(goal, 0.0);
                    if let Err(err) = self.table.try_add_all(&reservations, Some(agent.id), 0) {
                        debug!("agent {} route rejected: {err}", agent.id);
                        self.wait(agent, current_time);
                        continue;
                    }
                    // stay at the end of the window unless someone else needs the node
                    let (node, time) = (search.node_2d(goal), search.time(goal));
                    if let Err(err) =
                        self.table.try_add(&Interval::permanent(node, time), Some(agent.id), 0)
                    {
                        debug!("agent {} keeps no hold at {node}: {err}", agent.id);
                    }

                    let rra = self.core.rra.get(graph, agent, false);
                    rra.append_path(&mut path, node);
                    path.ensure_starts_at(agent.next_node);
                    agent.path = path;
                }
                SearchOutcome::TimedOut => {
                    for &rest in &order[position..] {
                        self.core.wait(&mut agents[rest]);
                    }
                    return Pass::TimedOut;
                }
                SearchOutcome::Exhausted => {
                    result = Pass::Conflict;
                    *priorities.entry(agent.id).or_insert(0) += 1;
                    self.wait(agent, current_time);
                    if !last_run && self.core.config.whcav.abort_at_first_conflict {
                        for &rest in &order[position + 1..] {
                            self.core.wait(&mut agents[rest]);
                        }
                        return Pass::Conflict;
                    }
                }
            }
        }
        result
    }
}

impl PathFinder for WHCAv<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        let budget = self.core.begin_cycle(current_time, agents);
        let mut priorities: HashMap<AgentId, u32> = HashMap::new();

        let planned = planned_indices(agents);
        self.core.stats.planned_agents += planned.len();
        for &index in &planned {
            if self.core.is_in_deadlock(&agents[index], current_time) {
                self.core.rra.invalidate(agents[index].id);
            }
        }

        loop {
            self.core.stats.high_level_expand_nodes += 1;
            let last_run = budget.used(LAST_RUN_FRACTION);
            match self.pass(current_time, agents, &mut priorities, last_run, &budget) {
                Pass::ConflictFree => break,
                Pass::TimedOut => {
                    self.core.signal_timeout();
                    break;
                }
                Pass::Conflict if last_run || budget.exceeded() => {
                    if budget.exceeded() {
                        self.core.signal_timeout();
                    }
                    break;
                }
                Pass::Conflict => debug!("retrying with priorities {priorities:?}"),
            }
        }

        self.core.end_cycle(&budget)
    }

    fn name(&self) -> &'static str {
        "WHCAv*"
    }

    fn stats(&self) -> &Stats {
        &self.core.stats
    }
}
