use std::collections::BTreeSet;

use tracing::{debug, instrument, trace};

use super::comm::{
    block_agents, block_static, commit_plans, committed_intervals, hold, planned_indices,
    release_hold, start_time, with_final_hold, Plan, PlannerCore,
};
use super::conflict_tree::{ConflictTree, CtNodeId, Solution};
use super::{PathFinder, PlanningOutcome};
use crate::algorithm::{Deadline, OpenEntry, SearchOutcome, SpaceTimeAStar};
use crate::common::{Agent, AgentId, Path};
use crate::communicator::Communicator;
use crate::config::{CbsSearchMethod, PlannerConfig};
use crate::graph::Graph;
use crate::reservation::{Interval, ReservationTable, TOLERANCE};
use crate::stat::Stats;

/// Share of the budget after which no further tree node is expanded.
const EXPANSION_FRACTION: f64 = 0.9;

/// Two agents whose solutions overlap on `interval`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Conflict {
    first: AgentId,
    second: AgentId,
    interval: Interval,
}

/// Conflict-based search. Every planned agent gets its own shortest route;
/// whenever two routes overlap the tree branches into one child per agent,
/// each forbidding that agent the contested interval.
pub struct CBS<'a> {
    core: PlannerCore<'a>,
    /// Everything planned agents must avoid: fixed and unplanned agents plus
    /// committed drives.
    table: ReservationTable,
    validation: ReservationTable,
}

impl<'a> CBS<'a> {
    pub fn new(graph: &'a Graph, config: &PlannerConfig, communicator: Box<dyn Communicator>) -> Self {
        CBS {
            core: PlannerCore::new(graph, config, communicator),
            table: ReservationTable::strict(graph),
            validation: ReservationTable::strict(graph),
        }
    }

    fn open_entry(&self, tree: &ConflictTree, id: CtNodeId) -> OpenEntry {
        let depth = tree.depth(id) as f64;
        match self.core.config.cbs.search_method {
            CbsSearchMethod::BestFirst => OpenEntry::with_g(tree.cost(id), depth, id),
            CbsSearchMethod::BreadthFirst => OpenEntry::new(depth, id),
            CbsSearchMethod::DepthFirst => OpenEntry::new(-depth, id),
        }
    }

    /// Finds the agent's route under the constraints visible at `id`.
    #[instrument(skip_all, name = "cbs_solve", fields(agent = agent.id, node = id), level = "debug")]
    fn solve(
        &mut self,
        tree: &mut ConflictTree,
        id: CtNodeId,
        agent: &Agent,
        current_time: f64,
        deadline: Deadline,
    ) -> SearchOutcome {
        let graph = self.core.graph;
        let committed = committed_intervals(agent, current_time);
        let mut table = self.table.clone();
        table.remove_all(&committed);

        for constraint in tree.constraints(id, agent.id) {
            for err in table.add_each(&[constraint], None, 0) {
                trace!("constraint overlaps another: {err}");
            }
        }
        // the drive to the next node cannot be changed
        if !table.intervals_free(&committed) {
            return SearchOutcome::Exhausted;
        }

        let start = start_time(agent, current_time);
        let mut search = SpaceTimeAStar::new(agent, start, self.core.config.wait_step, f64::INFINITY);
        search.final_reservation = true;
        search.time_limit = start + self.core.config.cbs.horizon;

        let rra = self.core.rra.get(graph, agent, false);
        let outcome = search.search(graph, &table, rra, deadline);
        self.core.stats.low_level_expand_nodes += search.expansions();

        if let SearchOutcome::Found(goal) = outcome {
            let (mut path, reservations) = search.path_and_reservations(goal, 0.0);
            debug_assert!(table.intervals_free(&reservations));
            path.ensure_starts_at(agent.next_node);
            tree.set_solution(id, agent.id, Solution { path, reservations });
        }
        outcome
    }

    /// First overlap between the solutions visible at `id`, in time order.
    fn validate(
        &mut self,
        tree: &ConflictTree,
        id: CtNodeId,
        agents: &[Agent],
        searching: &[usize],
        current_time: f64,
    ) -> Option<Conflict> {
        self.validation.clear();
        for agent in agents.iter().filter(|agent| !agent.fixed_position) {
            for err in
                self.validation
                    .add_each(&committed_intervals(agent, current_time), Some(agent.id), 0)
            {
                trace!("committed drive skipped: {err}");
            }
        }

        let mut reservations: Vec<(AgentId, Interval)> = searching
            .iter()
            .filter_map(|&index| {
                let agent = agents[index].id;
                tree.solution(id, agent)
                    .map(|solution| (agent, with_final_hold(&solution.reservations)))
            })
            .flat_map(|(agent, intervals)| intervals.into_iter().map(move |iv| (agent, iv)))
            .collect();
        reservations.sort_by(|a, b| a.1.start.total_cmp(&b.1.start).then(a.0.cmp(&b.0)));

        for (agent, interval) in reservations {
            let conflict = self
                .validation
                .reservations(interval.node)
                .iter()
                .filter(|slot| slot.owner != Some(agent) && slot.interval.overlaps(&interval))
                .find_map(|slot| {
                    let overlap = Interval::new(
                        interval.node,
                        slot.interval.start.max(interval.start),
                        slot.interval.end.min(interval.end),
                    );
                    let owner = slot.owner?;
                    (overlap.duration() > TOLERANCE).then_some(Conflict {
                        first: owner,
                        second: agent,
                        interval: overlap,
                    })
                });
            if conflict.is_some() {
                return conflict;
            }
            if let Err(err) = self.validation.try_add(&interval, Some(agent), 0) {
                trace!("agent {agent} overlaps itself: {err}");
            }
        }
        None
    }

    /// Solves the root for every agent in `searching`. Agents without any
    /// route are reported, turned into obstacles and dropped, and the others
    /// are solved again around them.
    fn solve_root(
        &mut self,
        tree: &mut ConflictTree,
        agents: &[Agent],
        searching: &mut Vec<usize>,
        current_time: f64,
        deadline: Deadline,
    ) -> bool {
        loop {
            let mut unsolvable = Vec::new();
            for &index in searching.iter() {
                match self.solve(tree, ConflictTree::ROOT, &agents[index], current_time, deadline) {
                    SearchOutcome::Found(_) => {}
                    SearchOutcome::Exhausted => unsolvable.push(index),
                    SearchOutcome::TimedOut => return false,
                }
            }
            if unsolvable.is_empty() {
                return true;
            }

            let listed: Vec<String> = unsolvable
                .iter()
                .map(|&index| {
                    let agent = &agents[index];
                    format!("Agent{}({}->{})", agent.id, agent.next_node, agent.destination_node)
                })
                .collect();
            self.core.communicator.log_severe(&format!(
                "CBS could not obtain an initial solution for the following agents: {}",
                listed.join(",")
            ));

            searching.retain(|index| !unsolvable.contains(index));
            for &index in &unsolvable {
                let agent = &agents[index];
                tree.forget_root_solution(agent.id);
                for err in self.table.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
                    debug!("agent {} hold skipped: {err}", agent.id);
                }
            }
        }
    }
}

impl PathFinder for CBS<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        let budget = self.core.begin_cycle(current_time, agents);
        let order = planned_indices(agents);
        self.core.stats.planned_agents += order.len();

        self.table.clear();
        block_static(&mut self.table, agents, current_time, 0);

        // deadlock hops are checked against everyone's current position
        let mut full = ReservationTable::strict(self.core.graph);
        block_agents(&mut full, agents, current_time, 0);
        let mut searching = Vec::new();
        for &index in &order {
            let agent = &mut agents[index];
            if self.core.is_in_deadlock(agent, current_time) {
                release_hold(&mut full, agent, current_time);
                if let Some(hop) =
                    self.core
                        .break_deadlock(agent, &mut full, current_time, true, true)
                {
                    for err in self.table.add_each(&hop, Some(agent.id), 0) {
                        debug!("agent {} hop reservation skipped: {err}", agent.id);
                    }
                    continue;
                }
                for err in full.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
                    debug!("agent {} hold skipped: {err}", agent.id);
                }
            }
            searching.push(index);
        }

        let deadline = budget.deadline();
        let mut tree = ConflictTree::new();
        let mut best = ConflictTree::ROOT;
        let all_searching = searching.clone();

        if self.solve_root(&mut tree, agents, &mut searching, current_time, deadline) {
            let mut open = BTreeSet::new();
            open.insert(self.open_entry(&tree, ConflictTree::ROOT));
            let mut best_time = f64::NEG_INFINITY;

            while let Some(entry) = open.pop_first() {
                let node = entry.id;
                let Some(conflict) = self.validate(&tree, node, agents, &searching, current_time)
                else {
                    best = node;
                    break;
                };
                if budget.used(EXPANSION_FRACTION) {
                    self.core.signal_timeout();
                    break;
                }
                if conflict.interval.start > best_time {
                    best_time = conflict.interval.start;
                    best = node;
                }
                trace!(
                    "agents {} and {} conflict on {}",
                    conflict.first,
                    conflict.second,
                    conflict.interval
                );

                for agent_id in [conflict.first, conflict.second] {
                    let Some(&index) = searching.iter().find(|&&i| agents[i].id == agent_id) else {
                        continue;
                    };
                    let child = tree.add_child(node, agent_id, conflict.interval);
                    match self.solve(&mut tree, child, &agents[index], current_time, deadline) {
                        SearchOutcome::Found(_) => {
                            self.core.stats.high_level_expand_nodes += 1;
                            open.insert(self.open_entry(&tree, child));
                        }
                        SearchOutcome::Exhausted => {}
                        SearchOutcome::TimedOut => self.core.signal_timeout(),
                    }
                }
                if self.core.timed_out() {
                    break;
                }
            }
        } else {
            self.core.signal_timeout();
        }
        debug!("conflict tree has {} nodes, best {best}", tree.len());

        let plans = all_searching
            .iter()
            .map(|&index| {
                let solution = searching
                    .contains(&index)
                    .then(|| tree.solution(best, agents[index].id))
                    .flatten();
                match solution {
                    Some(solution) => Plan {
                        index,
                        path: solution.path.clone(),
                        reservations: solution.reservations.clone(),
                    },
                    None => Plan {
                        index,
                        path: Path::new(),
                        reservations: Vec::new(),
                    },
                }
            })
            .collect();
        commit_plans(&mut self.core, &self.table, agents, current_time, plans);

        self.core.end_cycle(&budget)
    }

    fn name(&self) -> &'static str {
        "CBS"
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

    fn config() -> PlannerConfig {
        PlannerConfig {
            runtime_limit_per_agent: 5.0,
            runtime_limit_overall: 10.0,
            ..PlannerConfig::default()
        }
    }

    #[test]
    fn test_independent_agents_need_no_branching() {
        let graph = Graph::grid(3, 3, 1.0);
        let mut cbs = CBS::new(&graph, &config(), Box::new(RecordingCommunicator::new()));
        let mut agents = vec![
            Agent::new(0, 0, 2, Physics::default()),
            Agent::new(1, 6, 8, Physics::default()),
        ];

        assert_eq!(cbs.find_paths(0.0, &mut agents), PlanningOutcome::Completed);
        assert_eq!(cbs.stats().high_level_expand_nodes, 0);
        for agent in &agents {
            assert_eq!(agent.path.next_action().unwrap().node, agent.next_node);
            assert_eq!(agent.path.last_action().unwrap().node, agent.destination_node);
        }
    }

    #[test]
    fn test_crossing_agents_branch_and_both_arrive() {
        let graph = Graph::grid(3, 3, 1.0);
        let mut cbs = CBS::new(&graph, &config(), Box::new(RecordingCommunicator::new()));
        let mut agents = vec![
            Agent::new(0, 3, 5, Physics::default()),
            Agent::new(1, 1, 7, Physics::default()),
        ];

        assert_eq!(cbs.find_paths(0.0, &mut agents), PlanningOutcome::Completed);
        assert!(cbs.stats().high_level_expand_nodes >= 1);
        for agent in &agents {
            assert_eq!(agent.path.next_action().unwrap().node, agent.next_node);
            assert_eq!(agent.path.last_action().unwrap().node, agent.destination_node);
        }
    }

    #[test]
    fn test_unsolvable_agent_is_reported_and_waits() {
        let mut graph = Graph::grid(3, 2, 1.0);
        graph.set_locked(1, true);
        graph.set_locked(4, true);
        let recorder = RecordingCommunicator::new();
        let mut cbs = CBS::new(&graph, &config(), Box::new(recorder.clone()));
        let mut agents = vec![
            Agent::new(0, 0, 2, Physics::default()),
            Agent::new(1, 5, 2, Physics::default()),
        ];

        assert_eq!(cbs.find_paths(0.0, &mut agents), PlanningOutcome::Completed);
        assert!(recorder.messages().iter().any(|message| message
            .contains("CBS could not obtain an initial solution for the following agents: Agent0(0->2)")));
        assert_eq!(agents[0].path, Path::wait_at(0, 5.0));
        assert_eq!(agents[1].path.last_action().unwrap().node, 2);
    }

    #[test]
    fn test_search_method_orders_open_list() {
        let graph = Graph::grid(2, 1, 1.0);
        let mut config = config();
        config.cbs.search_method = CbsSearchMethod::DepthFirst;
        let cbs = CBS::new(&graph, &config, Box::new(RecordingCommunicator::new()));
        let mut tree = ConflictTree::new();
        let child = tree.add_child(ConflictTree::ROOT, 0, Interval::new(0, 0.0, 1.0));

        let mut open = BTreeSet::new();
        open.insert(cbs.open_entry(&tree, ConflictTree::ROOT));
        open.insert(cbs.open_entry(&tree, child));
        assert_eq!(open.pop_first().unwrap().id, child);
    }
}
