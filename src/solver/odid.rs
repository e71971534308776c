use std::collections::{BTreeMap, HashMap};

use tracing::{debug, instrument, trace};

use super::comm::{
    block_agents, block_static, commit_plans, hold, planned_indices, release_hold, Plan,
    PlannerCore, RuntimeBudget,
};
use super::od::OperatorDecomposition;
use super::{PathFinder, PlanningOutcome};
use crate::common::{Agent, AgentId};
use crate::communicator::Communicator;
use crate::config::PlannerConfig;
use crate::graph::Graph;
use crate::reservation::ReservationTable;
use crate::stat::Stats;

/// Share of the budget after which groups are no longer merged.
const MERGE_FRACTION: f64 = 0.9;

/// Operator decomposition with independence detection. Every agent starts in
/// its own group; groups whose plans collide are merged and planned jointly
/// until all plans are independent.
pub struct ODID<'a> {
    core: PlannerCore<'a>,
    table: ReservationTable,
    od: OperatorDecomposition,
}

impl<'a> ODID<'a> {
    pub fn new(graph: &'a Graph, config: &PlannerConfig, communicator: Box<dyn Communicator>) -> Self {
        ODID {
            core: PlannerCore::new(graph, config, communicator),
            table: ReservationTable::strict(graph),
            od: OperatorDecomposition {
                wait_step: config.wait_step,
                window: config.odid.window,
                max_node_count_per_agent: config.odid.max_node_count_per_agent,
                use_final_reservations: config.odid.use_final_reservations,
            },
        }
    }

    fn plan_group(
        &mut self,
        agents: &[Agent],
        members: &[usize],
        current_time: f64,
        budget: &RuntimeBudget,
    ) -> Vec<Plan> {
        let graph = self.core.graph;
        let result = self.od.plan(
            graph,
            &mut self.core.rra,
            &self.table,
            agents,
            members,
            current_time,
            budget.deadline(),
        );
        self.core.stats.low_level_expand_nodes += result.expansions;
        if result.timed_out {
            self.core.signal_timeout();
        }
        result.plans
    }

    /// First pair of groups whose plans collide, as (kept, merged).
    fn find_conflict(
        &self,
        groups: &BTreeMap<usize, Vec<usize>>,
        plans: &BTreeMap<usize, Vec<Plan>>,
        group_of: &HashMap<AgentId, usize>,
        agents: &[Agent],
    ) -> Option<(usize, usize)> {
        let mut simulated = ReservationTable::strict(self.core.graph);
        for group in groups.keys() {
            for plan in plans.get(group).into_iter().flatten() {
                let agent = &agents[plan.index];
                match simulated.first_collision_in(&plan.reservations) {
                    Some(collision) => {
                        let other = collision.owner.and_then(|owner| group_of.get(&owner).copied());
                        match other {
                            Some(other) if other != *group => return Some((other, *group)),
                            _ => trace!("agent {} collides within its group", agent.id),
                        }
                    }
                    None => {
                        for err in simulated.add_each(&plan.reservations, Some(agent.id), 0) {
                            trace!("simulated reservation skipped: {err}");
                        }
                    }
                }
            }
        }
        None
    }

    #[instrument(skip_all, name = "independence_detection", fields(agents = searching.len()), level = "debug")]
    fn detect_independence(
        &mut self,
        agents: &[Agent],
        searching: &[usize],
        current_time: f64,
        budget: &RuntimeBudget,
    ) -> Vec<Plan> {
        let mut groups: BTreeMap<usize, Vec<usize>> =
            searching.iter().map(|&index| (index, vec![index])).collect();
        let mut group_of: HashMap<AgentId, usize> =
            searching.iter().map(|&index| (agents[index].id, index)).collect();
        let mut plans: BTreeMap<usize, Vec<Plan>> = BTreeMap::new();
        for (&group, members) in &groups {
            if self.core.timed_out() {
                break;
            }
            plans.insert(group, self.plan_group(agents, members, current_time, budget));
        }

        while groups.len() > 1 && !self.core.timed_out() {
            let Some((kept, merged)) = self.find_conflict(&groups, &plans, &group_of, agents) else {
                break;
            };
            if budget.used(MERGE_FRACTION) {
                self.core.signal_timeout();
                break;
            }

            let moved = groups.remove(&merged).unwrap_or_default();
            plans.remove(&merged);
            for &index in &moved {
                group_of.insert(agents[index].id, kept);
            }
            let members = groups.entry(kept).or_default();
            members.extend(moved);
            let members = members.clone();
            debug!("merged group {merged} into {kept}, now {} agents", members.len());
            self.core.stats.high_level_expand_nodes += 1;
            plans.insert(kept, self.plan_group(agents, &members, current_time, budget));
        }

        plans.into_values().flatten().collect()
    }
}

impl PathFinder for ODID<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        let budget = self.core.begin_cycle(current_time, agents);
        let graph = self.core.graph;
        let order = planned_indices(agents);
        self.core.stats.planned_agents += order.len();

        self.table.clear();
        block_static(&mut self.table, agents, current_time, 0);

        let mut full = ReservationTable::strict(graph);
        block_agents(&mut full, agents, current_time, 0);
        let mut searching = Vec::new();
        let mut unreachable = Vec::new();
        for &index in &order {
            let agent = &mut agents[index];
            if self.core.is_in_deadlock(agent, current_time) {
                release_hold(&mut full, agent, current_time);
                if let Some(hop) = self
                    .core
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

            let rra = self.core.rra.get(graph, agent, false);
            if rra.is_closed(agent.next_node) || rra.search(graph, agent.next_node) {
                searching.push(index);
            } else {
                debug!("agent {} cannot reach its destination", agent.id);
                unreachable.push(index);
                for err in self.table.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
                    debug!("agent {} hold skipped: {err}", agent.id);
                }
            }
        }

        if budget.exceeded() {
            self.core.signal_timeout();
        }
        let mut plans = if self.core.timed_out() {
            Vec::new()
        } else {
            self.detect_independence(agents, &searching, current_time, &budget)
        };
        for &index in searching.iter().chain(&unreachable) {
            if !plans.iter().any(|plan| plan.index == index) {
                plans.push(Plan {
                    index,
                    path: Default::default(),
                    reservations: Vec::new(),
                });
            }
        }

        for plan in plans.iter_mut() {
            let agent = &agents[plan.index];
            let rra = self.core.rra.get(graph, agent, false);
            if let Some(last) = plan.path.last_action().map(|action| action.node) {
                rra.append_path(&mut plan.path, last);
            }
        }
        commit_plans(&mut self.core, &self.table, agents, current_time, plans);

        self.core.end_cycle(&budget)
    }

    fn name(&self) -> &'static str {
        "OD+ID"
    }

    fn stats(&self) -> &Stats {
        &self.core.stats
    }
}
