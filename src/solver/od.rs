//! Operator decomposition: a joint A* over a group of agents in which every
//! search node advances exactly one agent, always the one that is earliest in
//! simulated time.

use std::collections::BTreeSet;

use tracing::{debug, instrument, trace};

use super::comm::{start_time, with_final_hold, Plan};
use crate::algorithm::{Deadline, OpenEntry, RraStarCache, SpaceTimeAStar, StNodeId, DEADLINE_POLL_INTERVAL};
use crate::common::Agent;
use crate::graph::Graph;
use crate::reservation::{Interval, ReservationTable};

#[derive(Debug, Clone, Copy)]
struct OdNode {
    parent: Option<usize>,
    /// Group member advanced by this node, `None` at the root.
    member: Option<usize>,
    step: StNodeId,
    g: f64,
    h: f64,
}

/// Knobs of the joint search.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OperatorDecomposition {
    pub wait_step: f64,
    pub window: f64,
    pub max_node_count_per_agent: usize,
    /// Treat the end of other members' partial routes as held forever.
    pub use_final_reservations: bool,
}

/// Result of planning one group.
#[derive(Debug)]
pub(crate) struct GroupResult {
    pub plans: Vec<Plan>,
    pub expansions: usize,
    pub timed_out: bool,
}

/// Per-call search state.
struct JointSearch<'s> {
    members: &'s [usize],
    agents: &'s [Agent],
    steppers: Vec<SpaceTimeAStar>,
    nodes: Vec<OdNode>,
}

impl JointSearch<'_> {
    /// The member's stepper state as of joint node `n`.
    fn step_of(&self, n: usize, member: usize) -> StNodeId {
        let mut current = n;
        loop {
            let node = &self.nodes[current];
            match (node.parent, node.member) {
                (Some(_), Some(m)) if m == member => return node.step,
                (Some(parent), _) => current = parent,
                (None, _) => return 0,
            }
        }
    }

    fn at_destination(&self, n: usize, member: usize) -> bool {
        let agent = &self.agents[self.members[member]];
        self.steppers[member].node_2d(self.step_of(n, member)) == agent.destination_node
    }

    /// Earliest member that still has to reach its destination.
    fn next_member(&self, n: usize) -> Option<(usize, f64)> {
        (0..self.members.len())
            .filter(|&member| !self.at_destination(n, member))
            .map(|member| (member, self.steppers[member].time(self.step_of(n, member))))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Time reached by the member advanced in `n`.
    fn time_of(&self, n: usize) -> f64 {
        match self.nodes[n].member {
            Some(member) => self.steppers[member].time(self.nodes[n].step),
            None => 0.0,
        }
    }

    /// Occupancy of the other members from `from` on, on top of `base`. A
    /// member that has not moved yet stands where it is, one that arrived
    /// stays at its destination. `None` when these occupancies overlap, so
    /// the joint state cannot be executed.
    fn table_for(
        &self,
        base: &ReservationTable,
        n: usize,
        member: Option<usize>,
        from: f64,
        use_final_reservations: bool,
    ) -> Option<ReservationTable> {
        let mut table = base.clone();
        for other in (0..self.members.len()).filter(|&other| Some(other) != member) {
            let agent = &self.agents[self.members[other]];
            let stepper = &self.steppers[other];
            let step = self.step_of(n, other);
            let (_, reservations) = stepper.path_and_reservations(step, from);
            let reservations = if reservations.is_empty() {
                vec![Interval::permanent(stepper.node_2d(step), stepper.time(step))]
            } else if self.at_destination(n, other) {
                with_final_hold(&reservations)
            } else if use_final_reservations
                && table.intervals_free(&with_final_hold(&reservations))
            {
                with_final_hold(&reservations)
            } else {
                reservations
            };
            if let Err(err) = table.try_add_all(&reservations, Some(agent.id), 0) {
                trace!("joint state {n} rejected, agent {} overlaps: {err}", agent.id);
                return None;
            }
        }
        Some(table)
    }
}

impl OperatorDecomposition {
    /// Plans the agents at `members` jointly on top of `base`. Gives back the
    /// best partial joint state when the window, the node limit or the
    /// deadline cuts the search short.
    #[instrument(skip_all, name = "operator_decomposition", fields(group = members.len()), level = "debug")]
    #[allow(clippy::too_many_arguments)]
    pub fn plan(
        &self,
        graph: &Graph,
        rra: &mut RraStarCache,
        base: &ReservationTable,
        agents: &[Agent],
        members: &[usize],
        current_time: f64,
        deadline: Deadline,
    ) -> GroupResult {
        let mut search = JointSearch {
            members,
            agents,
            steppers: members
                .iter()
                .map(|&index| {
                    let agent = &agents[index];
                    let mut stepper = SpaceTimeAStar::new(
                        agent,
                        start_time(agent, current_time),
                        self.wait_step,
                        f64::INFINITY,
                    );
                    stepper.tie_breaking = false;
                    stepper
                })
                .collect(),
            nodes: Vec::new(),
        };

        let mut root_g = 0.0;
        let mut root_h = 0.0;
        for (member, &index) in members.iter().enumerate() {
            let stepper = &search.steppers[member];
            root_g += stepper.time(0);
            let h = stepper.heuristic(graph, rra.get(graph, &agents[index], false), 0);
            if h.is_finite() {
                root_h += h;
            }
        }
        search.nodes.push(OdNode {
            parent: None,
            member: None,
            step: 0,
            g: root_g,
            h: root_h,
        });

        let max_nodes = self.max_node_count_per_agent * members.len().max(1);
        let mut open = BTreeSet::new();
        open.insert(OpenEntry::with_g(root_g + root_h, root_g, 0));
        let (mut best, mut best_h, mut best_time) = (0, root_h, current_time);
        let mut goal = None;
        let mut expansions = 0;
        let mut timed_out = false;

        while let Some(entry) = open.pop_first() {
            let n = entry.id;
            expansions += 1;
            if expansions % DEADLINE_POLL_INTERVAL == 0 && deadline.expired() {
                timed_out = true;
                break;
            }

            let next = search.next_member(n);
            let Some(table) = search.table_for(
                base,
                n,
                next.map(|(member, _)| member),
                next.map_or(current_time, |(_, time)| time),
                self.use_final_reservations,
            ) else {
                continue;
            };

            if n != 0 {
                let time = search.time_of(n);
                let h = search.nodes[n].h;
                if time - current_time > (best_time - current_time) * 2.0 || h < best_h {
                    (best, best_h, best_time) = (n, h, time);
                }
                if time > current_time + self.window {
                    goal = Some(n);
                    break;
                }
                if search.nodes.len() > max_nodes {
                    debug!("node limit {max_nodes} reached");
                    break;
                }
            }

            let Some((member, _)) = next else {
                goal = Some(n);
                break;
            };
            let agent = &agents[members[member]];
            let from = search.step_of(n, member);
            let successors = search.steppers[member].successors(graph, &table, from);

            let rra = rra.get(graph, agent, false);
            let stepper = &search.steppers[member];
            let h_from = stepper.heuristic(graph, rra, from);
            let h_from = if h_from.is_finite() { h_from } else { 0.0 };
            for successor in successors {
                let h_to = stepper.heuristic(graph, rra, successor);
                if h_to.is_infinite() {
                    continue;
                }
                let parent = search.nodes[n];
                let g = parent.g - stepper.time(from) + stepper.time(successor);
                let h = parent.h - h_from + h_to;
                search.nodes.push(OdNode {
                    parent: Some(n),
                    member: Some(member),
                    step: successor,
                    g,
                    h,
                });
                open.insert(OpenEntry::with_g(g + h, g, search.nodes.len() - 1));
            }
        }

        let goal = goal.unwrap_or(best);
        let plans = members
            .iter()
            .enumerate()
            .map(|(member, &index)| {
                let (path, reservations) = search.steppers[member]
                    .path_and_reservations(search.step_of(goal, member), 0.0);
                Plan {
                    index,
                    path,
                    reservations,
                }
            })
            .collect();
        debug!("joint search created {} nodes", search.nodes.len());
        GroupResult {
            plans,
            expansions,
            timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::Physics;

    fn od() -> OperatorDecomposition {
        OperatorDecomposition {
            wait_step: 5.0,
            window: 30.0,
            max_node_count_per_agent: 100,
            use_final_reservations: false,
        }
    }

    #[test]
    fn test_single_agent_joint_search() {
        let graph = Graph::grid(4, 1, 1.0);
        let base = ReservationTable::strict(&graph);
        let agents = vec![Agent::new(0, 0, 3, Physics::default())];
        let mut rra = RraStarCache::new();

        let result = od().plan(&graph, &mut rra, &base, &agents, &[0], 0.0, Deadline::none());
        assert!(!result.timed_out);
        assert_eq!(result.plans.len(), 1);
        assert_eq!(result.plans[0].path.last_action().unwrap().node, 3);
    }

    #[test]
    fn test_joint_plans_do_not_overlap() {
        let graph = Graph::grid(3, 3, 1.0);
        let base = ReservationTable::strict(&graph);
        let agents = vec![
            Agent::new(0, 3, 5, Physics::default()),
            Agent::new(1, 1, 7, Physics::default()),
        ];
        let mut rra = RraStarCache::new();

        let result = od().plan(&graph, &mut rra, &base, &agents, &[0, 1], 0.0, Deadline::none());
        let mut table = ReservationTable::strict(&graph);
        for plan in &result.plans {
            assert!(table
                .try_add_all(&plan.reservations, Some(agents[plan.index].id), 0)
                .is_ok());
        }
    }

    #[test]
    fn test_members_that_cannot_stay_reject_the_joint_state() {
        let graph = Graph::grid(3, 1, 1.0);
        let agents = vec![
            Agent::new(0, 0, 2, Physics::default()),
            Agent::new(1, 2, 0, Physics::default()),
        ];
        let members = [0, 1];
        let search = JointSearch {
            members: &members,
            agents: &agents,
            steppers: agents
                .iter()
                .map(|agent| SpaceTimeAStar::new(agent, 0.0, 5.0, f64::INFINITY))
                .collect(),
            nodes: vec![OdNode {
                parent: None,
                member: None,
                step: 0,
                g: 0.0,
                h: 0.0,
            }],
        };

        // a member that has not moved yet stands on its node
        let base = ReservationTable::strict(&graph);
        let table = search.table_for(&base, 0, Some(0), 0.0, false).unwrap();
        assert!(!table.is_free(2, 50.0, 51.0));
        assert!(table.is_free(0, 0.0, 100.0));

        // someone else needs node 2 while agent 1 still stands there
        let mut base = ReservationTable::strict(&graph);
        base.try_add(&Interval::new(2, 1.0, 3.0), Some(7), 0).unwrap();
        assert!(search.table_for(&base, 0, Some(0), 0.0, false).is_none());
        assert!(search.table_for(&base, 0, Some(1), 0.0, false).is_some());
    }
}
