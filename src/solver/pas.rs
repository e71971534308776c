use std::collections::BTreeSet;

use tracing::{debug, instrument, trace};

use super::comm::{
    block_agents, block_static, commit_plans, hold, planned_indices, release_hold, start_time,
    Plan, PlannerCore,
};
use super::{PathFinder, PlanningOutcome};
use crate::algorithm::{OpenEntry, SpaceTimeAStar, StNodeId, Step};
use crate::common::{Agent, AgentId};
use crate::communicator::Communicator;
use crate::config::PlannerConfig;
use crate::graph::Graph;
use crate::reservation::{Collision, Interval, ReservationTable, TOLERANCE};
use crate::stat::Stats;

/// Share of the budget after which simulation stops.
const SIMULATION_FRACTION: f64 = 0.9;

/// One agent's simulated progress through its own time-expanded graph.
struct Stepper {
    index: usize,
    id: AgentId,
    search: SpaceTimeAStar,
    node: StNodeId,
    reservations: Vec<Interval>,
    priority: i32,
    final_hold: Option<Interval>,
    done: bool,
}

impl Stepper {
    fn time(&self) -> f64 {
        self.search.time(self.node)
    }

    fn accepts(&self, collision: &Collision) -> bool {
        collision.priority < self.priority || collision.owner == Some(self.id)
    }
}

/// Parallel agent search. All agents advance in simulated time one action at
/// a time, the earliest one first. An action may overrule reservations of
/// lower priority, whose owners are rewound to before the conflict. An agent
/// without any action raises its priority and waits.
pub struct PAS<'a> {
    core: PlannerCore<'a>,
    table: ReservationTable,
    steppers: Vec<Stepper>,
    queue: BTreeSet<OpenEntry>,
}

impl<'a> PAS<'a> {
    pub fn new(graph: &'a Graph, config: &PlannerConfig, communicator: Box<dyn Communicator>) -> Self {
        PAS {
            core: PlannerCore::new(graph, config, communicator),
            table: ReservationTable::priority_aware(graph),
            steppers: Vec::new(),
            queue: BTreeSet::new(),
        }
    }

    fn static_priority(&self) -> i32 {
        self.core.config.pas.max_priorities + 1
    }

    fn enqueue(&mut self, stepper: usize) {
        let time = self.steppers[stepper].time();
        self.queue.insert(OpenEntry::new(time, stepper));
    }

    fn dequeue(&mut self, stepper: usize) {
        self.queue.retain(|entry| entry.id != stepper);
    }

    /// Rewinds a stepper until it is no later than `time`, dropping the
    /// reservations of everything undone.
    fn roll_back(&mut self, stepper: usize, time: f64) {
        let was_done = self.steppers[stepper].done;
        let state = &mut self.steppers[stepper];
        if let Some(hold) = state.final_hold.take() {
            self.table.remove(&hold);
        }
        state.done = false;

        while state.search.time(state.node) > time {
            let node = state.node;
            let previous = if state.search.last_stop(node) != node {
                Some(state.search.last_stop(node))
            } else {
                state.search.parent(node)
            };
            let Some(previous) = previous else {
                for reservation in state.reservations.drain(..) {
                    self.table.remove(&reservation);
                }
                break;
            };
            let previous_time = state.search.time(previous);
            while state
                .reservations
                .last()
                .is_some_and(|reservation| reservation.start >= previous_time)
            {
                if let Some(reservation) = state.reservations.pop() {
                    self.table.remove(&reservation);
                }
            }
            state.node = previous;
        }
        trace!("agent {} rewound to {}", state.id, state.search.time(state.node));

        if !was_done {
            self.dequeue(stepper);
        }
        self.enqueue(stepper);
    }

    fn roll_back_owners(&mut self, current: usize, collisions: &[Collision]) {
        for collision in collisions {
            let Some(owner) = collision.owner else {
                continue;
            };
            if owner == self.steppers[current].id {
                continue;
            }
            if let Some(other) = self.steppers.iter().position(|stepper| stepper.id == owner) {
                self.roll_back(other, collision.time);
            }
        }
    }

    /// Drops the stepper's own reservations from the hop start on, so the
    /// action replacing them can be reserved.
    fn drop_own_from(&mut self, current: usize, time: f64) {
        let state = &mut self.steppers[current];
        while state
            .reservations
            .last()
            .is_some_and(|reservation| reservation.start >= time - TOLERANCE)
        {
            if let Some(reservation) = state.reservations.pop() {
                self.table.remove(&reservation);
            }
        }
    }

    /// Candidate actions of the stepper, cheapest first.
    fn ranked_actions(&mut self, agents: &[Agent], current: usize) -> Vec<Step> {
        let graph = self.core.graph;
        let state = &mut self.steppers[current];
        let node = state.node;
        let priority = state.priority;
        let id = state.id;
        let steps = state.search.steps(graph, &self.table, node, |collision: &Collision| {
            collision.priority < priority || collision.owner == Some(id)
        });

        let agent = &agents[state.index];
        let rra = self.core.rra.get(graph, agent, false);
        let mut ranked: Vec<(f64, Step)> = steps
            .into_iter()
            .map(|step| {
                let h = state.search.heuristic(graph, rra, step.id);
                (h, step)
            })
            .collect();

        // nothing leads to the destination: head roughly towards it instead
        if ranked.len() > 1 && ranked.iter().all(|(h, _)| h.is_infinite()) {
            for (h, step) in ranked.iter_mut() {
                let distance = graph.distance(state.search.node_2d(step.id), agent.destination_node);
                *h = agent.physics.time_to_move(0.0, distance);
            }
        }
        ranked.sort_by(|a, b| {
            let f = |(h, step): &(f64, Step)| state.search.time(step.id) + h;
            f(a).total_cmp(&f(b))
        });
        ranked.into_iter().map(|(_, step)| step).collect()
    }

    /// Advances the stepper by one action. Returns whether it moved on
    /// without raising its priority.
    fn advance(&mut self, agents: &[Agent], current: usize) -> bool {
        for step in self.ranked_actions(agents, current) {
            let state = &self.steppers[current];
            if !step.collisions.iter().all(|collision| state.accepts(collision)) {
                continue;
            }
            if !step.collisions.is_empty() {
                let hop_start = state.search.time(state.search.last_stop(step.id));
                self.drop_own_from(current, hop_start);
                self.roll_back_owners(current, &step.collisions);
            }

            let state = &mut self.steppers[current];
            if let Err(err) = self
                .table
                .try_add_all(&step.reservations, Some(state.id), state.priority)
            {
                trace!("agent {} action rejected: {err}", state.id);
                if !step.collisions.is_empty() {
                    // own reservations from the hop start are gone
                    state.node = state.search.last_stop(step.id);
                    return false;
                }
                continue;
            }
            state.reservations.extend_from_slice(&step.reservations);
            state.node = step.id;
            state.priority = 0;

            let destination = agents[state.index].destination_node;
            if state.search.node_2d(step.id) == destination {
                state.done = true;
                let arrival = state.search.time(step.id);
                let final_hold = Interval::permanent(destination, arrival);
                let static_priority = self.core.config.pas.max_priorities + 1;
                if self.table.interval_free(&final_hold)
                    && self
                        .table
                        .try_add(&final_hold, Some(state.id), static_priority)
                        .is_ok()
                {
                    state.final_hold = Some(final_hold);
                }
                self.dequeue(current);
            } else {
                self.dequeue(current);
                self.enqueue(current);
            }
            return true;
        }
        false
    }

    /// No action fits: raise the priority and wait, overruling lower
    /// priorities while the priority is below the maximum.
    fn wait_instead(&mut self, current: usize) {
        let max_priorities = self.core.config.pas.max_priorities;
        let state = &mut self.steppers[current];
        state.priority += 1;
        let node = state.node;
        let Some(wait) = state.search.wait_state(&self.table, node, |_: &Collision| true) else {
            return;
        };

        if state.priority < max_priorities {
            let priority = state.priority;
            if !wait.collisions.iter().all(|collision| collision.priority < priority) {
                return;
            }
            self.roll_back_owners(current, &wait.collisions);
            let state = &mut self.steppers[current];
            match self
                .table
                .try_add_all(&wait.reservations, Some(state.id), state.priority)
            {
                Ok(_) => state.reservations.extend_from_slice(&wait.reservations),
                Err(err) => {
                    trace!("agent {} wait rejected: {err}", state.id);
                    return;
                }
            }
            state.node = wait.id;
        } else {
            // give up on reserving and start over at the lowest priority
            state.priority = 0;
            state.node = wait.id;
        }
        self.dequeue(current);
        self.enqueue(current);
    }

    #[instrument(skip_all, name = "pas_simulate", level = "debug")]
    fn simulate(&mut self, agents: &[Agent], cancel_at: f64, exceeded: impl Fn() -> bool) -> bool {
        while let Some(first) = self.queue.first().copied() {
            if exceeded() {
                return false;
            }
            if cancel_at <= first.f {
                break;
            }
            let current = first.id;
            self.core.stats.high_level_expand_nodes += 1;
            if !self.advance(agents, current) {
                self.wait_instead(current);
            }
        }
        true
    }
}

impl PathFinder for PAS<'_> {
    fn find_paths(&mut self, current_time: f64, agents: &mut [Agent]) -> PlanningOutcome {
        let budget = self.core.begin_cycle(current_time, agents);
        let graph = self.core.graph;
        let static_priority = self.static_priority();
        let order = planned_indices(agents);
        self.core.stats.planned_agents += order.len();

        self.table.clear();
        block_static(&mut self.table, agents, current_time, static_priority);

        let mut full = ReservationTable::strict(graph);
        block_agents(&mut full, agents, current_time, 0);
        let mut searching = Vec::new();
        for &index in &order {
            let agent = &mut agents[index];
            if self.core.is_in_deadlock(agent, current_time) {
                release_hold(&mut full, agent, current_time);
                if let Some(hop) = self
                    .core
                    .break_deadlock(agent, &mut full, current_time, true, true)
                {
                    for err in self.table.add_each(&hop, Some(agent.id), static_priority) {
                        debug!("agent {} hop reservation skipped: {err}", agent.id);
                    }
                    continue;
                }
                for err in full.add_each(&[hold(agent, current_time)], Some(agent.id), 0) {
                    debug!("agent {} hold skipped: {err}", agent.id);
                }
            }

            let rra = self.core.rra.get(graph, agent, false);
            if !rra.is_closed(agent.next_node) && !rra.search(graph, agent.next_node) {
                debug!("agent {} cannot reach its destination", agent.id);
                let stay = [hold(agent, current_time)];
                for err in self.table.add_each(&stay, Some(agent.id), static_priority) {
                    debug!("agent {} hold skipped: {err}", agent.id);
                }
                self.core.wait(agent);
                continue;
            }
            searching.push(index);
        }

        self.steppers.clear();
        self.queue.clear();
        for &index in &searching {
            let agent = &agents[index];
            let mut search = SpaceTimeAStar::new(
                agent,
                start_time(agent, current_time),
                self.core.config.wait_step,
                f64::INFINITY,
            );
            search.tie_breaking = false;
            self.steppers.push(Stepper {
                index,
                id: agent.id,
                search,
                node: 0,
                reservations: Vec::new(),
                priority: 0,
                final_hold: None,
                done: false,
            });
            self.enqueue(self.steppers.len() - 1);
        }

        let cancel_at = current_time + self.core.config.pas.window;
        let finished = self.simulate(agents, cancel_at, || budget.used(SIMULATION_FRACTION));
        if !finished {
            self.core.signal_timeout();
        }

        let mut plans = Vec::with_capacity(self.steppers.len());
        for stepper in &self.steppers {
            let agent = &agents[stepper.index];
            let (mut path, reservations) = stepper.search.path_and_reservations(stepper.node, 0.0);
            self.core.stats.low_level_expand_nodes += stepper.search.state_count();
            let rra = self.core.rra.get(graph, agent, false);
            rra.append_path(&mut path, stepper.search.node_2d(stepper.node));
            plans.push(Plan {
                index: stepper.index,
                path,
                reservations,
            });
        }

        let mut base = ReservationTable::strict(graph);
        block_static(&mut base, agents, current_time, 0);
        for reservation in self.table.iter() {
            if reservation.priority == static_priority
                && !searching.iter().any(|&i| Some(agents[i].id) == reservation.owner)
            {
                if let Err(err) = base.try_add(&reservation.interval, reservation.owner, 0) {
                    trace!("static reservation skipped: {err}");
                }
            }
        }
        commit_plans(&mut self.core, &base, agents, current_time, plans);

        self.core.end_cycle(&budget)
    }

    fn name(&self) -> &'static str {
        "PAS"
    }

    fn stats(&self) -> &Stats {
        &self.core.stats
    }
}
