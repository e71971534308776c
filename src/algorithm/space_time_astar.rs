use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{instrument, trace};

use super::{Deadline, OpenEntry, ReverseResumableAStar, DEADLINE_POLL_INTERVAL};
use crate::common::{Agent, Path};
use crate::graph::{degree_to_rad, rad_to_degree, same_heading, Edge, Graph, NodeId};
use crate::physics::Physics;
use crate::reservation::{create_intervals, Collision, Interval, ReservationTable};

pub type StNodeId = usize;

/// Adjacent occupancy intervals closer than this are merged.
const MERGE_TOLERANCE: f64 = 1e-3;

/// A state of the time-expanded graph. States live in an arena and refer to
/// each other by index.
#[derive(Debug, Clone, Copy)]
struct StNode {
    node: NodeId,
    time: f64,
    parent: Option<StNodeId>,
    /// State where the current hop started. Wait and start states point to
    /// themselves.
    last_stop: StNodeId,
    /// Edge driven to reach this state, `None` for waits and the start.
    edge: Option<Edge>,
    /// Heading after arriving here.
    angle: i16,
}

/// A successor state and the occupancy of reaching it from its last stop.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: StNodeId,
    pub reservations: Vec<Interval>,
    /// Foreign reservations the step runs into, all tolerated by the caller.
    pub collisions: Vec<Collision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(StNodeId),
    /// The frontier ran empty.
    Exhausted,
    TimedOut,
}

/// Forward A* over (node, time) states that avoids reserved intervals, using
/// the agent's RRA* as heuristic.
#[derive(Debug, Clone)]
pub struct SpaceTimeAStar {
    physics: Physics,
    destination: NodeId,
    can_go_through_obstacles: bool,
    wait_step: f64,
    window_end: f64,

    /// Only accept goal states that can be held forever, and only wait once
    /// the window is exceeded.
    pub final_reservation: bool,
    /// Forces this many wait steps before the first move.
    pub wait_steps_before_start: usize,
    /// Extra cost per graph node, added to the heuristic.
    pub biased_cost: HashMap<NodeId, f64>,
    /// Expand each graph node only at strictly increasing times.
    pub tie_breaking: bool,
    /// States later than this are never generated, which bounds searches
    /// whose goal may stay blocked forever.
    pub time_limit: f64,

    nodes: Vec<StNode>,
    tie_breaking_times: HashMap<NodeId, f64>,
    open: BTreeSet<OpenEntry>,
    goal: Option<StNodeId>,
    expansions: usize,
}

impl SpaceTimeAStar {
    pub fn new(agent: &Agent, start_time: f64, wait_step: f64, window_end: f64) -> Self {
        let start = StNode {
            node: agent.next_node,
            time: start_time,
            parent: None,
            last_stop: 0,
            edge: None,
            angle: rad_to_degree(agent.orientation_at_next_node),
        };
        SpaceTimeAStar {
            physics: agent.physics,
            destination: agent.destination_node,
            can_go_through_obstacles: agent.can_go_through_obstacles,
            wait_step,
            window_end,
            final_reservation: false,
            wait_steps_before_start: 0,
            biased_cost: HashMap::new(),
            tie_breaking: true,
            time_limit: f64::INFINITY,
            nodes: vec![start],
            tie_breaking_times: HashMap::new(),
            open: BTreeSet::new(),
            goal: None,
            expansions: 0,
        }
    }

    pub fn start(&self) -> StNodeId {
        0
    }

    pub fn goal(&self) -> Option<StNodeId> {
        self.goal
    }

    pub fn expansions(&self) -> usize {
        self.expansions
    }

    pub fn window_end(&self) -> f64 {
        self.window_end
    }

    pub fn node_2d(&self, id: StNodeId) -> NodeId {
        self.nodes[id].node
    }

    pub fn time(&self, id: StNodeId) -> f64 {
        self.nodes[id].time
    }

    pub fn parent(&self, id: StNodeId) -> Option<StNodeId> {
        self.nodes[id].parent
    }

    pub fn angle(&self, id: StNodeId) -> i16 {
        self.nodes[id].angle
    }

    /// State where the hop ending in `id` started; waits are their own stop.
    pub fn last_stop(&self, id: StNodeId) -> StNodeId {
        self.nodes[id].last_stop
    }

    pub fn state_count(&self) -> usize {
        self.nodes.len()
    }

    /// Heuristic of a state: RRA* cost, turning towards the RRA* route and
    /// the node bias. Infinite if the destination is unreachable.
    pub fn heuristic(
        &self,
        graph: &Graph,
        rra: &mut ReverseResumableAStar,
        id: StNodeId,
    ) -> f64 {
        let node = self.nodes[id].node;
        if !rra.is_closed(node) && !rra.search(graph, node) {
            return f64::INFINITY;
        }
        let Some(g) = rra.g(node) else {
            return f64::INFINITY;
        };
        let turn = match rra.angle(node) {
            Some(angle) if node != rra.destination() => self.physics.time_to_turn(
                degree_to_rad(self.nodes[id].angle),
                degree_to_rad(angle),
            ),
            _ => 0.0,
        };
        g + turn + self.biased_cost.get(&node).copied().unwrap_or(0.0)
    }

    /// Graph nodes and distances of the hop from `from` to `to`, in driving
    /// order, starting at distance zero.
    fn checkpoint_distances(&self, from: StNodeId, to: StNodeId) -> (Vec<NodeId>, Vec<f64>) {
        let mut nodes = Vec::new();
        let mut distances = Vec::new();
        let mut drive_distance = 0.0;
        let mut current = to;

        while current != from {
            nodes.push(self.nodes[current].node);
            distances.push(drive_distance);
            drive_distance += self.nodes[current].edge.map_or(0.0, |edge| edge.distance);
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        nodes.push(self.nodes[current].node);
        distances.push(drive_distance);

        nodes.reverse();
        distances.reverse();
        for distance in distances.iter_mut() {
            *distance = drive_distance - *distance;
        }
        (nodes, distances)
    }

    fn push(&mut self, node: StNode) -> StNodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Wait state after `n`, if every collision of the wait is accepted.
    pub fn wait_state<F>(&mut self, table: &ReservationTable, n: StNodeId, accept: F) -> Option<Step>
    where
        F: Fn(&Collision) -> bool,
    {
        let current = self.nodes[n];
        let end = current.time + self.wait_step;
        let collisions = table.collisions(current.node, current.time, end);
        if !collisions.iter().all(accept) {
            return None;
        }
        let id = self.push(StNode {
            node: current.node,
            time: end,
            parent: Some(n),
            last_stop: self.nodes.len(),
            edge: None,
            angle: current.angle,
        });
        Some(Step {
            id,
            reservations: vec![Interval::new(current.node, current.time, end)],
            collisions,
        })
    }

    /// For every heading, the nearest stop after `n` whose drive only runs
    /// into accepted collisions. Driving straight on extends the current hop.
    fn hop_steps<F>(
        &mut self,
        graph: &Graph,
        table: &ReservationTable,
        n: StNodeId,
        accept: &F,
    ) -> Vec<Step>
    where
        F: Fn(&Collision) -> bool,
    {
        let current = self.nodes[n];
        let mut steps = Vec::new();

        for direction in graph.edges(current.node) {
            let (last_stop, mut checkpoint_nodes, mut checkpoint_distances) =
                if same_heading(direction.angle, current.angle) {
                    let last_stop = current.last_stop;
                    let (nodes, distances) = self.checkpoint_distances(last_stop, n);
                    (last_stop, nodes, distances)
                } else {
                    // turn at n
                    (n, vec![current.node], vec![0.0])
                };

            let stop = self.nodes[last_stop];
            let time_to_turn = self
                .physics
                .time_to_turn(degree_to_rad(stop.angle), degree_to_rad(direction.angle));
            let turn_collisions = if time_to_turn > 0.0 {
                table.collisions(stop.node, stop.time, stop.time + time_to_turn)
            } else {
                Vec::new()
            };
            if !turn_collisions.iter().all(accept) {
                continue;
            }
            let departure = stop.time + time_to_turn;

            let mut drive_distance = checkpoint_distances.last().copied().unwrap_or(0.0);
            let mut pending: Vec<StNode> = Vec::new();
            let mut backpointer = n;
            let mut node = current.node;

            while checkpoint_nodes.len() <= graph.node_count() {
                let Some(edge) = graph
                    .edges(node)
                    .iter()
                    .find(|edge| same_heading(edge.angle, direction.angle))
                else {
                    break;
                };
                if graph.is_blocked(edge.to, self.can_go_through_obstacles) {
                    break;
                }

                drive_distance += edge.distance;
                checkpoint_nodes.push(edge.to);
                checkpoint_distances.push(drive_distance);
                let times = self.physics.checkpoint_times(
                    0.0,
                    departure,
                    drive_distance,
                    &checkpoint_distances,
                );
                let arrival = times.last().copied().unwrap_or(departure);

                pending.push(StNode {
                    node: edge.to,
                    time: arrival,
                    parent: Some(backpointer),
                    last_stop,
                    edge: Some(*edge),
                    angle: edge.angle,
                });

                let mut collisions = table.checkpoint_collisions(&checkpoint_nodes, &times, false);
                if collisions.iter().all(accept) {
                    self.nodes.append(&mut pending);
                    collisions.extend(turn_collisions);
                    steps.push(Step {
                        id: self.nodes.len() - 1,
                        reservations: create_intervals(stop.time, &checkpoint_nodes, &times, false),
                        collisions,
                    });
                    break;
                }

                backpointer = self.nodes.len() + pending.len() - 1;
                node = edge.to;
            }
        }

        steps
    }

    /// Expands `n` for the search: a wait step if the node stays free, plus
    /// for every heading the nearest reachable stop whose drive is collision
    /// free.
    pub fn successors(
        &mut self,
        graph: &Graph,
        table: &ReservationTable,
        n: StNodeId,
    ) -> Vec<StNodeId> {
        let current = self.nodes[n];
        let reject = |_: &Collision| false;

        if self.tie_breaking {
            let last = self
                .tie_breaking_times
                .entry(current.node)
                .or_insert(f64::NEG_INFINITY);
            if current.time <= *last {
                return Vec::new();
            }
            *last = current.time;
        }

        let mut successors: Vec<StNodeId> =
            self.wait_state(table, n, reject).map(|step| step.id).into_iter().collect();

        if self.final_reservation && current.time >= self.window_end {
            return successors;
        }
        if self.wait_steps_before_start > 0 && !successors.is_empty() {
            self.wait_steps_before_start -= 1;
            return successors;
        }

        successors.extend(
            self.hop_steps(graph, table, n, &reject)
                .into_iter()
                .map(|step| step.id),
        );
        successors
    }

    /// Raw expansion of `n` without search bookkeeping, tolerating every
    /// collision `accept` agrees to.
    pub fn steps<F>(
        &mut self,
        graph: &Graph,
        table: &ReservationTable,
        n: StNodeId,
        accept: F,
    ) -> Vec<Step>
    where
        F: Fn(&Collision) -> bool,
    {
        let mut steps: Vec<Step> = self.wait_state(table, n, &accept).into_iter().collect();
        steps.extend(self.hop_steps(graph, table, n, &accept));
        steps
    }

    fn is_goal(&self, table: &ReservationTable, n: StNodeId) -> bool {
        let state = &self.nodes[n];
        (state.node == self.destination || state.time >= self.window_end)
            && (!self.final_reservation || table.is_free(state.node, state.time, f64::INFINITY))
    }

    /// Runs the search from the start state.
    #[instrument(skip_all, name = "space_time_a_star", fields(start = self.nodes[0].node, goal = self.destination), level = "debug")]
    pub fn search(
        &mut self,
        graph: &Graph,
        table: &ReservationTable,
        rra: &mut ReverseResumableAStar,
        deadline: Deadline,
    ) -> SearchOutcome {
        self.open.clear();
        self.goal = None;
        let h = self.heuristic(graph, rra, 0);
        self.open.insert(OpenEntry::with_g(self.nodes[0].time + h, self.nodes[0].time, 0));

        while let Some(current) = self.open.pop_first() {
            self.expansions += 1;
            if self.expansions % DEADLINE_POLL_INTERVAL == 0 && deadline.expired() {
                trace!("timed out after {} expansions", self.expansions);
                return SearchOutcome::TimedOut;
            }

            let n = current.id;
            for successor in self.successors(graph, table, n) {
                if self.nodes[successor].time > self.time_limit {
                    continue;
                }
                let h = self.heuristic(graph, rra, successor);
                if h.is_infinite() {
                    continue;
                }
                let g = self.nodes[successor].time;
                self.open.insert(OpenEntry::with_g(g + h, g, successor));
            }

            if self.is_goal(table, n) {
                trace!(
                    "found state {n} at node {} time {} after {} expansions",
                    self.nodes[n].node,
                    self.nodes[n].time,
                    self.expansions
                );
                self.goal = Some(n);
                return SearchOutcome::Found(n);
            }
        }

        SearchOutcome::Exhausted
    }

    /// Path and occupancy of the route to `goal`. Reconstruction stops early
    /// once the occupancy reaches back before `start_time`.
    pub fn path_and_reservations(&self, goal: StNodeId, start_time: f64) -> (Path, Vec<Interval>) {
        let mut path = Path::new();
        let mut reservations: VecDeque<Interval> = VecDeque::new();
        let mut n = goal;

        loop {
            let mut wait = 0.0;
            while n == self.nodes[n].last_stop && n != 0 {
                let Some(parent) = self.nodes[n].parent else {
                    break;
                };
                wait += self.nodes[n].time - self.nodes[parent].time;
                n = parent;
            }

            let state = self.nodes[n];
            if wait > 0.0 {
                reservations.push_front(Interval::new(state.node, state.time, state.time + wait));
            }
            path.add_first(state.node, true, wait);

            if n == 0 {
                break;
            }

            let last_stop = state.last_stop;
            let stop = self.nodes[last_stop];
            let (nodes, distances) = self.checkpoint_distances(last_stop, n);
            let time_to_turn = self
                .physics
                .time_to_turn(degree_to_rad(state.angle), degree_to_rad(stop.angle));
            let total = distances.last().copied().unwrap_or(0.0);
            let times = self
                .physics
                .checkpoint_times(0.0, stop.time + time_to_turn, total, &distances);

            let last = nodes.len() - 1;
            for i in (0..nodes.len()).rev() {
                let interval = if i == 0 {
                    // the stop itself is held through the turn
                    Interval::new(nodes[i], stop.time, times[(i + 1).min(last)])
                } else if i == last {
                    Interval::new(nodes[i], times[i - 1], times[i])
                } else {
                    Interval::new(nodes[i], times[i - 1], times[i + 1])
                };
                reservations.push_front(interval);

                if 0 < i && i < last {
                    path.add_first(nodes[i], false, 0.0);
                }
                if interval.start < start_time {
                    break;
                }
            }

            n = last_stop;
            if reservations.front().is_some_and(|interval| interval.start < start_time) {
                break;
            }
        }

        let mut reservations: Vec<Interval> = reservations.into();
        let mut i = reservations.len().saturating_sub(1);
        while i > 0 {
            i -= 1;
            let (current, next) = (reservations[i], reservations[i + 1]);
            if current.node == next.node && (current.end - next.start).abs() < MERGE_TOLERANCE {
                reservations[i].end = next.end;
                reservations.remove(i + 1);
            }
        }

        (path, reservations)
    }

    /// Path and occupancy of the route found by the last search.
    pub fn result(&self) -> Option<(Path, Vec<Interval>)> {
        self.goal.map(|goal| self.path_and_reservations(goal, 0.0))
    }
}
