use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{instrument, trace};

use super::OpenEntry;
use crate::common::{Agent, Path};
use crate::graph::{degree_to_rad, rad_to_degree, same_heading, Edge, Graph, NodeId};
use crate::physics::Physics;
use crate::reservation::{create_intervals, Interval};

/// Time-agnostic A* with hop and turn aware costs. Node costs can be biased
/// to steer the agent away from contested nodes.
#[derive(Debug, Clone)]
pub struct SpaceAStar {
    start: NodeId,
    goal: NodeId,
    start_angle: i16,
    physics: Physics,
    can_go_through_obstacles: bool,

    open: BTreeSet<OpenEntry>,
    open_keys: HashMap<NodeId, OpenEntry>,
    closed: HashSet<NodeId>,
    backpointer: HashMap<NodeId, Option<Edge>>,
    g_values: HashMap<NodeId, f64>,
}

impl SpaceAStar {
    pub fn new(agent: &Agent) -> Self {
        SpaceAStar {
            start: agent.next_node,
            goal: agent.destination_node,
            start_angle: rad_to_degree(agent.orientation_at_next_node),
            physics: agent.physics,
            can_go_through_obstacles: agent.can_go_through_obstacles,
            open: BTreeSet::new(),
            open_keys: HashMap::new(),
            closed: HashSet::new(),
            backpointer: HashMap::new(),
            g_values: HashMap::new(),
        }
    }

    fn h(&self, graph: &Graph, biased_cost: &HashMap<NodeId, f64>, node: NodeId) -> f64 {
        let bias = biased_cost.get(&node).copied().unwrap_or(0.0);
        self.physics
            .time_to_move(0.0, graph.distance(node, self.goal) + bias)
    }

    fn g_prime(&self, parent: NodeId, node: NodeId, edge: &Edge) -> f64 {
        if node == self.start {
            return 0.0;
        }
        let mut hop_distance = edge.distance;
        let mut last_turn = parent;
        while let Some(Some(previous)) = self.backpointer.get(&last_turn) {
            if !same_heading(previous.angle, edge.angle) {
                break;
            }
            hop_distance += previous.distance;
            last_turn = previous.from;
        }
        let angle = match self.backpointer.get(&last_turn) {
            Some(Some(previous)) => previous.angle,
            _ => self.start_angle,
        };
        self.g_values.get(&last_turn).copied().unwrap_or(0.0)
            + self
                .physics
                .time_to_turn(degree_to_rad(angle), degree_to_rad(edge.angle))
            + self.physics.time_to_move(0.0, hop_distance)
    }

    fn push_open(&mut self, node: NodeId, f: f64, g: f64) {
        if let Some(old) = self.open_keys.remove(&node) {
            self.open.remove(&old);
        }
        let entry = OpenEntry::with_g(f, g, node);
        self.open.insert(entry);
        self.open_keys.insert(node, entry);
    }

    #[instrument(skip_all, name = "space_a_star", fields(start = self.start, goal = self.goal), level = "debug")]
    pub fn search(&mut self, graph: &Graph, biased_cost: &HashMap<NodeId, f64>) -> bool {
        self.open.clear();
        self.open_keys.clear();
        self.closed.clear();
        self.backpointer.clear();
        self.g_values.clear();

        self.backpointer.insert(self.start, None);
        self.g_values.insert(self.start, 0.0);
        let h = self.h(graph, biased_cost, self.start);
        self.push_open(self.start, h, 0.0);

        while let Some(current) = self.open.pop_first() {
            let n = current.id;
            self.open_keys.remove(&n);
            self.closed.insert(n);

            for edge in graph.edges(n) {
                let successor = edge.to;
                if graph.is_blocked(successor, self.can_go_through_obstacles) {
                    continue;
                }
                let g = self.g_prime(n, successor, edge);
                let h = self.h(graph, biased_cost, successor);
                let improves = match self.open_keys.get(&successor) {
                    Some(entry) => entry.f > g + h,
                    None => !self.closed.contains(&successor),
                };
                if improves {
                    self.push_open(successor, g + h, g);
                    self.backpointer.insert(successor, Some(*edge));
                    self.g_values.insert(successor, g);
                }
            }

            if n == self.goal {
                trace!("closed {} nodes", self.closed.len());
                return true;
            }
        }
        false
    }

    /// Route of the last successful search as a path with stops at every
    /// turn, plus its occupancy when leaving at `start_time`.
    pub fn reservations_and_path(&self, start_time: f64) -> (Path, Vec<Interval>) {
        let mut edges = Vec::new();
        let mut current = self.goal;
        while let Some(Some(edge)) = self.backpointer.get(&current) {
            edges.push(*edge);
            current = edge.from;
        }
        edges.reverse();

        let mut path = Path::new();
        let mut reservations = Vec::new();
        let mut time = start_time;
        let mut angle = self.start_angle;
        let mut index = 0;

        while index < edges.len() {
            let mut checkpoint_nodes = vec![edges[index].from];
            let mut checkpoint_distances = vec![0.0];
            let mut distance = 0.0;
            while index < edges.len() && same_heading(edges[index].angle, angle) {
                distance += edges[index].distance;
                checkpoint_nodes.push(edges[index].to);
                checkpoint_distances.push(distance);
                index += 1;
            }

            // the last checkpoint starts the next hop
            for (i, &node) in checkpoint_nodes[..checkpoint_nodes.len() - 1].iter().enumerate() {
                path.add_last(node, i == 0, 0.0);
            }

            if checkpoint_nodes.len() > 1 {
                let times =
                    self.physics
                        .checkpoint_times(0.0, time, distance, &checkpoint_distances);
                reservations.extend(create_intervals(
                    times[0],
                    &checkpoint_nodes,
                    &times,
                    false,
                ));
                time = times.last().copied().unwrap_or(time);
            }

            if index < edges.len() {
                let next = edges[index];
                let time_to_turn = self
                    .physics
                    .time_to_turn(degree_to_rad(angle), degree_to_rad(next.angle));
                angle = next.angle;
                reservations.push(Interval::new(next.from, time, time + time_to_turn));
                time += time_to_turn;
            }
        }

        path.add_last(self.goal, true, 0.0);
        (path, reservations)
    }
}
