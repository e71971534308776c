use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, trace};

use super::OpenEntry;
use crate::common::{Agent, AgentId, Path};
use crate::graph::{degree_to_rad, same_heading, Edge, Graph, NodeId};
use crate::physics::Physics;

/// Backward A* rooted at an agent's destination. The search can be resumed
/// towards new goals; every closed node knows its exact cost-to-destination
/// and the edge leading towards the destination.
#[derive(Debug, Clone)]
pub struct ReverseResumableAStar {
    destination: NodeId,
    goal: NodeId,
    physics: Physics,
    can_go_through_obstacles: bool,
    custom_locks: HashSet<NodeId>,
    /// Obstacles learned by the owning cache, tagged with its generation.
    obstacles: HashSet<NodeId>,
    obstacle_generation: u64,

    open: BTreeSet<OpenEntry>,
    open_keys: HashMap<NodeId, OpenEntry>,
    closed: HashSet<NodeId>,
    // `None` marks the destination itself
    backpointer: HashMap<NodeId, Option<Edge>>,
    g_values: HashMap<NodeId, f64>,
}

impl ReverseResumableAStar {
    pub fn new(agent: &Agent) -> Self {
        Self::with_locks(agent, HashSet::new())
    }

    pub fn with_locks(agent: &Agent, custom_locks: HashSet<NodeId>) -> Self {
        let destination = agent.destination_node;
        let mut rra = ReverseResumableAStar {
            destination,
            goal: destination,
            physics: agent.physics,
            can_go_through_obstacles: agent.can_go_through_obstacles,
            custom_locks,
            obstacles: HashSet::new(),
            obstacle_generation: 0,
            open: BTreeSet::new(),
            open_keys: HashMap::new(),
            closed: HashSet::new(),
            backpointer: HashMap::new(),
            g_values: HashMap::new(),
        };
        rra.reset();
        rra
    }

    /// Drops all search progress.
    pub fn reset(&mut self) {
        self.open.clear();
        self.open_keys.clear();
        self.closed.clear();
        self.backpointer.clear();
        self.g_values.clear();

        self.goal = self.destination;
        self.g_values.insert(self.destination, 0.0);
        self.backpointer.insert(self.destination, None);
        self.push_open(self.destination, 0.0, 0.0);
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn add_custom_lock(&mut self, node: NodeId) {
        self.custom_locks.insert(node);
    }

    /// Replaces the learned obstacles; the destination never counts as one.
    /// Returns whether the search so far is invalid: an obstacle was freed
    /// or a new one lies in the expanded region.
    fn set_obstacles(&mut self, obstacles: &HashSet<NodeId>, generation: u64) -> bool {
        let obstacles: HashSet<NodeId> = obstacles
            .iter()
            .copied()
            .filter(|&node| node != self.destination)
            .collect();
        let freed = !self.obstacles.is_subset(&obstacles);
        let hit = obstacles.difference(&self.obstacles).any(|node| {
            self.closed.contains(node) || self.open_keys.contains_key(node)
        });
        self.obstacles = obstacles;
        self.obstacle_generation = generation;
        freed || hit
    }

    pub fn is_closed(&self, node: NodeId) -> bool {
        self.closed.contains(&node)
    }

    /// Exact travel time from a closed node to the destination.
    pub fn g(&self, node: NodeId) -> Option<f64> {
        self.g_values.get(&node).copied()
    }

    fn h(&self, graph: &Graph, node: NodeId) -> f64 {
        self.physics
            .time_to_move(0.0, graph.distance(node, self.goal))
    }

    fn is_blocked(&self, graph: &Graph, node: NodeId) -> bool {
        self.custom_locks.contains(&node)
            || self.obstacles.contains(&node)
            || graph.is_blocked(node, self.can_go_through_obstacles)
    }

    fn push_open(&mut self, node: NodeId, f: f64, g: f64) {
        if let Some(old) = self.open_keys.remove(&node) {
            self.open.remove(&old);
        }
        let entry = OpenEntry::with_g(f, g, node);
        self.open.insert(entry);
        self.open_keys.insert(node, entry);
    }

    /// Cost of reaching `node` via `edge` into the hop that ends at `parent`.
    /// A hop is the longest straight drive without turning.
    fn g_prime(&self, parent: NodeId, node: NodeId, edge: &Edge) -> f64 {
        if node == self.destination {
            return 0.0;
        }

        let mut hop_distance = edge.distance;
        let mut last_turn = parent;
        while let Some(Some(previous)) = self.backpointer.get(&last_turn) {
            if !same_heading(previous.angle, edge.angle) {
                break;
            }
            hop_distance += previous.distance;
            last_turn = previous.to;
        }

        // any orientation is fine when stopping at the destination
        let angle_at_turn = match self.backpointer.get(&last_turn) {
            Some(Some(previous)) => previous.angle,
            _ => edge.angle,
        };
        let g_last_turn = self.g_values.get(&last_turn).copied().unwrap_or(0.0);

        g_last_turn
            + self
                .physics
                .time_to_turn(degree_to_rad(angle_at_turn), degree_to_rad(edge.angle))
            + self
                .physics
                .time_to_move(self.physics.max_speed, hop_distance)
    }

    /// Resumes the backward search until `goal` is closed.
    pub fn search(&mut self, graph: &Graph, goal: NodeId) -> bool {
        if self.closed.contains(&goal) {
            return true;
        }
        if self.is_blocked(graph, self.destination) {
            return false;
        }

        if self.goal != goal {
            self.goal = goal;
            let keys: Vec<NodeId> = self.open_keys.keys().copied().collect();
            for node in keys {
                let g = self.g_values.get(&node).copied().unwrap_or(0.0);
                let f = g + self.h(graph, node);
                self.push_open(node, f, g);
            }
        }

        while let Some(current) = self.open.pop_first() {
            let n = current.id;
            self.open_keys.remove(&n);
            self.closed.insert(n);

            for edge in graph.backward_edges(n) {
                let successor = edge.from;
                if self.is_blocked(graph, successor) && successor != goal {
                    continue;
                }
                let g = self.g_prime(n, successor, edge);
                let h = self.h(graph, successor);
                if h.is_infinite() {
                    continue;
                }

                let in_open = self.open_keys.get(&successor).copied();
                let improves = match in_open {
                    Some(entry) => entry.f > g + h,
                    None => !self.closed.contains(&successor),
                };
                if improves {
                    self.push_open(successor, g + h, g);
                    self.backpointer.insert(successor, Some(*edge));
                    self.g_values.insert(successor, g);
                }
            }

            if n == goal {
                trace!(
                    "rra* {} -> {goal}: closed {} nodes",
                    self.destination,
                    self.closed.len()
                );
                return true;
            }
        }

        debug!("rra* {} cannot reach {goal}", self.destination);
        false
    }

    /// Heading of the first edge leaving `node` towards the destination.
    pub fn angle(&self, node: NodeId) -> Option<i16> {
        self.backpointer
            .get(&node)
            .copied()
            .flatten()
            .map(|edge| edge.angle)
    }

    fn next_edge(&self, node: NodeId) -> Option<Edge> {
        self.backpointer.get(&node).copied().flatten()
    }

    /// `node` followed by the nodes of the straight hop starting there.
    pub fn next_nodes_until_turn(&self, node: NodeId) -> Vec<NodeId> {
        let Some(first) = self.next_edge(node) else {
            return Vec::new();
        };
        let mut nodes = vec![node];
        let mut current = node;
        while let Some(edge) = self.next_edge(current) {
            if !same_heading(first.angle, edge.angle) {
                break;
            }
            current = edge.to;
            nodes.push(current);
        }
        nodes
    }

    /// Whether the known route from `node` crosses a node that is blocked now.
    pub fn path_contains_blocked(&self, graph: &Graph, node: NodeId) -> bool {
        if self.is_blocked(graph, node) {
            return true;
        }
        let mut current = node;
        while let Some(edge) = self.next_edge(current) {
            current = edge.to;
            if self.is_blocked(graph, current) {
                return true;
            }
        }
        false
    }

    /// Nodes after `node` up to and including the destination.
    pub fn path_as_node_list(&self, node: NodeId) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        let mut current = node;
        while let Some(edge) = self.next_edge(current) {
            current = edge.to;
            nodes.push(current);
        }
        nodes
    }

    /// Appends the remaining hops from `start` to the destination, stopping
    /// where the agent has to turn. The stop at `start` is kept: callers only
    /// reserve up to there.
    pub fn append_path(&self, path: &mut Path, start: NodeId) {
        let mut current = start;
        while self.closed.contains(&current) && current != self.destination {
            let hop = self.next_nodes_until_turn(current);
            let Some(&last) = hop.last() else {
                break;
            };
            for (i, &node) in hop.iter().enumerate().skip(1) {
                path.add_last(node, i == hop.len() - 1, 0.0);
            }
            current = last;
        }
    }
}

/// One persistent backward search per agent, kept across planning cycles.
#[derive(Debug, Clone, Default)]
pub struct RraStarCache {
    searches: HashMap<AgentId, ReverseResumableAStar>,
    obstacles: HashSet<NodeId>,
    generation: u64,
}

impl RraStarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes that are impassable from now on, such as the positions of fixed
    /// agents. Replaces what was learned before.
    pub fn learn_obstacles(&mut self, obstacles: HashSet<NodeId>) {
        if obstacles != self.obstacles {
            debug!("learned obstacles {obstacles:?}");
            self.obstacles = obstacles;
            self.generation += 1;
        }
    }

    pub fn obstacles(&self) -> &HashSet<NodeId> {
        &self.obstacles
    }

    /// The agent's search, rebuilt when its destination moved, when a node on
    /// the known route became blocked, or when `reset` is requested.
    pub fn get(&mut self, graph: &Graph, agent: &Agent, reset: bool) -> &mut ReverseResumableAStar {
        let rra = self
            .searches
            .entry(agent.id)
            .or_insert_with(|| ReverseResumableAStar::new(agent));
        let outdated = rra.obstacle_generation != self.generation
            && rra.set_obstacles(&self.obstacles, self.generation);

        let stale = reset
            || outdated
            || rra.destination() != agent.destination_node
            || (rra.is_closed(agent.next_node) && rra.path_contains_blocked(graph, agent.next_node));
        if stale {
            trace!("rebuilding rra* of agent {}", agent.id);
            *rra = ReverseResumableAStar::new(agent);
            let _ = rra.set_obstacles(&self.obstacles, self.generation);
        }
        rra
    }

    pub fn invalidate(&mut self, agent: AgentId) {
        self.searches.remove(&agent);
    }

    pub fn len(&self) -> usize {
        self.searches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.searches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::Physics;

    fn agent(next: NodeId, destination: NodeId) -> Agent {
        Agent::new(0, next, destination, Physics::new(1.0, 1.0, 1.0, 4.0))
    }

    #[test]
    fn test_search_straight_line() {
        let graph = Graph::grid(4, 1, 1.0);
        let mut rra = ReverseResumableAStar::new(&agent(0, 3));

        assert!(rra.search(&graph, 0));
        assert!(rra.is_closed(0));
        // one hop of 3 starting at full speed: brake over 3 takes 3.5
        assert!((rra.g(0).unwrap() - 3.5).abs() < 1e-9);
        assert_eq!(rra.angle(0), Some(0));
        assert_eq!(rra.angle(3), None);
        assert_eq!(rra.next_nodes_until_turn(0), vec![0, 1, 2, 3]);
        assert_eq!(rra.path_as_node_list(1), vec![2, 3]);

        // resumed search for a closed node answers immediately
        assert!(rra.search(&graph, 1));
    }

    #[test]
    fn test_turn_costs() {
        let graph = Graph::grid(3, 3, 1.0);
        let mut rra = ReverseResumableAStar::new(&agent(0, 8));
        assert!(rra.search(&graph, 0));
        let hops = rra.next_nodes_until_turn(0);
        assert_eq!(hops.len(), 3);

        // two hops of length 2 plus one quarter turn
        let hop = Physics::new(1.0, 1.0, 1.0, 4.0).time_to_move(1.0, 2.0);
        assert!((rra.g(0).unwrap() - (2.0 * hop + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_blocked_nodes() {
        let mut graph = Graph::grid(3, 1, 1.0);
        let mut rra = ReverseResumableAStar::new(&agent(0, 2));
        rra.add_custom_lock(1);
        assert!(!rra.search(&graph, 0));

        let mut rra = ReverseResumableAStar::new(&agent(0, 2));
        assert!(rra.search(&graph, 0));
        assert!(!rra.path_contains_blocked(&graph, 0));
        graph.set_locked(1, true);
        assert!(rra.path_contains_blocked(&graph, 0));
    }

    #[test]
    fn test_append_path() {
        let graph = Graph::grid(3, 3, 1.0);
        let mut rra = ReverseResumableAStar::new(&agent(0, 8));
        assert!(rra.search(&graph, 0));

        let mut path = Path::new();
        path.add_last(0, true, 0.0);
        rra.append_path(&mut path, 0);

        assert_eq!(path.len(), 5);
        assert_eq!(path.last_action().unwrap().node, 8);
        assert!(path.is_consistent());
        assert!(path.is_contiguous(&graph));
        let stops = path.actions().filter(|action| action.stop_at_node).count();
        assert_eq!(stops, 3);
    }

    #[test]
    fn test_cache_resets_on_destination_change() {
        let graph = Graph::grid(3, 1, 1.0);
        let mut cache = RraStarCache::new();
        let mut agent = agent(0, 2);

        assert!(cache.get(&graph, &agent, false).search(&graph, 0));
        assert!(cache.get(&graph, &agent, false).is_closed(0));

        agent.destination_node = 1;
        let rra = cache.get(&graph, &agent, false);
        assert_eq!(rra.destination(), 1);
        assert!(!rra.is_closed(0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_rebuilds_around_learned_obstacles() {
        let graph = Graph::grid(3, 2, 1.0);
        let mut cache = RraStarCache::new();
        let agent = agent(0, 2);
        assert!(cache.get(&graph, &agent, false).search(&graph, 0));
        assert_eq!(cache.get(&graph, &agent, false).path_as_node_list(0), vec![1, 2]);

        cache.learn_obstacles(HashSet::from([1]));
        let rra = cache.get(&graph, &agent, false);
        assert!(!rra.is_closed(0));
        assert!(rra.search(&graph, 0));
        assert_eq!(rra.path_as_node_list(0), vec![3, 4, 5, 2]);

        // freeing node 1 brings the short route back; a destination never blocks
        cache.learn_obstacles(HashSet::from([2]));
        let rra = cache.get(&graph, &agent, false);
        assert!(rra.search(&graph, 0));
        assert_eq!(rra.path_as_node_list(0), vec![1, 2]);
    }

    #[test]
    fn test_obstacle_outside_the_expanded_region_keeps_the_search() {
        let graph = Graph::grid(5, 1, 1.0);
        let mut cache = RraStarCache::new();
        let agent = agent(2, 3);
        assert!(cache.get(&graph, &agent, false).search(&graph, 2));

        cache.learn_obstacles(HashSet::from([0]));
        assert!(cache.get(&graph, &agent, false).is_closed(2));
        assert_eq!(cache.obstacles(), &HashSet::from([0]));
    }
}
