use std::f64::consts::PI;
use std::fs;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MapfError, MapfResult};

pub type NodeId = usize;

const PI2: f64 = PI * 2.0;

/// Angles are considered the same heading below this difference (degrees).
pub const SAME_HEADING_TOLERANCE: i16 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Permanently blocked for every agent.
    pub is_locked: bool,
    /// Blocked unless the agent may go through obstacles.
    pub is_obstacle: bool,
}

/// Directed edge. `angle` is the heading in whole degrees within [0, 360).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub distance: f64,
    pub angle: i16,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    positions: Vec<(f64, f64)>,
    node_info: Vec<NodeInfo>,
    edges: Vec<Vec<Edge>>,
    backward_edges: Vec<Vec<Edge>>,
    grid: Option<(usize, usize)>,
}

pub fn degree_to_rad(degree: i16) -> f64 {
    let rad = degree as f64 * PI2 / 360.0;
    (rad + PI2) % PI2
}

pub fn rad_to_degree(rad: f64) -> i16 {
    let degree = (rad * 360.0 / PI2).round() as i64;
    (((degree % 360) + 360) % 360) as i16
}

/// Smallest absolute difference between two headings in degrees.
pub fn angle_difference(a: i16, b: i16) -> i16 {
    let diff = (a as i32 - b as i32).rem_euclid(360);
    diff.min(360 - diff) as i16
}

pub fn same_heading(a: i16, b: i16) -> bool {
    angle_difference(a, b) < SAME_HEADING_TOLERANCE
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, x: f64, y: f64) -> NodeId {
        self.positions.push((x, y));
        self.node_info.push(NodeInfo::default());
        self.edges.push(Vec::new());
        self.backward_edges.push(Vec::new());
        self.positions.len() - 1
    }

    /// Adds a directed edge; distance and heading derive from node positions.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> MapfResult<()> {
        if from >= self.node_count() {
            return Err(MapfError::UnknownNode(from));
        }
        if to >= self.node_count() {
            return Err(MapfError::UnknownNode(to));
        }
        let (fx, fy) = self.positions[from];
        let (tx, ty) = self.positions[to];
        let edge = Edge {
            from,
            to,
            distance: self.distance(from, to),
            angle: rad_to_degree((ty - fy).atan2(tx - fx)),
        };
        self.edges[from].push(edge);
        self.backward_edges[to].push(edge);
        Ok(())
    }

    pub fn add_bidirectional_edge(&mut self, a: NodeId, b: NodeId) -> MapfResult<()> {
        self.add_edge(a, b)?;
        self.add_edge(b, a)
    }

    /// 4-connected grid, node id = y * width + x.
    pub fn grid(width: usize, height: usize, spacing: f64) -> Self {
        let passable = vec![vec![b'.'; width]; height];
        Self::from_cells(width, height, spacing, &passable)
    }

    fn from_cells(width: usize, height: usize, spacing: f64, cells: &[Vec<u8>]) -> Self {
        let mut graph = Graph::new();
        for y in 0..height {
            for x in 0..width {
                let node = graph.add_node(x as f64 * spacing, y as f64 * spacing);
                match cells[y][x] {
                    b'.' | b'G' | b'S' => {}
                    b'o' | b'O' => graph.node_info[node].is_obstacle = true,
                    _ => graph.node_info[node].is_locked = true,
                }
            }
        }
        graph.grid = Some((width, height));

        let directions: [(i64, i64); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];
        for y in 0..height {
            for x in 0..width {
                let from = y * width + x;
                if graph.node_info[from].is_locked {
                    continue;
                }
                for &(dx, dy) in &directions {
                    let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let to = ny as usize * width + nx as usize;
                    if !graph.node_info[to].is_locked {
                        // both ends exist by construction
                        let _ = graph.add_edge(from, to);
                    }
                }
            }
        }
        graph
    }

    /// Loads a MovingAI `.map` file as a 4-connected grid.
    pub fn from_map_file(path: &str, spacing: f64) -> MapfResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_map_str(&content, spacing)
    }

    pub fn from_map_str(content: &str, spacing: f64) -> MapfResult<Self> {
        let mut lines = content.lines();

        let _type = lines
            .next()
            .ok_or_else(|| MapfError::MapFormat("missing type line".into()))?;
        let height = Self::parse_header(lines.next(), "height")?;
        let width = Self::parse_header(lines.next(), "width")?;
        match lines.next() {
            Some(line) if line.trim() == "map" => {}
            _ => return Err(MapfError::MapFormat("missing `map` line".into())),
        }

        let mut cells = Vec::with_capacity(height);
        for line in lines.take(height) {
            let row = line.trim_end().as_bytes().to_vec();
            if row.len() < width {
                return Err(MapfError::MapFormat(format!(
                    "row {} has {} cells, expected {width}",
                    cells.len(),
                    row.len()
                )));
            }
            cells.push(row);
        }
        if cells.len() != height {
            return Err(MapfError::MapFormat(format!(
                "expected {height} rows, got {}",
                cells.len()
            )));
        }

        let graph = Self::from_cells(width, height, spacing, &cells);
        debug!(
            "loaded map {width}x{height} with {} nodes",
            graph.node_count()
        );
        Ok(graph)
    }

    fn parse_header(line: Option<&str>, key: &str) -> MapfResult<usize> {
        let line = line.ok_or_else(|| MapfError::MapFormat(format!("missing {key} line")))?;
        let mut parts = line.split_whitespace();
        if parts.next() != Some(key) {
            return Err(MapfError::MapFormat(format!("expected `{key}`, got `{line}`")));
        }
        parts
            .next()
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| MapfError::MapFormat(format!("invalid {key} value in `{line}`")))
    }

    pub fn node_count(&self) -> usize {
        self.positions.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node < self.node_count()
    }

    pub fn position(&self, node: NodeId) -> (f64, f64) {
        self.positions[node]
    }

    pub fn node_info(&self, node: NodeId) -> NodeInfo {
        self.node_info[node]
    }

    pub fn set_locked(&mut self, node: NodeId, locked: bool) {
        self.node_info[node].is_locked = locked;
    }

    pub fn set_obstacle(&mut self, node: NodeId, obstacle: bool) {
        self.node_info[node].is_obstacle = obstacle;
    }

    /// Whether an agent with the given obstacle permission may enter `node`.
    pub fn is_blocked(&self, node: NodeId, can_go_through_obstacles: bool) -> bool {
        let info = self.node_info[node];
        info.is_locked || (!can_go_through_obstacles && info.is_obstacle)
    }

    pub fn edges(&self, node: NodeId) -> &[Edge] {
        &self.edges[node]
    }

    /// Edges ending in `node`, stored with their original direction.
    pub fn backward_edges(&self, node: NodeId) -> &[Edge] {
        &self.backward_edges[node]
    }

    pub fn edge_between(&self, from: NodeId, to: NodeId) -> Option<&Edge> {
        self.edges[from].iter().find(|edge| edge.to == to)
    }

    pub fn distance(&self, a: NodeId, b: NodeId) -> f64 {
        let (ax, ay) = self.positions[a];
        let (bx, by) = self.positions[b];
        ((ax - bx) * (ax - bx) + (ay - by) * (ay - by)).sqrt()
    }

    /// Grid cell lookup for graphs created from a grid or map file.
    pub fn node_at(&self, x: usize, y: usize) -> Option<NodeId> {
        let (width, height) = self.grid?;
        (x < width && y < height).then_some(y * width + x)
    }

    /// Grid coordinates of `node`, the inverse of `node_at`.
    pub fn cell_of(&self, node: NodeId) -> Option<(usize, usize)> {
        let (width, _) = self.grid?;
        self.contains(node).then(|| (node % width, node / width))
    }

    /// Nodes strictly between `from` and `to` when following a straight line
    /// of edges. `None` if no such line exists.
    pub fn intermediate_nodes(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        let (fx, fy) = self.positions[from];
        let (tx, ty) = self.positions[to];
        let angle = rad_to_degree((ty - fy).atan2(tx - fx));

        let mut nodes = Vec::new();
        let mut node = from;
        while node != to {
            node = self.edges[node]
                .iter()
                .find(|edge| angle_difference(edge.angle, angle) < 10)?
                .to;
            if node != to {
                if nodes.len() > self.node_count() {
                    return None;
                }
                nodes.push(node);
            }
        }
        Some(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAP: &str = "type octile\nheight 3\nwidth 4\nmap\n....\n.@o.\n....\n";

    #[test]
    fn test_read_map() {
        let graph = Graph::from_map_str(TEST_MAP, 1.0).unwrap();
        assert_eq!(graph.node_count(), 12);

        let wall = graph.node_at(1, 1).unwrap();
        let soft = graph.node_at(2, 1).unwrap();
        assert!(graph.node_info(wall).is_locked);
        assert!(graph.node_info(soft).is_obstacle);
        assert!(graph.edges(wall).is_empty());

        assert!(graph.is_blocked(soft, false));
        assert!(!graph.is_blocked(soft, true));

        // (0, 1) borders the wall on its right
        let left = graph.node_at(0, 1).unwrap();
        let neighbors: Vec<_> = graph.edges(left).iter().map(|edge| edge.to).collect();
        assert_eq!(neighbors.len(), 2);
        assert!(neighbors.contains(&graph.node_at(0, 0).unwrap()));
        assert!(neighbors.contains(&graph.node_at(0, 2).unwrap()));
    }

    #[test]
    fn test_read_map_file() {
        let graph = Graph::from_map_file("map_file/test/warehouse.map", 1.0).unwrap();
        assert_eq!(graph.node_count(), 8 * 6);
        assert!(graph.node_info(graph.node_at(0, 0).unwrap()).is_locked);
        assert_eq!(graph.cell_of(graph.node_at(3, 2).unwrap()), Some((3, 2)));
        assert!(graph.node_info(graph.node_at(2, 4).unwrap()).is_obstacle);
    }

    #[test]
    fn test_custom_graph() {
        let mut graph = Graph::new();
        let a = graph.add_node(0.0, 0.0);
        let b = graph.add_node(0.0, 2.0);
        graph.add_bidirectional_edge(a, b).unwrap();
        assert!(graph.add_edge(a, 7).is_err());
        assert_eq!(graph.edge_between(a, b).unwrap().angle, 90);
        assert_eq!(graph.backward_edges(a).len(), 1);
        assert_eq!(graph.node_at(0, 0), None);

        graph.set_obstacle(b, true);
        assert!(graph.is_blocked(b, false));
        assert!(!graph.is_blocked(b, true));
    }

    #[test]
    fn test_malformed_map() {
        let result = Graph::from_map_str("type octile\nheight 2\nwidth 2\nmap\n..\n", 1.0);
        assert!(matches!(result, Err(MapfError::MapFormat(_))));
    }

    #[test]
    fn test_edge_geometry() {
        let graph = Graph::grid(3, 3, 2.0);
        let edge = graph.edge_between(0, 1).unwrap();
        assert_eq!(edge.angle, 0);
        assert!((edge.distance - 2.0).abs() < 1e-9);
        assert_eq!(graph.edge_between(1, 0).unwrap().angle, 180);
        assert_eq!(graph.edge_between(0, 3).unwrap().angle, 90);
        assert_eq!(graph.edge_between(3, 0).unwrap().angle, 270);
        assert_eq!(graph.backward_edges(4).len(), 4);
    }

    #[test]
    fn test_angles() {
        assert_eq!(angle_difference(359, 1), 2);
        assert_eq!(angle_difference(90, 270), 180);
        assert!(same_heading(0, 1));
        assert!(!same_heading(0, 90));
        assert_eq!(rad_to_degree(degree_to_rad(270)), 270);
        assert_eq!(rad_to_degree(-PI / 2.0), 270);
    }

    #[test]
    fn test_intermediate_nodes() {
        let graph = Graph::grid(4, 1, 1.0);
        assert_eq!(graph.intermediate_nodes(0, 3), Some(vec![1, 2]));
        assert_eq!(graph.intermediate_nodes(0, 1), Some(vec![]));

        let square = Graph::grid(2, 2, 1.0);
        assert_eq!(square.intermediate_nodes(0, 3), None);
    }
}
