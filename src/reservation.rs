//! Time-indexed ownership of graph nodes.
//!
//! Every node carries a set of disjoint half-open time intervals, each owned
//! by one agent (or by no agent for pure constraints) at a priority level.
//! Searches query the table to prune colliding states; strategies commit the
//! occupancy of accepted paths into it.

mod interval_tree;

use std::collections::BTreeSet;
use std::fmt;

use tracing::trace;

use crate::common::AgentId;
use crate::error::ReservationError;
use crate::graph::{Graph, NodeId};
use crate::physics::Physics;
use interval_tree::IntervalTree;

/// Overlaps shorter than this are ignored, as are shorter intervals.
pub const TOLERANCE: f64 = 1e-12;

/// Gap accepted between consecutive intervals of one path.
pub const ROUNDING_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub node: NodeId,
    pub start: f64,
    pub end: f64,
}

impl Interval {
    pub fn new(node: NodeId, start: f64, end: f64) -> Self {
        Interval { node, start, end }
    }

    /// Permanent hold of `node` from `start` on.
    pub fn permanent(node: NodeId, start: f64) -> Self {
        Interval::new(node, start, f64::INFINITY)
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.node == other.node
            && self.end > other.start + TOLERANCE
            && other.end > self.start + TOLERANCE
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {} - [{} - {}]", self.node, self.start, self.end)
    }
}

/// An interval committed to the table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    pub interval: Interval,
    pub owner: Option<AgentId>,
    pub priority: i32,
}

/// An existing reservation hit by a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collision {
    pub node: NodeId,
    pub owner: Option<AgentId>,
    pub priority: i32,
    pub time: f64,
}

impl From<&Reservation> for Collision {
    fn from(reservation: &Reservation) -> Self {
        Collision {
            node: reservation.interval.node,
            owner: reservation.owner,
            priority: reservation.priority,
            time: reservation.interval.start,
        }
    }
}

/// How `try_add` treats overlaps with existing reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Any overlap is rejected.
    Strict,
    /// Overlapped reservations of strictly lower priority are evicted;
    /// equal or higher priority rejects the insertion.
    PriorityAware,
}

#[derive(Debug, Clone)]
pub struct ReservationTable {
    trees: Vec<IntervalTree>,
    touched: BTreeSet<NodeId>,
    policy: ConflictPolicy,
}

impl ReservationTable {
    pub fn new(graph: &Graph, policy: ConflictPolicy) -> Self {
        Self::with_node_count(graph.node_count(), policy)
    }

    pub fn with_node_count(node_count: usize, policy: ConflictPolicy) -> Self {
        ReservationTable {
            trees: vec![IntervalTree::default(); node_count],
            touched: BTreeSet::new(),
            policy,
        }
    }

    pub fn strict(graph: &Graph) -> Self {
        Self::new(graph, ConflictPolicy::Strict)
    }

    pub fn priority_aware(graph: &Graph) -> Self {
        Self::new(graph, ConflictPolicy::PriorityAware)
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Number of committed reservations.
    pub fn len(&self) -> usize {
        self.touched.iter().map(|&node| self.trees[node].len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    pub fn clear(&mut self) {
        for node in std::mem::take(&mut self.touched) {
            self.trees[node].clear();
        }
    }

    pub fn clear_node(&mut self, node: NodeId) {
        if let Some(tree) = self.trees.get_mut(node) {
            tree.clear();
        }
        self.touched.remove(&node);
    }

    fn tree(&self, node: NodeId) -> Option<&IntervalTree> {
        self.trees.get(node)
    }

    pub fn reservations(&self, node: NodeId) -> &[Reservation] {
        self.tree(node).map_or(&[], |tree| tree.slots())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.touched
            .iter()
            .flat_map(move |&node| self.trees[node].slots().iter())
    }

    /// Commits one interval. Intervals shorter than `TOLERANCE` are ignored.
    /// On success the evicted lower-priority reservations are returned; on
    /// failure the table is unchanged.
    pub fn try_add(
        &mut self,
        interval: &Interval,
        owner: Option<AgentId>,
        priority: i32,
    ) -> Result<Vec<Reservation>, ReservationError> {
        if interval.end - interval.start < TOLERANCE {
            return Ok(Vec::new());
        }
        let policy = self.policy;
        let tree = self
            .trees
            .get_mut(interval.node)
            .ok_or(ReservationError::UnknownNode(interval.node))?;

        let reservation = Reservation {
            interval: *interval,
            owner,
            priority,
        };
        match tree.insert(reservation, policy) {
            Ok(evicted) => {
                self.touched.insert(interval.node);
                Ok(evicted)
            }
            Err(blocking) => Err(ReservationError::IntervalConflict {
                node: interval.node,
                start: interval.start,
                end: interval.end,
                owner: blocking.owner,
                priority: blocking.priority,
            }),
        }
    }

    /// Commits all intervals or none of them.
    pub fn try_add_all(
        &mut self,
        intervals: &[Interval],
        owner: Option<AgentId>,
        priority: i32,
    ) -> Result<Vec<Reservation>, ReservationError> {
        let mut evicted = Vec::new();
        for (index, interval) in intervals.iter().enumerate() {
            match self.try_add(interval, owner, priority) {
                Ok(mut removed) => evicted.append(&mut removed),
                Err(err) => {
                    for added in intervals[..index].iter().rev() {
                        self.remove(added);
                    }
                    for reservation in &evicted {
                        // slots were free before this call
                        let _ = self.try_add(
                            &reservation.interval,
                            reservation.owner,
                            reservation.priority,
                        );
                    }
                    return Err(err);
                }
            }
        }
        Ok(evicted)
    }

    /// Commits every interval that fits and reports the ones that did not.
    pub fn add_each(
        &mut self,
        intervals: &[Interval],
        owner: Option<AgentId>,
        priority: i32,
    ) -> Vec<ReservationError> {
        let mut skipped = Vec::new();
        for interval in intervals {
            if let Err(err) = self.try_add(interval, owner, priority) {
                trace!("skip reservation: {err}");
                skipped.push(err);
            }
        }
        skipped
    }

    /// Removes the reservation that contains the midpoint of `interval`.
    pub fn remove(&mut self, interval: &Interval) -> bool {
        if interval.end - interval.start < TOLERANCE {
            return false;
        }
        let probe = if interval.end.is_infinite() {
            interval.start + 1.0
        } else {
            interval.start / 2.0 + interval.end / 2.0
        };
        self.remove_containing(interval.node, probe).is_some()
    }

    pub fn remove_all(&mut self, intervals: &[Interval]) {
        for interval in intervals {
            self.remove(interval);
        }
    }

    pub fn remove_containing(&mut self, node: NodeId, time: f64) -> Option<Reservation> {
        let tree = self.trees.get_mut(node)?;
        let removed = tree.remove_containing(time);
        if tree.is_empty() {
            self.touched.remove(&node);
        }
        removed
    }

    /// Removes the reservation covering `time` on `node`, but only if
    /// `owner` holds it.
    pub fn remove_owned(&mut self, node: NodeId, time: f64, owner: AgentId) -> bool {
        let owned = self
            .tree(node)
            .and_then(|tree| tree.containing(time))
            .is_some_and(|reservation| reservation.owner == Some(owner));
        owned && self.remove_containing(node, time).is_some()
    }

    pub fn is_free(&self, node: NodeId, start: f64, end: f64) -> bool {
        self.tree(node).map_or(true, |tree| tree.is_free(start, end))
    }

    pub fn interval_free(&self, interval: &Interval) -> bool {
        self.is_free(interval.node, interval.start, interval.end)
    }

    pub fn intervals_free(&self, intervals: &[Interval]) -> bool {
        intervals.iter().all(|interval| self.interval_free(interval))
    }

    /// The earliest reservation overlapping [start, end) on `node`.
    pub fn first_collision(&self, node: NodeId, start: f64, end: f64) -> Option<Collision> {
        let tree = self.tree(node)?;
        let range = tree.overlapping(start, end);
        tree.slots()[range].first().map(Collision::from)
    }

    pub fn collisions(&self, node: NodeId, start: f64, end: f64) -> Vec<Collision> {
        let Some(tree) = self.tree(node) else {
            return Vec::new();
        };
        let range = tree.overlapping(start, end);
        tree.slots()[range].iter().map(Collision::from).collect()
    }

    /// First collision of a sequence, in sequence order.
    pub fn first_collision_in(&self, intervals: &[Interval]) -> Option<Collision> {
        intervals
            .iter()
            .find_map(|iv| self.first_collision(iv.node, iv.start, iv.end))
    }

    /// Whether driving through `nodes`, passing them at `times`, is free.
    pub fn checkpoints_free(&self, nodes: &[NodeId], times: &[f64], free_after_last: bool) -> bool {
        (0..nodes.len()).all(|i| {
            let (start, end) = checkpoint_window(i, times, free_after_last);
            self.is_free(nodes[i], start, end)
        })
    }

    pub fn checkpoint_collisions(
        &self,
        nodes: &[NodeId],
        times: &[f64],
        free_after_last: bool,
    ) -> Vec<Collision> {
        (0..nodes.len())
            .flat_map(|i| {
                let (start, end) = checkpoint_window(i, times, free_after_last);
                self.collisions(nodes[i], start, end)
            })
            .collect()
    }

    /// Forgets reservations that ended before `current_time`.
    pub fn reorganize(&mut self, current_time: f64) {
        let mut emptied = Vec::new();
        for &node in &self.touched {
            self.trees[node].reorganize(current_time);
            if self.trees[node].is_empty() {
                emptied.push(node);
            }
        }
        for node in emptied {
            self.touched.remove(&node);
        }
    }

    /// Intersection of `interval` with the reservation it collides with.
    pub fn overlapping_interval(&self, interval: &Interval) -> Option<Interval> {
        let collision = self.tree(interval.node)?;
        let range = collision.overlapping(interval.start, interval.end);
        collision.slots()[range].first().map(|slot| {
            Interval::new(
                interval.node,
                slot.interval.start.max(interval.start),
                slot.interval.end.min(interval.end),
            )
        })
    }

    /// Checks the no-double-booking invariant on every node.
    pub fn is_disjoint(&self) -> bool {
        self.trees.iter().all(|tree| tree.is_disjoint())
    }
}

fn checkpoint_window(i: usize, times: &[f64], free_after_last: bool) -> (f64, f64) {
    let last = times.len() - 1;
    if i == last {
        let start = if i == 0 { times[0] } else { times[i - 1] };
        let end = if free_after_last {
            f64::INFINITY
        } else {
            times[i]
        };
        (start, end)
    } else if i == 0 {
        (times[0], times[1])
    } else {
        (times[i - 1], times[i + 1])
    }
}

/// Occupancy of a move through `nodes` passed at `times`: every node is held
/// from passing its predecessor until passing its successor.
pub fn create_intervals(
    start_at: f64,
    nodes: &[NodeId],
    times: &[f64],
    to_infinity: bool,
) -> Vec<Interval> {
    let mut intervals = Vec::with_capacity(nodes.len() + 1);
    for i in 0..nodes.len() {
        let (mut start, end) = checkpoint_window(i, times, false);
        if i == 0 {
            start = start_at;
        }
        intervals.push(Interval::new(nodes[i], start, end));
        if i + 1 == nodes.len() && to_infinity {
            intervals.push(Interval::permanent(nodes[i], times[i]));
        }
    }
    intervals
}

/// Straight-line checkpoints and passing times between two nodes.
pub fn checkpoints_between(
    graph: &Graph,
    physics: &Physics,
    start_time: f64,
    current_speed: f64,
    from: NodeId,
    to: NodeId,
) -> Option<(Vec<NodeId>, Vec<f64>)> {
    let mut nodes = vec![from];
    nodes.extend(graph.intermediate_nodes(from, to)?);
    nodes.push(to);

    let distances: Vec<f64> = nodes.iter().map(|&node| graph.distance(from, node)).collect();
    let total = distances[distances.len() - 1];
    let times = physics.checkpoint_times(current_speed, start_time, total, &distances);
    Some((nodes, times))
}

/// Occupancy of driving straight from `from` to `to`.
#[allow(clippy::too_many_arguments)]
pub fn create_intervals_between(
    graph: &Graph,
    physics: &Physics,
    start_interval_at: f64,
    start_driving_at: f64,
    current_speed: f64,
    from: NodeId,
    to: NodeId,
    to_infinity: bool,
) -> Option<Vec<Interval>> {
    let (nodes, times) =
        checkpoints_between(graph, physics, start_driving_at, current_speed, from, to)?;
    Some(create_intervals(start_interval_at, &nodes, &times, to_infinity))
}

/// A path's occupancy must be gap-free in time and must not double-book a
/// node for itself.
pub fn is_well_formed(intervals: &[Interval]) -> bool {
    let ordered = intervals.iter().all(|iv| iv.start <= iv.end + TOLERANCE);
    let contiguous = intervals
        .windows(2)
        .all(|pair| pair[1].start <= pair[0].end + ROUNDING_TOLERANCE);
    let self_free = intervals.iter().enumerate().all(|(i, a)| {
        intervals[i + 1..]
            .iter()
            .all(|b| a.node != b.node || !a.overlaps(b) || (a.end.is_infinite() && b.end.is_infinite()))
    });
    ordered && contiguous && self_free
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(policy: ConflictPolicy) -> ReservationTable {
        ReservationTable::with_node_count(4, policy)
    }

    #[test]
    fn test_add_and_query() {
        let mut table = table(ConflictPolicy::Strict);
        table.try_add(&Interval::new(0, 0.0, 5.0), Some(1), 0).unwrap();
        table.try_add(&Interval::new(0, 5.0, 8.0), Some(2), 0).unwrap();

        assert!(!table.is_free(0, 4.0, 6.0));
        assert!(table.is_free(0, 8.0, 10.0));
        assert!(table.is_free(1, 0.0, 100.0));

        let collision = table.first_collision(0, 4.0, 6.0).unwrap();
        assert_eq!(collision.owner, Some(1));
        assert_eq!(table.collisions(0, 4.0, 6.0).len(), 2);
        assert_eq!(table.len(), 2);
        assert!(table.is_disjoint());
    }

    #[test]
    fn test_contained_interval_conflict_leaves_table_unchanged() {
        let mut table = table(ConflictPolicy::Strict);
        table.try_add(&Interval::new(2, 0.0, 10.0), Some(1), 0).unwrap();
        let before: Vec<_> = table.iter().copied().collect();

        let result = table.try_add(&Interval::new(2, 3.0, 4.0), Some(2), 0);
        assert_eq!(
            result,
            Err(ReservationError::IntervalConflict {
                node: 2,
                start: 3.0,
                end: 4.0,
                owner: Some(1),
                priority: 0,
            })
        );
        let after: Vec<_> = table.iter().copied().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_priority_aware_eviction() {
        let mut table = table(ConflictPolicy::PriorityAware);
        table.try_add(&Interval::new(0, 0.0, 5.0), Some(1), 0).unwrap();
        table.try_add(&Interval::new(0, 6.0, 9.0), Some(3), 2).unwrap();

        let evicted = table.try_add(&Interval::new(0, 2.0, 5.5), Some(2), 1).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].owner, Some(1));
        assert_eq!(table.first_collision(0, 3.0, 3.5).unwrap().owner, Some(2));

        // equal or higher priority is never evicted
        assert!(table.try_add(&Interval::new(0, 5.0, 7.0), Some(4), 2).is_err());
        assert!(table.is_disjoint());
    }

    #[test]
    fn test_try_add_all_is_atomic() {
        let mut table = table(ConflictPolicy::Strict);
        table.try_add(&Interval::new(3, 4.0, 6.0), Some(9), 0).unwrap();
        let path = [
            Interval::new(1, 0.0, 2.0),
            Interval::new(2, 1.0, 3.0),
            Interval::new(3, 2.0, 5.0),
        ];
        assert!(table.try_add_all(&path, Some(1), 0).is_err());
        assert_eq!(table.len(), 1);
        assert!(table.is_free(1, 0.0, 2.0));
    }

    #[test]
    fn test_touching_and_senseless_intervals() {
        let mut table = table(ConflictPolicy::Strict);
        table.try_add(&Interval::new(0, 0.0, 5.0), Some(1), 0).unwrap();
        assert!(table.try_add(&Interval::new(0, 5.0, 6.0), Some(2), 0).is_ok());
        assert!(table.try_add(&Interval::new(0, 1.0, 1.0), Some(2), 0).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_and_reorganize() {
        let mut table = table(ConflictPolicy::Strict);
        let permanent = Interval::permanent(1, 10.0);
        table.try_add(&Interval::new(1, 0.0, 5.0), Some(1), 0).unwrap();
        table.try_add(&permanent, Some(1), 0).unwrap();

        assert!(table.remove(&permanent));
        assert!(!table.remove(&permanent));
        assert!(table.is_free(1, 10.0, f64::INFINITY));

        table.reorganize(6.0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_owned() {
        let mut table = table(ConflictPolicy::Strict);
        table.try_add(&Interval::permanent(1, 2.0), Some(4), 0).unwrap();
        assert!(!table.remove_owned(1, 3.0, 5));
        assert!(!table.remove_owned(1, 1.0, 4));
        assert!(table.remove_owned(1, 2.0, 4));
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut table = table(ConflictPolicy::Strict);
        table.try_add(&Interval::new(0, 0.0, 1.0), None, 0).unwrap();
        table.try_add(&Interval::new(3, 0.0, 1.0), None, 0).unwrap();
        table.clear_node(3);
        assert_eq!(table.len(), 1);
        table.clear();
        assert!(table.is_empty());
        assert!(table.is_free(0, 0.0, 1.0));
    }

    #[test]
    fn test_overlapping_interval() {
        let mut table = table(ConflictPolicy::Strict);
        table.try_add(&Interval::new(2, 3.0, 8.0), Some(1), 0).unwrap();
        let overlap = table
            .overlapping_interval(&Interval::new(2, 5.0, 10.0))
            .unwrap();
        assert_eq!(overlap, Interval::new(2, 5.0, 8.0));
        assert!(table.overlapping_interval(&Interval::new(2, 8.0, 9.0)).is_none());
    }

    #[test]
    fn test_create_intervals() {
        let intervals = create_intervals(0.5, &[0, 1, 2], &[1.0, 2.0, 3.0], true);
        assert_eq!(
            intervals,
            vec![
                Interval::new(0, 0.5, 2.0),
                Interval::new(1, 1.0, 3.0),
                Interval::new(2, 2.0, 3.0),
                Interval::permanent(2, 3.0),
            ]
        );
        assert!(is_well_formed(&intervals));
    }

    #[test]
    fn test_checkpoints() {
        let mut table = table(ConflictPolicy::Strict);
        table.try_add(&Interval::new(2, 3.5, 4.0), Some(5), 0).unwrap();
        let nodes = [0, 1, 2];
        assert!(table.checkpoints_free(&nodes, &[0.0, 1.0, 2.0], false));
        assert!(!table.checkpoints_free(&nodes, &[0.0, 1.0, 2.0], true));
        let collisions = table.checkpoint_collisions(&nodes, &[0.0, 1.0, 2.0], true);
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].owner, Some(5));
    }

    #[test]
    fn test_create_intervals_between() {
        let graph = Graph::grid(3, 1, 1.0);
        let physics = Physics::new(1.0, 1.0, 1.0, 4.0);
        let intervals =
            create_intervals_between(&graph, &physics, 0.0, 0.0, 0.0, 0, 2, false).unwrap();
        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[0].node, 0);
        assert!((intervals[2].end - 3.0).abs() < 1e-9);
        assert!(create_intervals_between(&graph, &physics, 0.0, 0.0, 0.0, 2, 2, false)
            .is_some_and(|intervals| intervals.len() == 2));
    }

    #[test]
    fn test_well_formed() {
        let gap = [Interval::new(0, 0.0, 1.0), Interval::new(1, 2.0, 3.0)];
        assert!(!is_well_formed(&gap));
        let revisit = [
            Interval::new(0, 0.0, 2.0),
            Interval::new(1, 1.0, 3.0),
            Interval::new(0, 1.5, 4.0),
        ];
        assert!(!is_well_formed(&revisit));
    }
}
