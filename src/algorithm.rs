mod rra_star;
mod space_astar;
mod space_time_astar;

pub use rra_star::{ReverseResumableAStar, RraStarCache};
pub use space_astar::SpaceAStar;
pub use space_time_astar::{SearchOutcome, SpaceTimeAStar, StNodeId, Step};

use std::cmp::Ordering;
use std::time::Instant;

/// How many expansions happen between two deadline polls.
pub(crate) const DEADLINE_POLL_INTERVAL: usize = 64;

/// Entry of a `BTreeSet` based open list: lowest `f` first, deeper nodes
/// first on ties, then by id so every entry is unique.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenEntry {
    pub f: f64,
    pub g: f64,
    pub id: usize,
}

impl OpenEntry {
    pub fn new(f: f64, id: usize) -> Self {
        OpenEntry { f, g: 0.0, id }
    }

    pub fn with_g(f: f64, g: f64, id: usize) -> Self {
        OpenEntry { f, g, id }
    }
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f
            .total_cmp(&other.f)
            .then_with(|| other.g.total_cmp(&self.g))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Wall-clock point after which searches give up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|instant| Instant::now() >= instant)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_open_entry_order() {
        let mut open = BTreeSet::new();
        open.insert(OpenEntry::with_g(3.0, 1.0, 0));
        open.insert(OpenEntry::with_g(2.0, 0.5, 1));
        open.insert(OpenEntry::with_g(2.0, 1.5, 2));
        open.insert(OpenEntry::with_g(2.0, 1.5, 3));

        let order: Vec<_> = std::iter::from_fn(|| open.pop_first().map(|entry| entry.id)).collect();
        assert_eq!(order, vec![2, 3, 1, 0]);
    }

    #[test]
    fn test_deadline() {
        assert!(!Deadline::none().expired());
        assert!(Deadline::at(Instant::now()).expired());
        assert!(!Deadline::at(Instant::now() + Duration::from_secs(60)).expired());
    }
}
