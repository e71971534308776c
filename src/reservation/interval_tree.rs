use std::ops::Range;

use super::{ConflictPolicy, Reservation, TOLERANCE};

/// Disjoint, start-ordered reservations of a single node.
#[derive(Debug, Clone, Default)]
pub(crate) struct IntervalTree {
    slots: Vec<Reservation>,
}

impl IntervalTree {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn slots(&self) -> &[Reservation] {
        &self.slots
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    /// Index range of all slots intersecting [start, end).
    pub(crate) fn overlapping(&self, start: f64, end: f64) -> Range<usize> {
        let first = self
            .slots
            .partition_point(|slot| slot.interval.end <= start + TOLERANCE);
        let last = self
            .slots
            .partition_point(|slot| slot.interval.start + TOLERANCE < end);
        first..last.max(first)
    }

    pub(crate) fn is_free(&self, start: f64, end: f64) -> bool {
        self.overlapping(start, end).is_empty()
    }

    /// Inserts `reservation`, returning the evicted lower-priority slots, or
    /// the first slot that blocks the insertion.
    pub(crate) fn insert(
        &mut self,
        reservation: Reservation,
        policy: ConflictPolicy,
    ) -> Result<Vec<Reservation>, Reservation> {
        let (start, end) = (reservation.interval.start, reservation.interval.end);
        let range = self.overlapping(start, end);

        let blocking = match policy {
            ConflictPolicy::Strict => self.slots[range.clone()].first(),
            ConflictPolicy::PriorityAware => self.slots[range.clone()]
                .iter()
                .find(|slot| slot.priority >= reservation.priority),
        };
        if let Some(blocking) = blocking {
            return Err(*blocking);
        }

        let position = range.start;
        let evicted: Vec<_> = self.slots.drain(range).collect();
        self.slots.insert(position, reservation);
        Ok(evicted)
    }

    fn position_containing(&self, time: f64) -> Option<usize> {
        let position = self
            .slots
            .partition_point(|slot| slot.interval.start <= time + TOLERANCE);
        if position == 0 || self.slots[position - 1].interval.end <= time {
            return None;
        }
        Some(position - 1)
    }

    pub(crate) fn containing(&self, time: f64) -> Option<&Reservation> {
        self.position_containing(time).map(|position| &self.slots[position])
    }

    /// Removes the slot covering `time`.
    pub(crate) fn remove_containing(&mut self, time: f64) -> Option<Reservation> {
        let position = self.position_containing(time)?;
        Some(self.slots.remove(position))
    }

    /// Drops every slot that ended before `current_time`.
    pub(crate) fn reorganize(&mut self, current_time: f64) {
        let expired = self
            .slots
            .partition_point(|slot| slot.interval.end < current_time);
        self.slots.drain(..expired);
    }

    pub(crate) fn is_disjoint(&self) -> bool {
        self.slots.windows(2).all(|pair| {
            pair[0].interval.start <= pair[1].interval.start
                && pair[0].interval.end <= pair[1].interval.start + TOLERANCE
        })
    }
}
