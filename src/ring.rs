//! Delay Ring - fixed-horizon countdown buffer
//!
//! Slot `k` holds the lanes that are due `k + 1` pulses from now. Each pulse
//! pops the front slot and appends an empty one at the tail, so the cost per
//! pulse does not depend on how many lanes are waiting.

use crate::registry::LaneId;
use std::collections::VecDeque;

pub struct DelayRing {
    slots: VecDeque<Vec<LaneId>>,
    horizon: usize,
}

impl DelayRing {
    /// Create an empty ring with `horizon` slots.
    pub fn new(horizon: usize) -> Self {
        let mut slots = VecDeque::with_capacity(horizon);
        slots.resize_with(horizon, Vec::new);
        Self { slots, horizon }
    }

    /// Longest delay (in pulses) the ring can hold.
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Insert `id` so it is popped after `delay` pulses. `delay` must be in
    /// `1..=horizon`; the caller rejects anything else.
    pub fn insert(&mut self, delay: usize, id: LaneId) {
        debug_assert!(delay >= 1 && delay <= self.horizon);
        self.slots[delay - 1].push(id);
    }

    /// Pop the slot that is due now and append a fresh one at the tail.
    pub fn advance(&mut self) -> Vec<LaneId> {
        let due = self.slots.pop_front().unwrap_or_default();
        self.slots.push_back(Vec::new());
        due
    }

    /// Remove `id` from the slot `delay` pulses ahead. Returns whether it was there.
    pub fn remove(&mut self, delay: usize, id: LaneId) -> bool {
        let Some(slot) = delay.checked_sub(1).and_then(|i| self.slots.get_mut(i)) else {
            return false;
        };
        match slot.iter().position(|x| *x == id) {
            Some(i) => {
                slot.swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Drop every pending entry, keeping the horizon.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.clear();
        }
    }

    /// Number of lane ids currently held.
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    /// All held ids, front slot first.
    pub fn ids(&self) -> impl Iterator<Item = LaneId> + '_ {
        self.slots.iter().flatten().copied()
    }
}
