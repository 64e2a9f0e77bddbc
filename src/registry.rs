//! Lane Registry
//!
//! Tracks which lanes are enabled and owns each lane's wake signal.
//! Everything here lives behind the engine lock.

use crate::error::{Cancelled, WaitResult};
use std::collections::BTreeMap;
use std::task::{Context, Poll, Waker};

/// Identifier of a lane.
pub type LaneId = u32;

/// The wait structure a lane is parked in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitKind {
    /// In the delay ring, due at the given absolute pulse count.
    Pulses { due: u64 },
    Beat,
    Bar,
    /// Waiting to be registered.
    Enable,
}

impl WaitKind {
    /// Whether this wait is driven by the clock (and so aborted by a stop).
    pub fn is_clock(&self) -> bool {
        !matches!(self, WaitKind::Enable)
    }
}

/// Auto-clearing, single-shot wake flag.
///
/// Each wait arms the signal and receives a ticket. The first `fire` after
/// arming stores the outcome; the matching poll consumes it.
#[derive(Default)]
pub struct WakeSignal {
    ticket: u64,
    outstanding: bool,
    outcome: Option<WaitResult>,
    waker: Option<Waker>,
}

impl WakeSignal {
    /// Arm for a new wait and return its ticket.
    pub fn arm(&mut self) -> u64 {
        debug_assert!(!self.outstanding, "lane issued a second wait while one is pending");
        self.ticket += 1;
        self.outstanding = true;
        self.outcome = None;
        self.waker = None;
        self.ticket
    }

    /// Store the outcome of the outstanding wait. Returns the waker to call
    /// once the engine lock is released. A signal with no outstanding wait,
    /// or one that already fired, ignores the call.
    pub fn fire(&mut self, outcome: WaitResult) -> Option<Waker> {
        if !self.outstanding || self.outcome.is_some() {
            return None;
        }
        self.outcome = Some(outcome);
        self.waker.take()
    }

    /// Consume the outcome for `ticket`, or register the waker.
    pub fn poll(&mut self, ticket: u64, cx: &mut Context<'_>) -> Poll<WaitResult> {
        if ticket != self.ticket || !self.outstanding {
            // Superseded by a newer wait.
            return Poll::Ready(Err(Cancelled::lane_disabled()));
        }
        match self.outcome.take() {
            Some(outcome) => {
                self.outstanding = false;
                self.waker = None;
                Poll::Ready(outcome)
            }
            None => {
                match &self.waker {
                    Some(w) if w.will_wake(cx.waker()) => {}
                    _ => self.waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }

    /// Forget the wait for `ticket`. Returns whether it was still outstanding.
    pub fn disarm(&mut self, ticket: u64) -> bool {
        if ticket != self.ticket || !self.outstanding {
            return false;
        }
        self.outstanding = false;
        self.outcome = None;
        self.waker = None;
        true
    }

    /// Drop a stale outcome left behind with no wait outstanding.
    pub fn clear(&mut self) {
        if !self.outstanding {
            self.outcome = None;
            self.waker = None;
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    pub fn has_fired(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Per-lane state.
#[derive(Default)]
pub struct LaneSlot {
    pub active: bool,
    /// Where the lane is parked, if it is waiting.
    pub parked: Option<WaitKind>,
    pub signal: WakeSignal,
}

/// The set of known lanes.
#[derive(Default)]
pub struct LaneRegistry {
    slots: BTreeMap<LaneId, LaneSlot>,
}

impl LaneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: LaneId) -> Option<&LaneSlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: LaneId) -> Option<&mut LaneSlot> {
        self.slots.get_mut(&id)
    }

    /// Get the slot for `id`, creating an inactive one if needed.
    pub fn slot(&mut self, id: LaneId) -> &mut LaneSlot {
        self.slots.entry(id).or_default()
    }

    pub fn is_active(&self, id: LaneId) -> bool {
        self.slots.get(&id).is_some_and(|s| s.active)
    }

    /// Where `id` is parked, if anywhere.
    pub fn parked(&self, id: LaneId) -> Option<WaitKind> {
        self.slots.get(&id).and_then(|s| s.parked)
    }

    /// Mark `id` active. Returns false if it already was.
    pub fn activate(&mut self, id: LaneId) -> bool {
        let slot = self.slot(id);
        if slot.active {
            return false;
        }
        slot.active = true;
        slot.signal.clear();
        true
    }

    /// Mark `id` inactive. Returns false if it was not active.
    pub fn deactivate(&mut self, id: LaneId) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) if slot.active => {
                slot.active = false;
                true
            }
            _ => false,
        }
    }

    /// Drop the slot for `id` once it is inactive and no wait is outstanding.
    /// Returns whether the slot was removed.
    pub fn retire(&mut self, id: LaneId) -> bool {
        let idle = self
            .slots
            .get(&id)
            .is_some_and(|s| !s.active && !s.signal.is_outstanding());
        if idle {
            self.slots.remove(&id);
        }
        idle
    }

    /// Every known lane id, active or not.
    pub fn ids(&self) -> impl Iterator<Item = LaneId> + '_ {
        self.slots.keys().copied()
    }

    /// Active lane ids in ascending order.
    pub fn active_ids(&self) -> Vec<LaneId> {
        self.slots
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Lanes currently parked in a clock-driven wait, in ascending order.
    pub fn clock_parked(&self) -> Vec<LaneId> {
        self.slots
            .iter()
            .filter(|(_, s)| s.parked.is_some_and(|k| k.is_clock()))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
