//! Pulse Scheduler
//!
//! The clock state machine: position counters, transport, the delay ring,
//! beat/bar waiters and the lane registry. Every method runs under the
//! engine lock and reports the wakers and status events it produced in a
//! [`Wakeups`] batch, which the engine fires after releasing the lock.

use crate::error::{Cancelled, ClockError, WaitResult};
use crate::position::{ClockPosition, Meter, TransportState};
use crate::registry::{LaneId, LaneRegistry, WaitKind};
use crate::ring::DelayRing;
use crate::status::{DisplayToken, StatusEvent};
use std::collections::BTreeSet;
use std::task::{Context, Poll, Waker};

/// Side effects collected under the lock.
#[derive(Default)]
pub struct Wakeups {
    pub wakers: Vec<Waker>,
    pub status: Vec<StatusEvent>,
    /// Lanes whose wait completed, in wake order.
    pub woken: Vec<LaneId>,
}

/// Result of arming a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Armed {
    /// Resolved without parking.
    Ready(WaitResult),
    /// Parked; poll with this ticket.
    Parked(u64),
}

pub struct PulseScheduler {
    meter: Meter,
    transport: TransportState,
    /// `None` until the first pulse after a reset.
    position: Option<ClockPosition>,
    /// Pulses since the last reset.
    elapsed: u64,
    ring: DelayRing,
    beat_waiters: BTreeSet<LaneId>,
    bar_waiters: BTreeSet<LaneId>,
    registry: LaneRegistry,
}

impl PulseScheduler {
    /// Create a scheduler in the stopped, fully reset state.
    pub fn new(meter: Meter, horizon: usize) -> Self {
        Self {
            meter,
            transport: TransportState::Stopped,
            position: None,
            elapsed: 0,
            ring: DelayRing::new(horizon),
            beat_waiters: BTreeSet::new(),
            bar_waiters: BTreeSet::new(),
            registry: LaneRegistry::new(),
        }
    }

    pub fn meter(&self) -> Meter {
        self.meter
    }

    pub fn horizon(&self) -> usize {
        self.ring.horizon()
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    /// Position of the most recent pulse, `None` before the first one.
    pub fn position(&self) -> Option<ClockPosition> {
        self.position
    }

    /// Pulses processed since the last reset.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    // --- clock ---

    /// Advance one pulse and wake everything that is due.
    pub fn on_pulse(&mut self, out: &mut Wakeups) {
        if self.transport != TransportState::Running {
            tracing::trace!("pulse ignored while stopped");
            return;
        }

        self.elapsed += 1;
        let pos = match self.position {
            None => ClockPosition::ORIGIN,
            Some(p) => p.advance(&self.meter),
        };
        self.position = Some(pos);

        for id in self.ring.advance() {
            let due_here = self.registry.is_active(id)
                && matches!(self.registry.parked(id), Some(WaitKind::Pulses { .. }));
            if due_here {
                self.wake(id, Ok(()), out);
            } else {
                tracing::trace!(lane = id, "dropping ring entry for disabled lane");
            }
        }

        if pos.is_beat_boundary() {
            if pos.is_bar_boundary() {
                for id in std::mem::take(&mut self.bar_waiters) {
                    self.wake(id, Ok(()), out);
                }
            }
            for id in std::mem::take(&mut self.beat_waiters) {
                self.wake(id, Ok(()), out);
            }
            out.status.push(StatusEvent::ClockPhase {
                beat: pos.beat,
                bar: pos.bar,
            });
        }

        if !out.woken.is_empty() {
            tracing::trace!(position = %pos, woken = out.woken.len(), "pulse");
        }
    }

    /// Full reset: cancel every clock wait and stop.
    pub fn on_stop(&mut self, out: &mut Wakeups) {
        for id in self.registry.clock_parked() {
            self.wake(id, Err(Cancelled::transport_stopped()), out);
        }
        self.ring.clear();
        self.beat_waiters.clear();
        self.bar_waiters.clear();
        self.rewind();
        if self.transport != TransportState::Stopped {
            self.transport = TransportState::Stopped;
            out.status.push(StatusEvent::Transport(TransportState::Stopped));
        }
        tracing::debug!(cancelled = out.woken.len(), "transport stopped");
    }

    /// Soft reset: realign the grid and run.
    ///
    /// Bar waiters survive, so lanes that parked for the downbeat while
    /// stopped start together on the first pulse. A start while already
    /// running behaves as a stop followed by a start.
    pub fn on_start(&mut self, out: &mut Wakeups) {
        if self.transport == TransportState::Running {
            self.on_stop(out);
        }
        // Pulse and beat waits cannot be armed while stopped, so these are
        // empty here and nothing is left parked without an entry.
        debug_assert!(self.ring.is_empty() && self.beat_waiters.is_empty());
        self.ring.clear();
        self.beat_waiters.clear();
        self.rewind();
        self.transport = TransportState::Running;
        out.status.push(StatusEvent::Transport(TransportState::Running));
        tracing::debug!(bar_waiters = self.bar_waiters.len(), "transport running");
    }

    fn rewind(&mut self) {
        self.position = None;
        self.elapsed = 0;
    }

    // --- registry ---

    /// Enable a lane. Idempotent; returns whether anything changed.
    pub fn register(&mut self, id: LaneId, out: &mut Wakeups) -> bool {
        if !self.registry.activate(id) {
            return false;
        }
        let slot = self.registry.slot(id);
        if slot.parked == Some(WaitKind::Enable) {
            slot.parked = None;
            if let Some(w) = slot.signal.fire(Ok(())) {
                out.wakers.push(w);
            }
            out.woken.push(id);
        }
        out.status.push(StatusEvent::PadPaint {
            lane: id,
            token: DisplayToken::IDLE,
        });
        tracing::debug!(lane = id, "lane registered");
        true
    }

    /// Disable a lane, purge it from every wait structure and cancel its wait.
    pub fn unregister(&mut self, id: LaneId, out: &mut Wakeups) -> bool {
        if !self.registry.deactivate(id) {
            return false;
        }
        if self.registry.parked(id).is_some_and(|k| k.is_clock()) {
            self.purge(id);
            if let Some(slot) = self.registry.get_mut(id) {
                slot.parked = None;
            }
        }
        if let Some(slot) = self.registry.get_mut(id) {
            // Release an in-flight wait; an unconsumed outcome is left as is.
            if slot.signal.is_outstanding() && !slot.signal.has_fired() {
                if let Some(w) = slot.signal.fire(Err(Cancelled::lane_disabled())) {
                    out.wakers.push(w);
                }
                out.woken.push(id);
            }
        }
        // With a wait in flight the slot goes once its outcome is consumed.
        self.registry.retire(id);
        out.status.push(StatusEvent::PadPaint {
            lane: id,
            token: DisplayToken::DISABLED,
        });
        tracing::debug!(lane = id, "lane unregistered");
        true
    }

    pub fn is_active(&self, id: LaneId) -> bool {
        self.registry.is_active(id)
    }

    /// Flip a lane on or off and return what its pad should show.
    pub fn toggle(&mut self, id: LaneId, out: &mut Wakeups) -> DisplayToken {
        if self.registry.is_active(id) {
            self.unregister(id, out);
            DisplayToken::DISABLED
        } else {
            self.register(id, out);
            DisplayToken::IDLE
        }
    }

    pub fn active_lanes(&self) -> Vec<LaneId> {
        self.registry.active_ids()
    }

    // --- waits ---

    /// Park `id` for exactly `pulses` pulses.
    pub fn arm_pulses(&mut self, id: LaneId, pulses: usize) -> Result<Armed, ClockError> {
        if pulses > self.ring.horizon() {
            return Err(ClockError::HorizonExceeded {
                requested: pulses,
                horizon: self.ring.horizon(),
            });
        }
        if pulses == 0 {
            return Ok(Armed::Ready(Ok(())));
        }
        if let Some(cancel) = self.refuse_clock_wait(id, true) {
            return Ok(Armed::Ready(Err(cancel)));
        }
        self.ring.insert(pulses, id);
        Ok(self.park(
            id,
            WaitKind::Pulses {
                due: self.elapsed + pulses as u64,
            },
        ))
    }

    /// Park `id` until the next beat boundary.
    pub fn arm_beat(&mut self, id: LaneId) -> Armed {
        if let Some(cancel) = self.refuse_clock_wait(id, true) {
            return Armed::Ready(Err(cancel));
        }
        self.beat_waiters.insert(id);
        self.park(id, WaitKind::Beat)
    }

    /// Park `id` until the next bar boundary. Allowed while stopped.
    pub fn arm_bar(&mut self, id: LaneId) -> Armed {
        if let Some(cancel) = self.refuse_clock_wait(id, false) {
            return Armed::Ready(Err(cancel));
        }
        self.bar_waiters.insert(id);
        self.park(id, WaitKind::Bar)
    }

    /// Park `id` until it is registered.
    pub fn arm_enable(&mut self, id: LaneId) -> Armed {
        if self.registry.is_active(id) {
            return Armed::Ready(Ok(()));
        }
        self.park(id, WaitKind::Enable)
    }

    fn refuse_clock_wait(&self, id: LaneId, needs_running: bool) -> Option<Cancelled> {
        if !self.registry.is_active(id) {
            return Some(Cancelled::lane_disabled());
        }
        if needs_running && self.transport == TransportState::Stopped {
            return Some(Cancelled::transport_stopped());
        }
        None
    }

    fn park(&mut self, id: LaneId, kind: WaitKind) -> Armed {
        let slot = self.registry.slot(id);
        debug_assert!(slot.parked.is_none(), "lane {id} is already waiting");
        slot.parked = Some(kind);
        Armed::Parked(slot.signal.arm())
    }

    /// Poll the outcome of a parked wait.
    pub fn poll_wait(&mut self, id: LaneId, ticket: u64, cx: &mut Context<'_>) -> Poll<WaitResult> {
        let poll = match self.registry.get_mut(id) {
            Some(slot) => slot.signal.poll(ticket, cx),
            None => Poll::Ready(Err(Cancelled::lane_disabled())),
        };
        if poll.is_ready() {
            self.registry.retire(id);
        }
        poll
    }

    /// Withdraw a wait whose future was dropped before it completed.
    pub fn abandon(&mut self, id: LaneId, ticket: u64) {
        let Some(slot) = self.registry.get_mut(id) else {
            return;
        };
        if !slot.signal.disarm(ticket) {
            return;
        }
        // `purge` reads the parked kind, so clear it afterwards.
        if slot.parked.is_some() {
            self.purge(id);
        }
        if let Some(slot) = self.registry.get_mut(id) {
            slot.parked = None;
        }
        self.registry.retire(id);
    }

    /// Remove `id` from whichever clock structure its slot says it is in.
    fn purge(&mut self, id: LaneId) {
        match self.registry.parked(id) {
            Some(WaitKind::Pulses { due }) => {
                let delay = due.saturating_sub(self.elapsed) as usize;
                self.ring.remove(delay, id);
            }
            Some(WaitKind::Beat) => {
                self.beat_waiters.remove(&id);
            }
            Some(WaitKind::Bar) => {
                self.bar_waiters.remove(&id);
            }
            Some(WaitKind::Enable) | None => {}
        }
    }

    fn wake(&mut self, id: LaneId, outcome: WaitResult, out: &mut Wakeups) {
        let Some(slot) = self.registry.get_mut(id) else {
            return;
        };
        slot.parked = None;
        if let Some(w) = slot.signal.fire(outcome) {
            out.wakers.push(w);
        }
        out.woken.push(id);
    }

    // --- introspection ---

    /// Number of lanes parked in the ring, beat or bar waiters.
    pub fn pending_waits(&self) -> usize {
        self.ring.len() + self.beat_waiters.len() + self.bar_waiters.len()
    }

    /// Where `id` is parked, if anywhere.
    pub fn parked(&self, id: LaneId) -> Option<WaitKind> {
        self.registry.parked(id)
    }

    /// Lanes with a slot: active ones and those with a wait still in flight.
    pub fn known_lanes(&self) -> usize {
        self.registry.len()
    }

    /// Check that every lane sits in at most one wait structure and that
    /// the structures agree with the slots.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut seen = BTreeSet::new();
        for id in self
            .ring
            .ids()
            .chain(self.beat_waiters.iter().copied())
            .chain(self.bar_waiters.iter().copied())
        {
            assert!(seen.insert(id), "lane {id} is in more than one wait structure");
            assert!(self.registry.is_active(id), "disabled lane {id} is still waiting");
            assert!(
                self.registry.parked(id).is_some_and(|k| k.is_clock()),
                "lane {id} is waiting without a parked slot"
            );
        }
        for id in self.registry.clock_parked() {
            assert!(seen.contains(&id), "lane {id} is parked but in no structure");
        }
        for id in self.registry.ids() {
            let slot = self.registry.get(id).expect("listed slot");
            assert!(
                slot.active || slot.signal.is_outstanding(),
                "lane {id} kept a slot it no longer needs"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn running() -> PulseScheduler {
        let mut s = PulseScheduler::new(Meter::default(), 96);
        s.on_start(&mut Wakeups::default());
        s
    }

    fn pulse(s: &mut PulseScheduler) -> Vec<LaneId> {
        let mut out = Wakeups::default();
        s.on_pulse(&mut out);
        out.woken
    }

    fn register(s: &mut PulseScheduler, id: LaneId) {
        s.register(id, &mut Wakeups::default());
    }

    #[test]
    fn test_scheduler_creation() {
        let s = PulseScheduler::new(Meter::default(), 384);
        assert_eq!(s.transport(), TransportState::Stopped);
        assert_eq!(s.position(), None);
        assert_eq!(s.horizon(), 384);
        assert_eq!(s.pending_waits(), 0);
    }

    #[test]
    fn test_first_pulse_is_bar_boundary() {
        let mut s = running();
        register(&mut s, 1);
        register(&mut s, 2);
        assert!(matches!(s.arm_bar(2), Armed::Parked(_)));
        assert!(matches!(s.arm_bar(1), Armed::Parked(_)));

        assert_eq!(pulse(&mut s), vec![1, 2]);
        assert_eq!(s.position(), Some(ClockPosition::ORIGIN));
        s.check_invariants();
    }

    #[test]
    fn test_wait_pulses_exact() {
        let mut s = running();
        register(&mut s, 1);
        pulse(&mut s);

        s.arm_pulses(1, 24).unwrap();
        for _ in 0..23 {
            assert!(pulse(&mut s).is_empty());
        }
        assert_eq!(pulse(&mut s), vec![1]);
        assert_eq!(s.parked(1), None);
    }

    #[test]
    fn test_wait_zero_pulses_is_noop() {
        let mut s = running();
        register(&mut s, 1);
        assert_eq!(s.arm_pulses(1, 0), Ok(Armed::Ready(Ok(()))));
        assert_eq!(s.pending_waits(), 0);
        assert_eq!(s.elapsed(), 0);
    }

    #[test]
    fn test_horizon_is_enforced() {
        let mut s = running();
        register(&mut s, 1);
        assert_eq!(
            s.arm_pulses(1, 97),
            Err(ClockError::HorizonExceeded {
                requested: 97,
                horizon: 96
            })
        );
        assert_eq!(s.pending_waits(), 0);
        assert!(matches!(s.arm_pulses(1, 96), Ok(Armed::Parked(_))));
        for _ in 0..95 {
            assert!(pulse(&mut s).is_empty());
        }
        assert_eq!(pulse(&mut s), vec![1]);
    }

    #[test]
    fn test_unregistered_lane_is_refused() {
        let mut s = running();
        assert_eq!(
            s.arm_pulses(5, 3),
            Ok(Armed::Ready(Err(Cancelled::lane_disabled())))
        );
        assert_eq!(s.arm_beat(5), Armed::Ready(Err(Cancelled::lane_disabled())));
        assert_eq!(s.arm_bar(5), Armed::Ready(Err(Cancelled::lane_disabled())));
    }

    #[test]
    fn test_pulse_wait_while_stopped_is_cancelled() {
        let mut s = PulseScheduler::new(Meter::default(), 96);
        register(&mut s, 1);
        assert_eq!(
            s.arm_pulses(1, 3),
            Ok(Armed::Ready(Err(Cancelled::transport_stopped())))
        );
        assert_eq!(
            s.arm_beat(1),
            Armed::Ready(Err(Cancelled::transport_stopped()))
        );
        // Bar waits park until the transport runs.
        assert!(matches!(s.arm_bar(1), Armed::Parked(_)));
    }

    #[test]
    fn test_pulses_ignored_while_stopped() {
        let mut s = PulseScheduler::new(Meter::default(), 96);
        register(&mut s, 1);
        s.arm_bar(1);
        assert!(pulse(&mut s).is_empty());
        assert_eq!(s.position(), None);
    }

    #[test]
    fn test_bar_waiters_survive_start() {
        let mut s = PulseScheduler::new(Meter::default(), 96);
        register(&mut s, 1);
        s.arm_bar(1);
        s.on_start(&mut Wakeups::default());
        assert_eq!(s.pending_waits(), 1);
        assert_eq!(pulse(&mut s), vec![1]);
    }

    #[test]
    fn test_stop_cancels_everything() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut s = running();
        for id in 1..=3 {
            register(&mut s, id);
        }
        pulse(&mut s);
        let Ok(Armed::Parked(t1)) = s.arm_pulses(1, 10) else {
            panic!("not parked");
        };
        s.arm_beat(2);
        s.arm_bar(3);
        for _ in 0..5 {
            pulse(&mut s);
        }

        let mut out = Wakeups::default();
        s.on_stop(&mut out);
        assert_eq!(out.woken, vec![1, 2, 3]);
        assert_eq!(
            out.status,
            vec![StatusEvent::Transport(TransportState::Stopped)]
        );
        assert_eq!(s.pending_waits(), 0);
        assert_eq!(s.position(), None);
        assert_eq!(
            s.poll_wait(1, t1, &mut cx),
            Poll::Ready(Err(Cancelled::transport_stopped()))
        );
        s.check_invariants();

        s.on_start(&mut Wakeups::default());
        pulse(&mut s);
        assert_eq!(s.position(), Some(ClockPosition::ORIGIN));
    }

    #[test]
    fn test_restart_while_running_cancels() {
        let mut s = running();
        register(&mut s, 1);
        s.arm_pulses(1, 4).unwrap();
        let mut out = Wakeups::default();
        s.on_start(&mut out);
        assert_eq!(out.woken, vec![1]);
        assert_eq!(s.transport(), TransportState::Running);
        assert_eq!(s.pending_waits(), 0);
    }

    #[test]
    fn test_unregister_purges_and_cancels() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut s = running();
        register(&mut s, 1);
        let Ok(Armed::Parked(t)) = s.arm_pulses(1, 3) else {
            panic!("not parked");
        };
        pulse(&mut s);

        let mut out = Wakeups::default();
        assert!(s.unregister(1, &mut out));
        assert_eq!(out.woken, vec![1]);
        assert_eq!(s.pending_waits(), 0);
        assert_eq!(
            s.poll_wait(1, t, &mut cx),
            Poll::Ready(Err(Cancelled::lane_disabled()))
        );
        for _ in 0..10 {
            assert!(pulse(&mut s).is_empty());
        }
        assert_eq!(s.known_lanes(), 0);
        s.check_invariants();
    }

    #[test]
    fn test_register_releases_enable_wait() {
        let mut s = running();
        let Armed::Parked(_) = s.arm_enable(4) else {
            panic!("not parked");
        };
        assert_eq!(s.parked(4), Some(WaitKind::Enable));
        // Not a clock wait: a stop leaves it alone.
        let mut out = Wakeups::default();
        s.on_stop(&mut out);
        assert!(out.woken.is_empty());

        let mut out = Wakeups::default();
        s.register(4, &mut out);
        assert_eq!(out.woken, vec![4]);
        assert_eq!(s.parked(4), None);
        assert_eq!(s.arm_enable(4), Armed::Ready(Ok(())));
    }

    #[test]
    fn test_abandon_withdraws_wait() {
        let mut s = running();
        register(&mut s, 1);
        let Ok(Armed::Parked(t)) = s.arm_pulses(1, 2) else {
            panic!("not parked");
        };
        s.abandon(1, t);
        assert_eq!(s.pending_waits(), 0);
        assert!(pulse(&mut s).is_empty());
        assert!(pulse(&mut s).is_empty());
        // The lane may wait again.
        assert!(matches!(s.arm_beat(1), Armed::Parked(_)));
        s.check_invariants();
    }

    #[test]
    fn test_slots_do_not_accumulate() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut s = running();

        // Enable waits for ids that never register, then give up.
        for id in 100..110 {
            let Armed::Parked(t) = s.arm_enable(id) else {
                panic!("not parked");
            };
            s.abandon(id, t);
        }
        assert_eq!(s.known_lanes(), 0);

        // Lanes come and go while waiting.
        for id in 1..=20 {
            register(&mut s, id);
            let Ok(Armed::Parked(t)) = s.arm_pulses(id, 4) else {
                panic!("not parked");
            };
            s.unregister(id, &mut Wakeups::default());
            assert_eq!(s.known_lanes(), 1, "kept until the outcome is read");
            assert!(s.poll_wait(id, t, &mut cx).is_ready());
            assert_eq!(s.known_lanes(), 0);
        }
        s.check_invariants();
    }

    #[test]
    fn test_toggle() {
        let mut s = running();
        let mut out = Wakeups::default();
        assert_eq!(s.toggle(7, &mut out), DisplayToken::IDLE);
        assert!(s.is_active(7));
        assert_eq!(s.toggle(7, &mut out), DisplayToken::DISABLED);
        assert!(!s.is_active(7));
        assert_eq!(s.known_lanes(), 0);
        assert_eq!(
            out.status,
            vec![
                StatusEvent::PadPaint {
                    lane: 7,
                    token: DisplayToken::IDLE
                },
                StatusEvent::PadPaint {
                    lane: 7,
                    token: DisplayToken::DISABLED
                },
            ]
        );
    }

    #[test]
    fn test_clock_phase_status() {
        let mut s = PulseScheduler::new(Meter::new(2, 2), 8);
        s.on_start(&mut Wakeups::default());
        let mut out = Wakeups::default();
        for _ in 0..5 {
            s.on_pulse(&mut out);
        }
        assert_eq!(
            out.status,
            vec![
                StatusEvent::ClockPhase { beat: 0, bar: 0 },
                StatusEvent::ClockPhase { beat: 1, bar: 0 },
                StatusEvent::ClockPhase { beat: 0, bar: 1 },
            ]
        );
    }
}
