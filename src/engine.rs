//! Clock Engine - pulse ingestion and the lane-facing wait API
//!
//! The engine owns the scheduler behind a single lock. One thread feeds it
//! pulse events; lanes call `register`/`unregister` and await the wait
//! futures. Wakers and status events are fired after the lock is released.
//! - Realtime: a clock thread drains a [`PulseSource`], lanes run on threads
//! - Offline: [`OfflineRunner`] steps events by hand and drives lanes on the
//!   deterministic executor

use crate::error::{ClockError, WaitResult};
use crate::executor::LaneExecutor;
use crate::lane::Lane;
use crate::position::{ClockPosition, Meter, TransportState};
use crate::registry::{LaneId, WaitKind};
use crate::scheduler::{Armed, PulseScheduler, Wakeups};
use crate::source::{PulseEvent, PulseSource};
use crate::status::{DisplayToken, NullStatusSink, StatusEvent, StatusSink};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;

/// Configuration for the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub meter: Meter,
    /// Longest single `wait_pulses` request, in pulses.
    pub horizon: usize,
    /// Capacity for channel-backed status sinks.
    pub status_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let meter = Meter::default();
        Self {
            meter,
            // Four bars.
            horizon: meter.pulses_per_bar() as usize * 4,
            status_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ClockError> {
        self.meter.validate()?;
        if self.horizon == 0 {
            return Err(ClockError::InvalidConfig("horizon must be > 0".to_string()));
        }
        if self.status_capacity == 0 {
            return Err(ClockError::InvalidConfig(
                "status_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// The pulse-synchronous scheduler shared by the clock thread and all lanes.
pub struct ClockEngine {
    state: Mutex<PulseScheduler>,
    sink: Arc<dyn StatusSink>,
    config: EngineConfig,
}

impl ClockEngine {
    /// Create a stopped, fully reset engine.
    pub fn new(config: EngineConfig, sink: Arc<dyn StatusSink>) -> Result<Arc<Self>, ClockError> {
        config.validate()?;
        let state = PulseScheduler::new(config.meter, config.horizon);
        Ok(Arc::new(Self {
            state: Mutex::new(state),
            sink,
            config,
        }))
    }

    /// Engine with the default config and no status output.
    pub fn with_defaults() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PulseScheduler::new(
                EngineConfig::default().meter,
                EngineConfig::default().horizon,
            )),
            sink: Arc::new(NullStatusSink),
            config: EngineConfig::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `f` under the lock, then deliver what it produced.
    fn apply<R>(&self, f: impl FnOnce(&mut PulseScheduler, &mut Wakeups) -> R) -> (R, Vec<LaneId>) {
        let mut out = Wakeups::default();
        let r = {
            let mut state = self.state.lock();
            f(&mut state, &mut out)
        };
        for event in out.status {
            self.sink.notify(event);
        }
        for waker in out.wakers {
            waker.wake();
        }
        (r, out.woken)
    }

    // --- clock input ---

    /// Process one pulse. Returns the lanes it woke.
    pub fn on_pulse(&self) -> Vec<LaneId> {
        self.apply(|s, out| s.on_pulse(out)).1
    }

    /// Full reset. Returns the lanes whose waits were cancelled.
    pub fn on_transport_stop(&self) -> Vec<LaneId> {
        self.apply(|s, out| s.on_stop(out)).1
    }

    /// Soft reset and run.
    pub fn on_transport_start(&self) -> Vec<LaneId> {
        self.apply(|s, out| s.on_start(out)).1
    }

    /// Same as start: the grid realigns on the next pulse.
    pub fn on_transport_continue(&self) -> Vec<LaneId> {
        self.apply(|s, out| s.on_start(out)).1
    }

    /// Dispatch one event from a pulse source.
    pub fn handle(&self, event: PulseEvent) -> Vec<LaneId> {
        match event {
            PulseEvent::Pulse => self.on_pulse(),
            PulseEvent::Start => self.on_transport_start(),
            PulseEvent::Continue => self.on_transport_continue(),
            PulseEvent::Stop => self.on_transport_stop(),
        }
    }

    /// Drain `source` until it ends.
    pub fn run(&self, mut source: impl PulseSource) {
        while let Some(event) = source.next_event() {
            self.handle(event);
        }
        tracing::debug!("pulse source finished");
    }

    /// Drain `source` on a dedicated clock thread.
    pub fn spawn_clock_thread<S>(self: &Arc<Self>, source: S) -> std::io::Result<JoinHandle<()>>
    where
        S: PulseSource + Send + 'static,
    {
        let engine = self.clone();
        std::thread::Builder::new()
            .name("clock".to_string())
            .spawn(move || engine.run(source))
    }

    // --- registry ---

    pub fn register(&self, lane: LaneId) -> bool {
        self.apply(|s, out| s.register(lane, out)).0
    }

    pub fn unregister(&self, lane: LaneId) -> bool {
        self.apply(|s, out| s.unregister(lane, out)).0
    }

    pub fn is_active(&self, lane: LaneId) -> bool {
        self.state.lock().is_active(lane)
    }

    /// Flip a lane on or off; the token is also pushed to the status sink.
    pub fn toggle(&self, lane: LaneId) -> DisplayToken {
        self.apply(|s, out| s.toggle(lane, out)).0
    }

    pub fn active_lanes(&self) -> Vec<LaneId> {
        self.state.lock().active_lanes()
    }

    /// Forward a lane's own status event to the sink.
    pub fn notify(&self, event: StatusEvent) {
        self.sink.notify(event);
    }

    // --- waits ---
    //
    // A lane must not start a second wait while one is pending.

    /// Wait exactly `pulses` pulses. Over-horizon requests are rejected here,
    /// before anything is queued.
    pub fn wait_pulses(self: &Arc<Self>, lane: LaneId, pulses: usize) -> Result<Wait, ClockError> {
        let armed = self.state.lock().arm_pulses(lane, pulses)?;
        Ok(Wait::new(self.clone(), lane, armed))
    }

    /// Wait for the next beat boundary.
    pub fn wait_for_beat(self: &Arc<Self>, lane: LaneId) -> Wait {
        let armed = self.state.lock().arm_beat(lane);
        Wait::new(self.clone(), lane, armed)
    }

    /// Wait for the next bar boundary.
    pub fn wait_for_bar(self: &Arc<Self>, lane: LaneId) -> Wait {
        let armed = self.state.lock().arm_bar(lane);
        Wait::new(self.clone(), lane, armed)
    }

    /// Wait until the lane is registered.
    pub fn wait_enabled(self: &Arc<Self>, lane: LaneId) -> Wait {
        let armed = self.state.lock().arm_enable(lane);
        Wait::new(self.clone(), lane, armed)
    }

    // --- introspection ---

    pub fn position(&self) -> Option<ClockPosition> {
        self.state.lock().position()
    }

    pub fn transport(&self) -> TransportState {
        self.state.lock().transport()
    }

    /// Pulses since the last start.
    pub fn elapsed(&self) -> u64 {
        self.state.lock().elapsed()
    }

    /// Lanes parked in the ring or the beat/bar waiters.
    pub fn pending_waits(&self) -> usize {
        self.state.lock().pending_waits()
    }

    pub fn parked(&self, lane: LaneId) -> Option<WaitKind> {
        self.state.lock().parked(lane)
    }
}

enum WaitPhase {
    Ready(WaitResult),
    Parked(u64),
    Done,
}

/// Future for one lane wait.
///
/// Dropping it before completion withdraws the lane from the wait structure.
pub struct Wait {
    engine: Arc<ClockEngine>,
    lane: LaneId,
    phase: WaitPhase,
}

impl Wait {
    fn new(engine: Arc<ClockEngine>, lane: LaneId, armed: Armed) -> Self {
        let phase = match armed {
            Armed::Ready(r) => WaitPhase::Ready(r),
            Armed::Parked(ticket) => WaitPhase::Parked(ticket),
        };
        Self {
            engine,
            lane,
            phase,
        }
    }

    pub fn lane(&self) -> LaneId {
        self.lane
    }

    /// Whether the wait resolved without parking.
    pub fn is_immediate(&self) -> bool {
        matches!(self.phase, WaitPhase::Ready(_))
    }

    /// Block the calling thread until the wait resolves.
    pub fn block(self) -> WaitResult {
        futures::executor::block_on(self)
    }
}

impl Future for Wait {
    type Output = WaitResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.phase, WaitPhase::Done) {
            WaitPhase::Ready(r) => Poll::Ready(r),
            WaitPhase::Parked(ticket) => {
                let poll = this.engine.state.lock().poll_wait(this.lane, ticket, cx);
                if poll.is_pending() {
                    this.phase = WaitPhase::Parked(ticket);
                }
                poll
            }
            WaitPhase::Done => panic!("Wait polled after completion"),
        }
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        if let WaitPhase::Parked(ticket) = self.phase {
            self.engine.state.lock().abandon(self.lane, ticket);
        }
    }
}

/// Steps an engine by hand and runs lanes on the deterministic executor.
pub struct OfflineRunner {
    engine: Arc<ClockEngine>,
    executor: LaneExecutor,
}

impl OfflineRunner {
    pub fn new(engine: Arc<ClockEngine>) -> Self {
        Self {
            engine,
            executor: LaneExecutor::new(),
        }
    }

    pub fn engine(&self) -> &Arc<ClockEngine> {
        &self.engine
    }

    /// Spawn an arbitrary task against the engine.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<ClockEngine>) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        self.executor.spawn(f(self.engine.clone()));
    }

    /// Spawn a lane loop.
    pub fn spawn_lane(&self, lane: Lane) {
        self.executor.spawn(async move {
            let id = lane.id();
            if let Err(e) = lane.run().await {
                tracing::error!(lane = id, error = %e, "lane stopped");
            }
        });
    }

    /// Let every task run until it blocks.
    pub fn settle(&self) -> usize {
        self.executor.run_until_stalled()
    }

    /// Deliver one event and let the woken lanes run. Returns the lanes it woke.
    pub fn send(&mut self, event: PulseEvent) -> Vec<LaneId> {
        self.settle();
        let woken = self.engine.handle(event);
        self.settle();
        woken
    }

    pub fn start(&mut self) -> Vec<LaneId> {
        self.send(PulseEvent::Start)
    }

    pub fn stop(&mut self) -> Vec<LaneId> {
        self.send(PulseEvent::Stop)
    }

    pub fn pulse(&mut self) -> Vec<LaneId> {
        self.send(PulseEvent::Pulse)
    }

    /// Deliver `n` pulses one at a time.
    pub fn pulses(&mut self, n: usize) {
        for _ in 0..n {
            self.pulse();
        }
    }

    pub fn live_tasks(&self) -> usize {
        self.executor.live_tasks()
    }
}
