//! Lane Context
//!
//! The API a lane program sees: wait primitives bound to one lane id,
//! status output, and scoped side effects that are undone on cancellation.

use crate::engine::ClockEngine;
use crate::error::{Cancelled, LaneError};
use crate::position::{ClockPosition, Meter};
use crate::registry::LaneId;
use crate::status::{DisplayToken, StatusEvent};
use std::sync::Arc;

/// A handle to the engine bound to one lane.
#[derive(Clone)]
pub struct LaneCtx {
    engine: Arc<ClockEngine>,
    lane: LaneId,
}

impl LaneCtx {
    pub fn new(engine: Arc<ClockEngine>, lane: LaneId) -> Self {
        Self { engine, lane }
    }

    pub fn lane(&self) -> LaneId {
        self.lane
    }

    pub fn engine(&self) -> &Arc<ClockEngine> {
        &self.engine
    }

    pub fn meter(&self) -> Meter {
        self.engine.config().meter
    }

    pub fn position(&self) -> Option<ClockPosition> {
        self.engine.position()
    }

    pub fn is_active(&self) -> bool {
        self.engine.is_active(self.lane)
    }

    /// Wait exactly `pulses` pulses.
    pub async fn wait_pulses(&self, pulses: usize) -> Result<(), LaneError> {
        self.engine.wait_pulses(self.lane, pulses)?.await?;
        Ok(())
    }

    /// Wait a whole number of beats, measured in pulses from now.
    pub async fn wait_beats(&self, beats: u32) -> Result<(), LaneError> {
        let pulses = beats as usize * self.meter().pulses_per_beat as usize;
        self.wait_pulses(pulses).await
    }

    pub async fn wait_for_beat(&self) -> Result<(), Cancelled> {
        self.engine.wait_for_beat(self.lane).await
    }

    pub async fn wait_for_bar(&self) -> Result<(), Cancelled> {
        self.engine.wait_for_bar(self.lane).await
    }

    /// Park until this lane is registered.
    pub async fn wait_enabled(&self) -> Result<(), Cancelled> {
        self.engine.wait_enabled(self.lane).await
    }

    /// Push a status event through the engine's sink.
    pub fn notify(&self, event: StatusEvent) {
        self.engine.notify(event);
    }

    /// Paint this lane's pad.
    pub fn paint(&self, token: DisplayToken) {
        self.notify(StatusEvent::PadPaint {
            lane: self.lane,
            token,
        });
    }

    /// Run `on` now and return a guard that runs `off` when released or
    /// dropped, so an output switched on before a wait is switched off again
    /// if the wait is cancelled.
    pub fn hold<F: FnOnce()>(&self, on: impl FnOnce(), off: F) -> Held<F> {
        on();
        Held { release: Some(off) }
    }

    /// Paint `on` and hold it until `off` is painted.
    pub fn hold_paint(&self, on: DisplayToken, off: DisplayToken) -> Held<impl FnOnce()> {
        let ctx = self.clone();
        self.hold(move || self.paint(on), move || ctx.paint(off))
    }
}

/// A side effect that must be undone exactly once.
#[must_use = "dropping a Held releases it immediately"]
pub struct Held<F: FnOnce()> {
    release: Option<F>,
}

impl<F: FnOnce()> Held<F> {
    /// Release now.
    pub fn release(mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl<F: FnOnce()> Drop for Held<F> {
    fn drop(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::status::ChannelStatusSink;
    use futures::FutureExt;
    use std::cell::Cell;

    #[test]
    fn test_held_releases_once() {
        let engine = ClockEngine::with_defaults();
        let ctx = LaneCtx::new(engine, 1);
        let count = Cell::new(0);

        let h = ctx.hold(|| count.set(count.get() + 10), || count.set(count.get() + 1));
        assert_eq!(count.get(), 10);
        h.release();
        assert_eq!(count.get(), 11);

        {
            let _h = ctx.hold(|| {}, || count.set(count.get() + 1));
        }
        assert_eq!(count.get(), 12);
    }

    #[test]
    fn test_hold_paint() {
        let (sink, rx) = ChannelStatusSink::new(8);
        let engine = ClockEngine::new(EngineConfig::default(), Arc::new(sink)).unwrap();
        let ctx = LaneCtx::new(engine, 3);
        let h = ctx.hold_paint(DisplayToken::LIT, DisplayToken::UNLIT);
        drop(h);
        let tokens: Vec<_> = rx
            .try_iter()
            .map(|e| match e {
                StatusEvent::PadPaint { lane, token } => (lane, token),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(tokens, vec![(3, DisplayToken::LIT), (3, DisplayToken::UNLIT)]);
    }

    #[test]
    fn test_wait_beats_converts_to_pulses() {
        let engine = ClockEngine::with_defaults();
        engine.on_transport_start();
        engine.register(1);
        let ctx = LaneCtx::new(engine.clone(), 1);

        let mut fut = Box::pin(ctx.wait_beats(1));
        assert!(fut.as_mut().now_or_never().is_none());
        for _ in 0..23 {
            engine.on_pulse();
        }
        assert!(fut.as_mut().now_or_never().is_none());
        engine.on_pulse();
        assert_eq!(fut.as_mut().now_or_never(), Some(Ok(())));
    }

    #[test]
    fn test_wait_on_disabled_lane_is_cancelled() {
        let engine = ClockEngine::with_defaults();
        engine.on_transport_start();
        let ctx = LaneCtx::new(engine, 9);
        let r = ctx.wait_pulses(4).now_or_never();
        assert_eq!(r, Some(Err(LaneError::Cancelled(Cancelled::lane_disabled()))));
    }
}
