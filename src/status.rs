//! Status notifications
//!
//! The engine pushes phase and lane-state changes to a [`StatusSink`]. Sinks
//! must return immediately; the engine never waits on them.

use crate::position::TransportState;
use crate::registry::LaneId;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque display value for a lane's pad. Carries no scheduling meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DisplayToken(pub u8);

impl DisplayToken {
    /// Lane disabled.
    pub const DISABLED: DisplayToken = DisplayToken(0x00);
    /// Lane enabled and idle.
    pub const IDLE: DisplayToken = DisplayToken(0x01);
    /// Lane output on.
    pub const LIT: DisplayToken = DisplayToken(0x03);
    /// Lane output off mid-step.
    pub const UNLIT: DisplayToken = DisplayToken(0x40);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    PadPaint,
    ClockPhase,
    TransportChange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    PadPaint { lane: LaneId, token: DisplayToken },
    /// Emitted on every beat boundary.
    ClockPhase { beat: u32, bar: u64 },
    Transport(TransportState),
}

impl StatusEvent {
    pub fn kind(&self) -> StatusKind {
        match self {
            StatusEvent::PadPaint { .. } => StatusKind::PadPaint,
            StatusEvent::ClockPhase { .. } => StatusKind::ClockPhase,
            StatusEvent::Transport(_) => StatusKind::TransportChange,
        }
    }

    pub fn lane(&self) -> Option<LaneId> {
        match self {
            StatusEvent::PadPaint { lane, .. } => Some(*lane),
            _ => None,
        }
    }

    /// Numeric payload: pad token, beat index, or 1/0 for running/stopped.
    pub fn value(&self) -> u32 {
        match self {
            StatusEvent::PadPaint { token, .. } => token.0 as u32,
            StatusEvent::ClockPhase { beat, .. } => *beat,
            StatusEvent::Transport(TransportState::Running) => 1,
            StatusEvent::Transport(TransportState::Stopped) => 0,
        }
    }
}

/// Push-only receiver of status events.
pub trait StatusSink: Send + Sync {
    fn notify(&self, event: StatusEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn notify(&self, _event: StatusEvent) {}
}

/// Forwards events into a bounded channel, dropping them when it is full.
pub struct ChannelStatusSink {
    tx: Sender<StatusEvent>,
    dropped: AtomicU64,
}

impl ChannelStatusSink {
    /// Create a sink and the receiver its consumer drains.
    pub fn new(capacity: usize) -> (Self, Receiver<StatusEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl StatusSink for ChannelStatusSink {
    fn notify(&self, event: StatusEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    tracing::warn!(dropped = n, "status consumer is behind, dropping events");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("status consumer gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let e = StatusEvent::PadPaint {
            lane: 4,
            token: DisplayToken::LIT,
        };
        assert_eq!(e.kind(), StatusKind::PadPaint);
        assert_eq!(e.lane(), Some(4));
        assert_eq!(e.value(), 3);

        let e = StatusEvent::Transport(TransportState::Running);
        assert_eq!(e.kind(), StatusKind::TransportChange);
        assert_eq!(e.lane(), None);
        assert_eq!(e.value(), 1);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, rx) = ChannelStatusSink::new(2);
        for beat in 0..5 {
            sink.notify(StatusEvent::ClockPhase { beat, bar: 0 });
        }
        assert_eq!(sink.dropped(), 3);
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], StatusEvent::ClockPhase { beat: 0, bar: 0 });
    }

    #[test]
    fn test_channel_sink_disconnected_is_silent() {
        let (sink, rx) = ChannelStatusSink::new(1);
        drop(rx);
        sink.notify(StatusEvent::Transport(TransportState::Stopped));
        assert_eq!(sink.dropped(), 0);
    }
}
