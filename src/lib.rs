//! Pulse Lanes
//!
//! A pulse-synchronous scheduler that drives many independent "lanes" in
//! lockstep with an external clock (24 pulses per beat plus start/stop):
//! - Exact waits in pulses, or until the next beat/bar boundary
//! - O(1) per-pulse delay ring with a fixed horizon
//! - Dynamic enable/disable of lanes without disturbing the others
//! - Clean global abort on transport stop (every blocked lane is cancelled)
//! - Dual execution modes: realtime (clock thread + lane threads) and
//!   offline (deterministic executor stepped by hand)

pub mod error;
pub mod position;
pub mod ring;
pub mod registry;
pub mod status;
pub mod scheduler;
pub mod source;
pub mod executor;
pub mod engine;
pub mod context;
pub mod lane;
pub mod midi;


pub use context::{Held, LaneCtx};
pub use engine::{ClockEngine, EngineConfig, OfflineRunner, Wait};
pub use error::{CancelReason, Cancelled, ClockError, LaneError, WaitResult};
pub use lane::{Blink, Lane, LaneHandle, LanePhase, LaneProgram};
pub use position::{ClockPosition, Meter, TransportState};
pub use registry::LaneId;
pub use source::{InternalClock, PulseEvent, PulseSource};
pub use status::{ChannelStatusSink, DisplayToken, NullStatusSink, StatusEvent, StatusSink};

#[cfg(feature = "midi-io")]
pub use error::MidiError;
