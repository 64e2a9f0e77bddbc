//! Error types
//!
//! Cancellation is an expected outcome of every wait and is recovered at the
//! lane boundary. Clock errors are programmer errors rejected at the call.

use thiserror::Error;

/// Why a wait was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The transport stopped (or restarted) while the lane was waiting.
    TransportStopped,
    /// The lane was unregistered while waiting, or was not registered at all.
    LaneDisabled,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::TransportStopped => f.write_str("transport stopped"),
            CancelReason::LaneDisabled => f.write_str("lane disabled"),
        }
    }
}

/// Returned when a wait is cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("wait cancelled: {reason}")]
pub struct Cancelled {
    pub reason: CancelReason,
}

impl Cancelled {
    pub fn transport_stopped() -> Self {
        Self {
            reason: CancelReason::TransportStopped,
        }
    }

    pub fn lane_disabled() -> Self {
        Self {
            reason: CancelReason::LaneDisabled,
        }
    }
}

/// Outcome of a single wait: `Ok(())` is a normal wake.
pub type WaitResult = Result<(), Cancelled>;

/// Configuration and call-boundary errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("requested wait of {requested} pulses exceeds the delay horizon of {horizon}")]
    HorizonExceeded { requested: usize, horizon: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Everything a lane step can fail with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaneError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error(transparent)]
    Clock(#[from] ClockError),
}

impl LaneError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LaneError::Cancelled(_))
    }
}

/// MIDI port failures. The engine never sees these; they stay at the edges.
#[cfg(feature = "midi-io")]
#[derive(Error, Debug)]
pub enum MidiError {
    #[error("MIDI init error: {0}")]
    Init(String),

    #[error("MIDI port error: {0}")]
    Port(String),

    #[error("no MIDI port matching '{0}'")]
    PortNotFound(String),

    #[error("MIDI send error: {0}")]
    Send(String),
}

#[cfg(feature = "midi-io")]
impl From<midir::InitError> for MidiError {
    fn from(e: midir::InitError) -> Self {
        MidiError::Init(e.to_string())
    }
}

#[cfg(feature = "midi-io")]
impl From<midir::ConnectError<midir::MidiInput>> for MidiError {
    fn from(e: midir::ConnectError<midir::MidiInput>) -> Self {
        MidiError::Port(e.to_string())
    }
}

#[cfg(feature = "midi-io")]
impl From<midir::ConnectError<midir::MidiOutput>> for MidiError {
    fn from(e: midir::ConnectError<midir::MidiOutput>) -> Self {
        MidiError::Port(e.to_string())
    }
}

#[cfg(feature = "midi-io")]
impl From<midir::SendError> for MidiError {
    fn from(e: midir::SendError) -> Self {
        MidiError::Send(e.to_string())
    }
}
