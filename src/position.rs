//! Clock Position - pulse/beat/bar counters
//!
//! Converts a stream of pulses into a musical grid under a fixed meter.

use crate::error::ClockError;

/// MIDI standard pulses per quarter note.
pub const DEFAULT_PULSES_PER_BEAT: u32 = 24;

/// Fixed subdivision of the incoming pulse stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Meter {
    pub pulses_per_beat: u32,
    pub beats_per_bar: u32,
}

impl Default for Meter {
    fn default() -> Self {
        Self {
            pulses_per_beat: DEFAULT_PULSES_PER_BEAT,
            beats_per_bar: 4,
        }
    }
}

impl Meter {
    pub fn new(pulses_per_beat: u32, beats_per_bar: u32) -> Self {
        Self {
            pulses_per_beat,
            beats_per_bar,
        }
    }

    /// Number of pulses in one bar.
    pub fn pulses_per_bar(&self) -> u32 {
        self.pulses_per_beat * self.beats_per_bar
    }

    pub fn validate(&self) -> Result<(), ClockError> {
        if self.pulses_per_beat == 0 {
            return Err(ClockError::InvalidConfig(
                "pulses_per_beat must be > 0".to_string(),
            ));
        }
        if self.beats_per_bar == 0 {
            return Err(ClockError::InvalidConfig(
                "beats_per_bar must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Run state of the external transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    Stopped,
    Running,
}

/// Where the clock is on the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockPosition {
    /// Pulse within the beat, `0..pulses_per_beat`.
    pub pulse: u32,
    /// Beat within the bar, `0..beats_per_bar`.
    pub beat: u32,
    /// Bars since the last start.
    pub bar: u64,
}

impl ClockPosition {
    /// The first pulse after a reset.
    pub const ORIGIN: ClockPosition = ClockPosition {
        pulse: 0,
        beat: 0,
        bar: 0,
    };

    /// The position one pulse later.
    pub fn advance(self, meter: &Meter) -> Self {
        let mut next = self;
        next.pulse += 1;
        if next.pulse >= meter.pulses_per_beat {
            next.pulse = 0;
            next.beat += 1;
            if next.beat >= meter.beats_per_bar {
                next.beat = 0;
                next.bar += 1;
            }
        }
        next
    }

    pub fn is_beat_boundary(&self) -> bool {
        self.pulse == 0
    }

    pub fn is_bar_boundary(&self) -> bool {
        self.pulse == 0 && self.beat == 0
    }

    /// Pulses elapsed since the origin.
    pub fn to_pulses(&self, meter: &Meter) -> u64 {
        self.bar * meter.pulses_per_bar() as u64
            + (self.beat * meter.pulses_per_beat + self.pulse) as u64
    }
}

impl std::fmt::Display for ClockPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.bar + 1, self.beat + 1, self.pulse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_wraps_beat_and_bar() {
        let meter = Meter::default();
        let mut p = ClockPosition::ORIGIN;
        for _ in 0..23 {
            p = p.advance(&meter);
        }
        assert_eq!(p, ClockPosition { pulse: 23, beat: 0, bar: 0 });

        p = p.advance(&meter);
        assert!(p.is_beat_boundary());
        assert!(!p.is_bar_boundary());
        assert_eq!(p.beat, 1);

        for _ in 0..72 {
            p = p.advance(&meter);
        }
        assert!(p.is_bar_boundary());
        assert_eq!(p.bar, 1);
    }

    #[test]
    fn test_to_pulses() {
        let meter = Meter::new(24, 4);
        let p = ClockPosition { pulse: 5, beat: 2, bar: 1 };
        assert_eq!(p.to_pulses(&meter), 96 + 48 + 5);
    }

    #[test]
    fn test_meter_validate() {
        assert!(Meter::default().validate().is_ok());
        assert!(Meter::new(0, 4).validate().is_err());
        assert!(Meter::new(24, 0).validate().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ClockPosition::ORIGIN.to_string(), "1.1.0");
    }
}
