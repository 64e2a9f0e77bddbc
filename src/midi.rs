//! MIDI edges
//!
//! Decoding of MIDI real-time clock bytes into pulse events, and the SysEx
//! needed to paint a Launchpad-style grid from status events. With the
//! `midi-io` feature, midir-backed clock input and status output.

use crate::position::TransportState;
use crate::registry::LaneId;
use crate::source::PulseEvent;
use crate::status::{DisplayToken, StatusEvent};

pub const TIMING_CLOCK: u8 = 0xF8;
pub const START: u8 = 0xFA;
pub const CONTINUE: u8 = 0xFB;
pub const STOP: u8 = 0xFC;

/// Launchpad Pro SysEx header (after 0xF0).
const LAUNCHPAD_HEADER: [u8; 5] = [0x00, 0x20, 0x29, 0x02, 0x10];
const CMD_SET_LED: u8 = 0x0A;
const CMD_SET_ALL: u8 = 0x0E;
const CMD_FLASH_LED: u8 = 0x23;

/// The side LED used to show the transport.
pub const TRANSPORT_PAD: u8 = 0x63;
const TRANSPORT_RUNNING: u8 = 0x36;
const TRANSPORT_STOPPED: u8 = 0x01;
const TRANSPORT_FLASH: u8 = 0x35;

/// Decode a MIDI real-time message. Everything else is ignored.
pub fn decode_realtime(bytes: &[u8]) -> Option<PulseEvent> {
    match bytes.first()? {
        &TIMING_CLOCK => Some(PulseEvent::Pulse),
        &START => Some(PulseEvent::Start),
        &CONTINUE => Some(PulseEvent::Continue),
        &STOP => Some(PulseEvent::Stop),
        _ => None,
    }
}

/// Grid pad for a 1-based lane number: 8 per row, bottom-left is 11.
pub fn pad_for_lane(lane: LaneId) -> u8 {
    let n = lane.saturating_sub(1);
    let x = n % 8;
    let y = (n / 8) % 8;
    (10 * y + x + 11) as u8
}

fn sysex(body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(body.len() + LAUNCHPAD_HEADER.len() + 2);
    msg.push(0xF0);
    msg.extend_from_slice(&LAUNCHPAD_HEADER);
    msg.extend_from_slice(body);
    msg.push(0xF7);
    msg
}

/// Light one pad with a palette color.
pub fn set_led(pad: u8, color: u8) -> Vec<u8> {
    sysex(&[CMD_SET_LED, pad, color & 0x7F])
}

/// Set every LED to one palette color.
pub fn set_all(color: u8) -> Vec<u8> {
    sysex(&[CMD_SET_ALL, color & 0x7F])
}

/// Flash one pad.
pub fn flash_led(pad: u8, color: u8) -> Vec<u8> {
    sysex(&[CMD_FLASH_LED, pad, color & 0x7F])
}

/// Messages that render a status event on the grid.
pub fn render_status(event: &StatusEvent) -> Vec<Vec<u8>> {
    match *event {
        StatusEvent::PadPaint {
            lane,
            token: DisplayToken(color),
        } => vec![set_led(pad_for_lane(lane), color)],
        StatusEvent::Transport(TransportState::Running) => vec![
            set_led(TRANSPORT_PAD, TRANSPORT_RUNNING),
            flash_led(TRANSPORT_PAD, TRANSPORT_FLASH),
        ],
        StatusEvent::Transport(TransportState::Stopped) => {
            vec![set_led(TRANSPORT_PAD, TRANSPORT_STOPPED)]
        }
        StatusEvent::ClockPhase { .. } => Vec::new(),
    }
}

#[cfg(feature = "midi-io")]
pub use io::{list_input_ports, list_output_ports, MidiClockInput, MidiStatusOutput};

#[cfg(feature = "midi-io")]
mod io {
    use super::{decode_realtime, render_status, set_all, set_led, TRANSPORT_PAD, TRANSPORT_STOPPED};
    use crate::error::MidiError;
    use crate::source::PulseEvent;
    use crate::status::{ChannelStatusSink, StatusEvent};
    use crossbeam_channel::{Receiver, Sender};
    use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
    use std::thread::{self, JoinHandle};

    pub fn list_input_ports() -> Result<Vec<String>, MidiError> {
        let input = MidiInput::new("pulse_lanes-list")?;
        Ok(input
            .ports()
            .iter()
            .filter_map(|p| input.port_name(p).ok())
            .collect())
    }

    pub fn list_output_ports() -> Result<Vec<String>, MidiError> {
        let output = MidiOutput::new("pulse_lanes-list")?;
        Ok(output
            .ports()
            .iter()
            .filter_map(|p| output.port_name(p).ok())
            .collect())
    }

    /// Receives clock bytes from an input port and forwards pulse events.
    pub struct MidiClockInput {
        _conn: MidiInputConnection<()>,
        port_name: String,
    }

    impl MidiClockInput {
        /// Connect to the first input port whose name contains `name`.
        pub fn connect(name: &str, tx: Sender<PulseEvent>) -> Result<Self, MidiError> {
            let mut input = MidiInput::new("pulse_lanes-clock")?;
            // Timing messages are filtered by default.
            input.ignore(Ignore::None);

            let needle = name.to_lowercase();
            let port = input
                .ports()
                .into_iter()
                .find(|p| {
                    input
                        .port_name(p)
                        .map(|n| n.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
                .ok_or_else(|| MidiError::PortNotFound(name.to_string()))?;
            let port_name = input.port_name(&port).unwrap_or_else(|_| name.to_string());

            let conn = input.connect(
                &port,
                "pulse_lanes-clock-in",
                move |_stamp, bytes, _| {
                    if let Some(event) = decode_realtime(bytes) {
                        let _ = tx.send(event);
                    }
                },
                (),
            )?;
            tracing::info!(port = %port_name, "MIDI clock connected");
            Ok(Self {
                _conn: conn,
                port_name,
            })
        }

        pub fn port_name(&self) -> &str {
            &self.port_name
        }
    }

    /// Renders status events to an output port from a dedicated thread.
    pub struct MidiStatusOutput {
        thread: JoinHandle<()>,
    }

    impl MidiStatusOutput {
        /// Connect to the first output port whose name contains `name` and
        /// return the sink that feeds it.
        pub fn connect(name: &str, capacity: usize) -> Result<(Self, ChannelStatusSink), MidiError> {
            let output = MidiOutput::new("pulse_lanes-status")?;
            let needle = name.to_lowercase();
            let port = output
                .ports()
                .into_iter()
                .find(|p| {
                    output
                        .port_name(p)
                        .map(|n| n.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
                .ok_or_else(|| MidiError::PortNotFound(name.to_string()))?;
            let mut conn = output.connect(&port, "pulse_lanes-status-out")?;
            conn.send(&set_all(0))?;
            conn.send(&set_led(TRANSPORT_PAD, TRANSPORT_STOPPED))?;

            let (sink, rx) = ChannelStatusSink::new(capacity);
            let thread = thread::Builder::new()
                .name("midi-status-out".to_string())
                .spawn(move || Self::drain(conn, rx))
                .map_err(|e| MidiError::Port(e.to_string()))?;
            Ok((Self { thread }, sink))
        }

        fn drain(mut conn: MidiOutputConnection, rx: Receiver<StatusEvent>) {
            for event in rx.iter() {
                for msg in render_status(&event) {
                    if let Err(e) = conn.send(&msg) {
                        tracing::debug!(error = %e, "status send failed");
                    }
                }
            }
            conn.close();
        }

        /// Wait for the writer to finish; it exits once every sink is dropped.
        pub fn join(self) {
            let _ = self.thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_realtime() {
        assert_eq!(decode_realtime(&[0xF8]), Some(PulseEvent::Pulse));
        assert_eq!(decode_realtime(&[0xFA]), Some(PulseEvent::Start));
        assert_eq!(decode_realtime(&[0xFB]), Some(PulseEvent::Continue));
        assert_eq!(decode_realtime(&[0xFC]), Some(PulseEvent::Stop));
        assert_eq!(decode_realtime(&[0x90, 60, 100]), None);
        assert_eq!(decode_realtime(&[]), None);
    }

    #[test]
    fn test_pad_for_lane() {
        assert_eq!(pad_for_lane(1), 11);
        assert_eq!(pad_for_lane(8), 18);
        assert_eq!(pad_for_lane(9), 21);
        assert_eq!(pad_for_lane(64), 88);
    }

    #[test]
    fn test_set_led_framing() {
        assert_eq!(
            set_led(11, 0x03),
            vec![0xF0, 0x00, 0x20, 0x29, 0x02, 0x10, 0x0A, 11, 0x03, 0xF7]
        );
    }

    #[test]
    fn test_render_status() {
        let msgs = render_status(&StatusEvent::PadPaint {
            lane: 9,
            token: DisplayToken::LIT,
        });
        assert_eq!(msgs, vec![set_led(21, 0x03)]);

        let msgs = render_status(&StatusEvent::Transport(TransportState::Running));
        assert_eq!(msgs.len(), 2);
        assert!(render_status(&StatusEvent::ClockPhase { beat: 1, bar: 0 }).is_empty());
    }
}
