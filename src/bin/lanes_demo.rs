//! Sixty-four lane demo for the pulse scheduler
//!
//! Every lane blinks its pad four times per bar, locked to the clock.
//!
//! Usage:
//!   cargo run --bin lanes_demo -- --bpm 120 --bars 4 --lanes 64
//!   cargo run --bin lanes_demo --features midi-io -- --list
//!   cargo run --bin lanes_demo --features midi-io -- --clock-in "IAC" --status-out "Launchpad"
//!
//! Without `--clock-in` the internal clock drives the lanes. Set `RUST_LOG`
//! to `debug` or `trace` to see lane and pulse activity.

use crossbeam_channel::{unbounded, Receiver};
use pulse_lanes::{
    Blink, ChannelStatusSink, ClockEngine, EngineConfig, InternalClock, Lane, LaneId, PulseEvent,
    StatusEvent, StatusSink, TransportState,
};
use std::env;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Args {
    bpm: f64,
    bars: u64,
    lanes: u32,
    #[cfg_attr(not(feature = "midi-io"), allow(dead_code))]
    clock_in: Option<String>,
    #[cfg_attr(not(feature = "midi-io"), allow(dead_code))]
    status_out: Option<String>,
    #[cfg_attr(not(feature = "midi-io"), allow(dead_code))]
    list: bool,
}

fn print_usage() {
    println!("lanes_demo - blink lanes in lockstep with a pulse clock");
    println!();
    println!("Options:");
    println!("  --bpm <f64>          internal clock tempo (default 120)");
    println!("  --bars <n>           bars to play before stopping (default 4)");
    println!("  --lanes <n>          number of lanes, 1-64 (default 64)");
    println!("  --clock-in <name>    follow a MIDI clock input port (midi-io)");
    println!("  --status-out <name>  paint pads on a MIDI output port (midi-io)");
    println!("  --list, -l           list MIDI ports (midi-io)");
    println!("  --help, -h           show this help");
}

fn value(args: &[String], i: usize) -> Result<String, String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| format!("missing value for {}", args[i]))
}

fn parse_args() -> Result<Option<Args>, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args {
        bpm: 120.0,
        bars: 4,
        lanes: 64,
        clock_in: None,
        status_out: None,
        list: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bpm" => {
                parsed.bpm = value(&args, i)?.parse()?;
                i += 1;
            }
            "--bars" => {
                parsed.bars = value(&args, i)?.parse()?;
                i += 1;
            }
            "--lanes" => {
                parsed.lanes = value(&args, i)?.parse()?;
                i += 1;
            }
            "--clock-in" => {
                parsed.clock_in = Some(value(&args, i)?);
                i += 1;
            }
            "--status-out" => {
                parsed.status_out = Some(value(&args, i)?);
                i += 1;
            }
            "--list" | "-l" => parsed.list = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other => return Err(format!("unknown argument '{other}'").into()),
        }
        i += 1;
    }

    if !(1..=64).contains(&parsed.lanes) {
        return Err(format!("--lanes must be 1-64, got {}", parsed.lanes).into());
    }
    Ok(Some(parsed))
}

/// True once a transport that has been running reports stopped.
fn transport_ended(was_running: bool, now: TransportState) -> bool {
    was_running && now == TransportState::Stopped
}

/// Log status events from the engine's sink.
fn spawn_status_logger(rx: Receiver<StatusEvent>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("status-log".to_string())
        .spawn(move || {
            for event in rx.iter() {
                match event {
                    StatusEvent::ClockPhase { beat: 0, bar } => {
                        tracing::info!(bar = bar + 1, "bar");
                    }
                    StatusEvent::Transport(state) => tracing::info!(?state, "transport"),
                    other => tracing::trace!(?other, "status"),
                }
            }
        })
}

#[cfg(feature = "midi-io")]
fn list_ports() -> Result<(), Box<dyn std::error::Error>> {
    println!("MIDI inputs:");
    for (i, name) in pulse_lanes::midi::list_input_ports()?.iter().enumerate() {
        println!("  {i}: {name}");
    }
    println!("MIDI outputs:");
    for (i, name) in pulse_lanes::midi::list_output_ports()?.iter().enumerate() {
        println!("  {i}: {name}");
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };

    #[cfg(feature = "midi-io")]
    {
        if args.list {
            return list_ports();
        }
    }

    let config = EngineConfig::default();

    // Status output: a MIDI grid when asked for, otherwise the log.
    #[cfg(feature = "midi-io")]
    let mut status_out = None;
    let sink: Arc<dyn StatusSink> = {
        #[cfg(feature = "midi-io")]
        let midi_sink = match &args.status_out {
            Some(name) => {
                let (out, sink) =
                    pulse_lanes::midi::MidiStatusOutput::connect(name, config.status_capacity)?;
                status_out = Some(out);
                Some(sink)
            }
            None => None,
        };
        #[cfg(not(feature = "midi-io"))]
        let midi_sink: Option<ChannelStatusSink> = None;

        match midi_sink {
            Some(sink) => Arc::new(sink),
            None => {
                let (sink, rx) = ChannelStatusSink::new(config.status_capacity);
                spawn_status_logger(rx)?;
                Arc::new(sink)
            }
        }
    };

    let engine = ClockEngine::new(config, sink)?;

    for id in 1..=args.lanes as LaneId {
        engine.register(id);
        Lane::new(engine.clone(), id, Blink::default()).spawn_thread()?;
    }
    tracing::info!(lanes = args.lanes, bars = args.bars, "lanes ready");

    // Clock input: external MIDI clock or the internal generator.
    let (tx, rx) = unbounded();
    let clock_thread = engine.spawn_clock_thread(rx)?;

    #[cfg(feature = "midi-io")]
    let midi_clock = match &args.clock_in {
        Some(name) => Some(pulse_lanes::midi::MidiClockInput::connect(name, tx.clone())?),
        None => None,
    };
    #[cfg(not(feature = "midi-io"))]
    let midi_clock: Option<()> = None;

    let internal = match midi_clock {
        Some(_) => None,
        None => Some(InternalClock::spawn(
            args.bpm,
            engine.config().meter.pulses_per_beat,
            tx.clone(),
        )?),
    };

    // Play until the bar after the last one starts, the transport stops after
    // running, or the clock goes away.
    let mut was_running = false;
    loop {
        thread::sleep(Duration::from_millis(10));
        let transport = engine.transport();
        let finished = engine.position().is_some_and(|p| p.bar >= args.bars);
        if finished || transport_ended(was_running, transport) || clock_thread.is_finished() {
            break;
        }
        was_running |= transport == TransportState::Running;
    }

    // Stops go through the clock thread, the only writer of clock state.
    match internal {
        Some(clock) => clock.stop(),
        None => {
            let _ = tx.send(PulseEvent::Stop);
        }
    }
    drop(tx);
    #[cfg(feature = "midi-io")]
    drop(midi_clock);
    let _ = clock_thread.join();

    #[cfg(feature = "midi-io")]
    drop(status_out);

    tracing::info!(bars = args.bars, "demo complete");
    Ok(())
}
