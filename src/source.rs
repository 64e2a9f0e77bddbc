//! Pulse sources
//!
//! A pulse source is an ordered, single-producer stream of transport events.
//! The engine drains one on its clock thread.

use crossbeam_channel::{Receiver, Sender};
use spin_sleep::SpinSleeper;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One event from the external clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PulseEvent {
    Pulse,
    Start,
    Continue,
    Stop,
}

/// Blocking stream of clock events. `None` means the source is finished.
pub trait PulseSource {
    fn next_event(&mut self) -> Option<PulseEvent>;
}

impl PulseSource for Receiver<PulseEvent> {
    fn next_event(&mut self) -> Option<PulseEvent> {
        self.recv().ok()
    }
}

/// A fixed sequence of events, mostly for tests and offline rendering.
pub struct Scripted<I>(pub I);

impl<I: Iterator<Item = PulseEvent>> PulseSource for Scripted<I> {
    fn next_event(&mut self) -> Option<PulseEvent> {
        self.0.next()
    }
}

/// Convenience: `start`, then `pulses` pulses, then `stop`.
pub fn script(pulses: usize) -> Scripted<impl Iterator<Item = PulseEvent>> {
    Scripted(
        std::iter::once(PulseEvent::Start)
            .chain(std::iter::repeat(PulseEvent::Pulse).take(pulses))
            .chain(std::iter::once(PulseEvent::Stop)),
    )
}

/// Free-running pulse generator for when no external clock is attached.
///
/// Pulses are scheduled against a fixed anchor so sleep overshoot never
/// accumulates.
pub struct InternalClock {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InternalClock {
    /// Emit `Start` and then pulses at `bpm` with `pulses_per_beat` into `tx`.
    pub fn spawn(bpm: f64, pulses_per_beat: u32, tx: Sender<PulseEvent>) -> std::io::Result<Self> {
        let bpm = if bpm.is_finite() && bpm > 0.0 { bpm } else { 120.0 };
        let period = Duration::from_secs_f64(60.0 / (bpm * pulses_per_beat.max(1) as f64));
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = thread::Builder::new()
            .name("internal-clock".to_string())
            .spawn(move || {
                let sleeper = SpinSleeper::default();
                if tx.send(PulseEvent::Start).is_err() {
                    return;
                }
                let anchor = Instant::now();
                let mut n: u32 = 0;
                while flag.load(Ordering::Relaxed) {
                    let due = anchor + period * n;
                    let now = Instant::now();
                    if due > now {
                        sleeper.sleep(due - now);
                    }
                    if tx.send(PulseEvent::Pulse).is_err() {
                        return;
                    }
                    n = n.wrapping_add(1);
                }
                let _ = tx.send(PulseEvent::Stop);
            })?;

        tracing::debug!(bpm, "internal clock started");
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Send `Stop` and wait for the generator thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for InternalClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}
