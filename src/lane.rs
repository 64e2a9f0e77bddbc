//! Lanes - independently scheduled sequencing tasks
//!
//! A lane loops forever: wait to be enabled, wait for the next bar, play one
//! step of its program, repeat. A cancelled wait unwinds the step (held side
//! effects are released by their guards) and sends the lane back to idle.

use crate::context::LaneCtx;
use crate::engine::ClockEngine;
use crate::error::{ClockError, LaneError};
use crate::position::TransportState;
use crate::registry::LaneId;
use crate::status::DisplayToken;
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// What a lane plays once per bar.
pub trait LaneProgram: Send + Sync {
    fn play<'a>(&'a self, ctx: &'a LaneCtx) -> BoxFuture<'a, Result<(), LaneError>>;
}

/// Where a lane is in its loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LanePhase {
    Idle = 0,
    WaitingForBar = 1,
    Active = 2,
    /// The program hit a clock error and the loop ended.
    Failed = 3,
}

impl LanePhase {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => LanePhase::WaitingForBar,
            2 => LanePhase::Active,
            3 => LanePhase::Failed,
            _ => LanePhase::Idle,
        }
    }
}

/// Shared view of a running lane: its phase and swappable program.
#[derive(Clone)]
pub struct LaneHandle {
    id: LaneId,
    engine: Arc<ClockEngine>,
    program: Arc<ArcSwap<Box<dyn LaneProgram>>>,
    phase: Arc<AtomicU8>,
}

impl LaneHandle {
    pub fn id(&self) -> LaneId {
        self.id
    }

    /// A lane parked for the bar while the transport is stopped is idle.
    pub fn phase(&self) -> LanePhase {
        match LanePhase::from_u8(self.phase.load(Ordering::Acquire)) {
            LanePhase::WaitingForBar if self.engine.transport() == TransportState::Stopped => {
                LanePhase::Idle
            }
            phase => phase,
        }
    }

    fn set_phase(&self, phase: LanePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Replace the program. A step already playing finishes with the old one.
    pub fn set_program(&self, program: impl LaneProgram + 'static) {
        self.program.store(Arc::new(Box::new(program)));
    }
}

pub struct Lane {
    ctx: LaneCtx,
    handle: LaneHandle,
}

impl Lane {
    pub fn new(engine: Arc<ClockEngine>, id: LaneId, program: impl LaneProgram + 'static) -> Self {
        let program: Box<dyn LaneProgram> = Box::new(program);
        Self {
            ctx: LaneCtx::new(engine.clone(), id),
            handle: LaneHandle {
                id,
                engine,
                program: Arc::new(ArcSwap::from_pointee(program)),
                phase: Arc::new(AtomicU8::new(LanePhase::Idle as u8)),
            },
        }
    }

    pub fn id(&self) -> LaneId {
        self.handle.id
    }

    pub fn handle(&self) -> LaneHandle {
        self.handle.clone()
    }

    pub fn ctx(&self) -> &LaneCtx {
        &self.ctx
    }

    /// The lane loop. Only returns on a clock error.
    pub async fn run(self) -> Result<(), ClockError> {
        let id = self.id();
        loop {
            self.handle.set_phase(LanePhase::Idle);
            if let Err(c) = self.ctx.wait_enabled().await {
                tracing::debug!(lane = id, reason = %c.reason, "enable wait cancelled");
                continue;
            }

            self.handle.set_phase(LanePhase::WaitingForBar);
            if let Err(c) = self.ctx.wait_for_bar().await {
                tracing::debug!(lane = id, reason = %c.reason, "bar wait cancelled");
                continue;
            }

            self.handle.set_phase(LanePhase::Active);
            let program = self.handle.program.load_full();
            match program.play(&self.ctx).await {
                Ok(()) => {}
                Err(LaneError::Cancelled(c)) => {
                    tracing::debug!(lane = id, reason = %c.reason, "step cancelled");
                    // Repaint over whatever the unwound guards left behind.
                    if self.ctx.is_active() {
                        self.ctx.paint(DisplayToken::IDLE);
                    } else {
                        self.ctx.paint(DisplayToken::DISABLED);
                    }
                }
                Err(LaneError::Clock(e)) => {
                    self.handle.set_phase(LanePhase::Failed);
                    tracing::error!(lane = id, error = %e, "lane program failed");
                    return Err(e);
                }
            }
        }
    }

    /// Run the lane loop on its own thread.
    pub fn spawn_thread(self) -> std::io::Result<JoinHandle<Result<(), ClockError>>> {
        std::thread::Builder::new()
            .name(format!("lane-{}", self.id()))
            .spawn(move || futures::executor::block_on(self.run()))
    }
}

/// Blink the lane's pad: `repeats` times on for `on_pulses`, off for
/// `off_pulses`.
#[derive(Clone, Copy, Debug)]
pub struct Blink {
    pub repeats: u32,
    pub on_pulses: usize,
    pub off_pulses: usize,
}

impl Default for Blink {
    fn default() -> Self {
        Self {
            repeats: 4,
            on_pulses: 6,
            off_pulses: 6,
        }
    }
}

impl LaneProgram for Blink {
    fn play<'a>(&'a self, ctx: &'a LaneCtx) -> BoxFuture<'a, Result<(), LaneError>> {
        Box::pin(async move {
            for _ in 0..self.repeats {
                let lit = ctx.hold_paint(DisplayToken::LIT, DisplayToken::UNLIT);
                ctx.wait_pulses(self.on_pulses).await?;
                lit.release();
                ctx.wait_pulses(self.off_pulses).await?;
            }
            Ok(())
        })
    }
}
