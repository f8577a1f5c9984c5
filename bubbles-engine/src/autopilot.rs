//! Autopilot: synthetic local movement on a fixed tick.
//!
//! The path is a Lissajous figure whose phase is seeded from the
//! participant id, so two autopiloted sessions trace different curves.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::lifecycle::LifecycleState;
use crate::pointer::LocalPointer;
use crate::session::{EventSink, SessionEvent};

/// Deterministic movement policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutopilotPath {
    /// Peak distance from the origin, logical units
    pub amplitude: f64,
    /// Ticks per horizontal period
    pub period_x: u64,
    /// Ticks per vertical period
    pub period_y: u64,
    phase: f64,
}

impl AutopilotPath {
    pub fn new(seed: Uuid) -> Self {
        Self {
            amplitude: 400.0,
            period_x: 160,
            period_y: 240,
            phase: (seed.as_u128() % 360) as f64 / 360.0 * TAU,
        }
    }

    /// Position after `step` ticks.
    pub fn position_at(&self, step: u64) -> (i32, i32) {
        let tx = (step % self.period_x) as f64 / self.period_x as f64;
        let ty = (step % self.period_y) as f64 / self.period_y as f64;
        let x = self.amplitude * (TAU * tx + self.phase).sin();
        let y = self.amplitude * (TAU * ty + self.phase / 2.0).cos();
        (x.round() as i32, y.round() as i32)
    }
}

/// Tick until the session ends.
///
/// Ticks are skipped while the session is not Running; while Paused the
/// driver sleeps on the lifecycle and re-arms its interval on resume.
pub(crate) async fn drive(
    path: AutopilotPath,
    pointer: Arc<LocalPointer>,
    mut state_rx: watch::Receiver<LifecycleState>,
    events: EventSink,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut step = 0u64;

    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            LifecycleState::Stopped | LifecycleState::Failed => break,
            LifecycleState::Running => {}
            _ => {
                if state_rx.changed().await.is_err() {
                    break;
                }
                interval.reset();
                continue;
            }
        }

        tokio::select! {
            _ = interval.tick() => {}
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        let (x, y) = path.position_at(step);
        step = step.wrapping_add(1);
        if pointer.autopilot_move(x, y) {
            log::trace!("Autopilot moved to ({x}, {y})");
            events.emit(SessionEvent::AutopilotMoved { x, y });
        }
    }
    log::debug!("Autopilot stopped");
}
