//! Demo mode
//!
//! Drives the rig through a fixed oscillation. [`DemoWaveform`] is the pure,
//! infinite sequence of positions; [`DemoSequencer`] walks it on a timer
//! until cancelled.

use crate::domain::models::{ActuatorAngles, ACTUATOR_COUNT, MAX_ANGLE};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Degrees each actuator moves per tick.
pub const DEMO_STEP: u8 = 20;

/// Default time between ticks.
pub const DEMO_TICK: Duration = Duration::from_millis(500);

/// Oscillating positions shared by all four actuators.
///
/// One direction flag serves all actuators: whichever actuator lands on a
/// bound flips it for the next tick. Since all four start together they move
/// in lock-step.
#[derive(Debug, Clone)]
pub struct DemoWaveform {
    angles: [u8; ACTUATOR_COUNT],
    increasing: bool,
}

impl DemoWaveform {
    pub fn new() -> Self {
        Self::starting_at(ActuatorAngles::ZERO, true)
    }

    pub fn starting_at(angles: ActuatorAngles, increasing: bool) -> Self {
        Self {
            angles: angles.as_array(),
            increasing,
        }
    }

    fn step(&mut self) {
        if self.increasing {
            for angle in self.angles.iter_mut() {
                *angle = angle.saturating_add(DEMO_STEP).min(MAX_ANGLE);
                if *angle == MAX_ANGLE {
                    self.increasing = false;
                }
            }
        } else {
            for angle in self.angles.iter_mut() {
                *angle = angle.saturating_sub(DEMO_STEP);
                if *angle == 0 {
                    self.increasing = true;
                }
            }
        }
    }
}

impl Default for DemoWaveform {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for DemoWaveform {
    type Item = ActuatorAngles;

    /// Yields the current tuple, then advances. Never ends.
    fn next(&mut self) -> Option<ActuatorAngles> {
        let current = ActuatorAngles::new(self.angles).ok()?;
        self.step();
        Some(current)
    }
}

/// Running demo task. Dropping the handle does not stop it; call [`shutdown`](Self::shutdown).
pub struct DemoSequencer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DemoSequencer {
    /// Spawn the periodic task. `emit` runs once per tick with the new position.
    pub fn spawn<F>(tick: Duration, mut emit: F) -> Self
    where
        F: FnMut(ActuatorAngles) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            info!("Demo mode started (tick {:?})", tick);
            let mut waveform = DemoWaveform::new();

            loop {
                if token.is_cancelled() {
                    break;
                }
                let Some(angles) = waveform.next() else {
                    break;
                };
                debug!("Demo tick {}", angles);
                emit(angles);

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
            }

            info!("Demo mode stopped");
        });

        Self { cancel, task }
    }

    /// Cancel and wait for the task to exit. Nothing is emitted once this returns.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
