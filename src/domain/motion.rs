use crate::domain::models::{ActuatorAngles, ACTUATOR_COUNT};

/// Decides which slider movements are worth an upload.
///
/// Each slider keeps its own baseline, starting at 0. While dragged, a slider
/// triggers an upload once it is at least `threshold` degrees away from its
/// baseline, and only that slider's baseline moves. Releasing a slider always
/// uploads and leaves the baselines alone.
pub struct MotionGate {
    threshold: u8,
    baselines: [u8; ACTUATOR_COUNT],
}

impl MotionGate {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            baselines: [0; ACTUATOR_COUNT],
        }
    }

    /// Sliders dragged to `target`. Returns the position to upload, if any.
    pub fn drag(&mut self, target: ActuatorAngles) -> Option<ActuatorAngles> {
        let mut triggered = false;
        for (baseline, to) in self.baselines.iter_mut().zip(target.as_array()) {
            if baseline.abs_diff(to) >= self.threshold {
                *baseline = to;
                triggered = true;
            }
        }
        triggered.then_some(target)
    }

    /// Slider released at `target`.
    pub fn release(&self, target: ActuatorAngles) -> ActuatorAngles {
        target
    }

    /// The device moved without operator input (download or demo tick).
    pub fn rebase(&mut self, position: ActuatorAngles) {
        self.baselines = position.as_array();
    }
}
