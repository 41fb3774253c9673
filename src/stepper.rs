//! Two-motor half-step driver.
//!
//! Both wheels are stepped from a single loop: the wheel with more steps to do
//! (the major axis) steps every iteration and the other one is interleaved with
//! an integer error accumulator, the same way a line rasterizer spreads the
//! minor coordinate across the major one.

use crate::error::MotorError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Coil activation pattern for each of the 8 half-step phases (IN1..IN4).
pub const HALF_STEP_SEQUENCE: [[bool; 4]; 8] = [
    [true, false, false, true],
    [true, false, false, false],
    [true, true, false, false],
    [false, true, false, false],
    [false, true, true, false],
    [false, false, true, false],
    [false, false, true, true],
    [false, false, false, true],
];

/// Digital output lines driving the motor coils.
///
/// Implemented by real GPIO backends and by [`SimulatedOutput`].
pub trait MotorOutput {
    /// Configures `pins` as outputs.
    fn setup(&mut self, pins: &[u8]) -> Result<(), MotorError>;

    /// Drives one pin high or low.
    fn output(&mut self, pin: u8, high: bool) -> Result<(), MotorError>;

    /// Releases the outputs.
    fn cleanup(&mut self) -> Result<(), MotorError>;
}

/// In-memory stand-in for GPIO: remembers the level of every pin and counts
/// writes.
#[derive(Debug, Default)]
pub struct SimulatedOutput {
    levels: HashMap<u8, bool>,
    writes: u64,
    cleaned_up: bool,
}

impl SimulatedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels.get(&pin).copied()
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }

    /// True when every configured pin is low.
    pub fn all_low(&self) -> bool {
        self.levels.values().all(|high| !high)
    }
}

impl MotorOutput for SimulatedOutput {
    fn setup(&mut self, pins: &[u8]) -> Result<(), MotorError> {
        for &pin in pins {
            self.levels.insert(pin, false);
        }
        self.cleaned_up = false;
        debug!(?pins, "simulated outputs configured");
        Ok(())
    }

    fn output(&mut self, pin: u8, high: bool) -> Result<(), MotorError> {
        let level = self
            .levels
            .get_mut(&pin)
            .ok_or(MotorError::PinNotConfigured(pin))?;
        *level = high;
        self.writes += 1;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), MotorError> {
        self.cleaned_up = true;
        debug!(writes = self.writes, "simulated outputs released");
        Ok(())
    }
}

/// GPIO lines (BCM numbering) for the four coils of each motor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorPins {
    pub left: [u8; 4],
    pub right: [u8; 4],
}

impl Default for MotorPins {
    fn default() -> Self {
        Self {
            left: [5, 6, 26, 21],
            right: [17, 27, 22, 16],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Wheel {
    Left,
    Right,
}

/// Phase and signed position of one motor. Persists for the whole run so
/// the coil sequence stays continuous across motions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotorState {
    /// Index into [`HALF_STEP_SEQUENCE`].
    pub phase: u8,
    /// Net commanded steps, forward positive.
    pub position: i64,
}

/// What a synchronized move actually issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncReport {
    pub major: Wheel,
    pub major_steps: u64,
    pub minor_steps: u64,
}

/// Owns the motor outputs and the per-motor phase state.
pub struct StepperDriver<M: MotorOutput> {
    output: M,
    pins: MotorPins,
    left: MotorState,
    right: MotorState,
}

impl<M: MotorOutput> StepperDriver<M> {
    /// Configures every coil pin and drives it low.
    pub fn new(mut output: M, pins: MotorPins) -> Result<Self, MotorError> {
        let all: Vec<u8> = pins.left.iter().chain(&pins.right).copied().collect();
        output.setup(&all)?;
        for &pin in &all {
            output.output(pin, false)?;
        }
        info!(left = ?pins.left, right = ?pins.right, "motor driver ready");
        Ok(Self {
            output,
            pins,
            left: MotorState::default(),
            right: MotorState::default(),
        })
    }

    pub fn state(&self, wheel: Wheel) -> MotorState {
        match wheel {
            Wheel::Left => self.left,
            Wheel::Right => self.right,
        }
    }

    pub fn output(&self) -> &M {
        &self.output
    }

    /// Advances one wheel by a single half-step.
    ///
    /// `forward` is in robot terms; the right motor is mounted mirrored, so its
    /// phase runs the opposite way for the same direction.
    pub fn step(&mut self, wheel: Wheel, forward: bool) -> Result<(), MotorError> {
        let (state, pins, phase_dir) = match wheel {
            Wheel::Left => (&mut self.left, &self.pins.left, 1),
            Wheel::Right => (&mut self.right, &self.pins.right, -1),
        };
        let dir: i8 = if forward { 1 } else { -1 };
        state.phase = (i16::from(state.phase) + i16::from(dir * phase_dir)).rem_euclid(8) as u8;
        state.position += i64::from(dir);

        let pattern = HALF_STEP_SEQUENCE[usize::from(state.phase)];
        for (&pin, &high) in pins.iter().zip(&pattern) {
            self.output.output(pin, high)?;
        }
        Ok(())
    }

    /// Steps both wheels so they start and finish together.
    ///
    /// The major wheel steps `max(|left|, |right|)` times; the minor wheel's
    /// `min(|left|, |right|)` steps are spread evenly between them. Each
    /// iteration is followed by `step_delay`.
    pub fn execute_synchronized(
        &mut self,
        left_steps: i64,
        right_steps: i64,
        step_delay: Duration,
    ) -> Result<SyncReport, MotorError> {
        let (left_count, right_count) = (left_steps.unsigned_abs(), right_steps.unsigned_abs());
        let (major, minor, major_count, minor_count, major_fwd, minor_fwd) =
            if left_count >= right_count {
                let (fwd, other) = (left_steps >= 0, right_steps >= 0);
                (Wheel::Left, Wheel::Right, left_count, right_count, fwd, other)
            } else {
                let (fwd, other) = (right_steps >= 0, left_steps >= 0);
                (Wheel::Right, Wheel::Left, right_count, left_count, fwd, other)
            };

        let mut minor_done = 0;
        let mut error = 0;
        for _ in 0..major_count {
            self.step(major, major_fwd)?;
            error += minor_count;
            if error >= major_count {
                self.step(minor, minor_fwd)?;
                error -= major_count;
                minor_done += 1;
            }
            if !step_delay.is_zero() {
                thread::sleep(step_delay);
            }
        }
        // Each major step adds `minor` to the error and each minor step removes
        // `major`, with the error kept in [0, major): exactly `minor` minor steps.
        debug_assert_eq!(minor_done, minor_count);

        trace!(left_steps, right_steps, ?major, "synchronized move");
        Ok(SyncReport {
            major,
            major_steps: major_count,
            minor_steps: minor_done,
        })
    }

    /// Drives every coil low so the motors stop drawing current.
    pub fn deenergize(&mut self) -> Result<(), MotorError> {
        for &pin in self.pins.left.iter().chain(&self.pins.right) {
            self.output.output(pin, false)?;
        }
        debug!("motors de-energized");
        Ok(())
    }

    /// De-energizes and releases the outputs, handing them back.
    pub fn shutdown(mut self) -> Result<M, MotorError> {
        self.deenergize()?;
        self.output.cleanup()?;
        info!(left = self.left.position, right = self.right.position, "motor driver shut down");
        Ok(self.output)
    }
}
