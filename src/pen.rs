//! Pen lift state machine.

use crate::color::PenColor;
use crate::error::PenError;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The mechanism that physically raises and lowers the pen.
pub trait PenActuator {
    fn lower(&mut self, color: PenColor) -> Result<(), PenError>;
    fn raise(&mut self) -> Result<(), PenError>;
}

/// Actuator for robots without a servo: only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingPen;

impl PenActuator for LoggingPen {
    fn lower(&mut self, color: PenColor) -> Result<(), PenError> {
        debug!(%color, "pen actuator lowered");
        Ok(())
    }

    fn raise(&mut self) -> Result<(), PenError> {
        debug!("pen actuator raised");
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PenState {
    #[default]
    Up,
    Down(PenColor),
}

impl PenState {
    pub fn is_down(self) -> bool {
        matches!(self, Self::Down(_))
    }
}

/// Tracks the pen and only drives the actuator on real transitions.
pub struct PenController<P: PenActuator> {
    actuator: P,
    state: PenState,
    settle: Duration,
    change_pause: Duration,
}

impl<P: PenActuator> PenController<P> {
    /// Starts with the pen up.
    pub fn new(actuator: P, settle: Duration, change_pause: Duration) -> Self {
        Self {
            actuator,
            state: PenState::Up,
            settle,
            change_pause,
        }
    }

    pub fn state(&self) -> PenState {
        self.state
    }

    pub fn actuator(&self) -> &P {
        &self.actuator
    }

    pub fn into_actuator(self) -> P {
        self.actuator
    }

    /// Moves the pen into the state a segment asks for.
    pub fn apply(&mut self, color: PenColor) -> Result<(), PenError> {
        if color.is_drawing() {
            self.lower(color)
        } else {
            self.raise()
        }
    }

    /// Lowers the pen with `color` loaded. Swapping inks while down pauses for
    /// the operator first.
    pub fn lower(&mut self, color: PenColor) -> Result<(), PenError> {
        if !color.is_drawing() {
            warn!("asked to lower the pen without ink, ignoring");
            return Ok(());
        }
        match self.state {
            PenState::Down(current) if current == color => return Ok(()),
            PenState::Down(current) => {
                info!(from = %current, to = %color, "changing pen");
                info!(">>> please change the pen");
                pause(self.change_pause);
            }
            PenState::Up => {}
        }
        info!(%color, "PEN DOWN");
        self.actuator.lower(color)?;
        self.state = PenState::Down(color);
        pause(self.settle);
        Ok(())
    }

    /// Raises the pen if it is down.
    pub fn raise(&mut self) -> Result<(), PenError> {
        if !self.state.is_down() {
            return Ok(());
        }
        info!("PEN UP");
        self.actuator.raise()?;
        self.state = PenState::Up;
        pause(self.settle);
        Ok(())
    }
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}
