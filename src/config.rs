//! Robot configuration.
//!
//! Every field has a default matching the reference robot, so a config file
//! only needs to list what differs.

use crate::error::ConfigError;
use crate::executor::ExecutionConfig;
use crate::kinematics::DriveGeometry;
use crate::stepper::MotorPins;
use crate::transform::BuilderConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Configuration for building and running programs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub geometry: DriveGeometry,
    pub pins: MotorPins,
    pub execution: ExecutionConfig,
    pub builder: BuilderConfig,
}

impl RobotConfig {
    /// Loads and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        info!(path = %path.display(), "loaded robot config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("geometry.track_width", self.geometry.track_width)?;
        positive("geometry.wheel_radius", self.geometry.wheel_radius)?;
        if self.geometry.steps_per_revolution == 0 {
            return Err(invalid("geometry.steps_per_revolution", "must be non-zero"));
        }

        let exec = &self.execution;
        positive("execution.units_to_meters", exec.units_to_meters)?;
        if exec.drawing_samples < 2 {
            return Err(invalid("execution.drawing_samples", "need at least 2 points"));
        }
        if exec.travel_samples < 2 {
            return Err(invalid("execution.travel_samples", "need at least 2 points"));
        }
        for (field, value) in [
            ("execution.draw_step_delay", exec.draw_step_delay),
            ("execution.travel_step_delay", exec.travel_step_delay),
            ("execution.pen_settle", exec.pen_settle),
            ("execution.pen_change_pause", exec.pen_change_pause),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(invalid(field, format!("{value} is not a valid delay")));
            }
        }

        let mut pins: Vec<u8> = self.pins.left.iter().chain(&self.pins.right).copied().collect();
        pins.sort_unstable();
        if pins.windows(2).any(|w| w[0] == w[1]) {
            return Err(invalid("pins", "a GPIO line is used twice"));
        }

        let builder = &self.builder;
        if !(builder.gap_threshold.is_finite() && builder.gap_threshold >= 0.0) {
            return Err(invalid("builder.gap_threshold", "must be finite and non-negative"));
        }
        positive("builder.degenerate_speed", builder.degenerate_speed)?;
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} must be positive")))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
