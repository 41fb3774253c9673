//! Differential-drive inverse kinematics and step conversion.

use crate::pose::normalize_angle;
use glam::DVec2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::trace;

/// Moves shorter than this are skipped entirely.
pub const MIN_MOTION: f64 = 1e-6;

/// Fixed mechanical parameters of the robot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveGeometry {
    /// Distance between the wheel contact points (m).
    pub track_width: f64,
    /// Wheel radius (m).
    pub wheel_radius: f64,
    /// Half-steps per full wheel revolution.
    pub steps_per_revolution: u32,
}

impl Default for DriveGeometry {
    /// A 28BYJ-48 in half-step mode driving 50.8 mm wheels.
    fn default() -> Self {
        Self {
            track_width: 0.02225,
            wheel_radius: 0.0508,
            steps_per_revolution: 4096,
        }
    }
}

impl DriveGeometry {
    pub fn steps_per_meter(&self) -> f64 {
        f64::from(self.steps_per_revolution) / (2.0 * PI * self.wheel_radius)
    }

    /// Distance each wheel must roll for the center to advance `distance`
    /// while turning by `delta_theta` (counter-clockwise positive).
    pub fn wheel_distances(&self, distance: f64, delta_theta: f64) -> (f64, f64) {
        let half_track = self.track_width / 2.0;
        (
            distance - half_track * delta_theta,
            distance + half_track * delta_theta,
        )
    }

    /// Signed `(left, right)` step counts for a motion; negative is reverse.
    pub fn steps_for_motion(&self, distance: f64, delta_theta: f64) -> (i64, i64) {
        let (left, right) = self.wheel_distances(distance, delta_theta);
        let spm = self.steps_per_meter();
        let steps = ((left * spm).round() as i64, (right * spm).round() as i64);
        trace!(distance, delta_theta, left, right, ?steps, "motion to steps");
        steps
    }

    /// Plans the elementary motion from `from` to `to` for a robot currently
    /// heading `heading`, all in the same frame.
    ///
    /// Returns `None` for moves shorter than [`MIN_MOTION`].
    pub fn plan_motion(&self, from: DVec2, to: DVec2, heading: f64) -> Option<Motion> {
        let delta = to - from;
        let distance = delta.length();
        if distance < MIN_MOTION {
            return None;
        }
        let target = delta.y.atan2(delta.x);
        let delta_theta = normalize_angle(target - heading);
        let (left_steps, right_steps) = self.steps_for_motion(distance, delta_theta);
        Some(Motion {
            distance,
            delta_theta,
            left_steps,
            right_steps,
        })
    }
}

/// One commanded point-to-point move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Motion {
    pub distance: f64,
    pub delta_theta: f64,
    pub left_steps: i64,
    pub right_steps: i64,
}
