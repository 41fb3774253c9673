//! Planar pose and frame operations.

use glam::DVec2;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Wraps an angle into `(-π, π]`.
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI { wrapped + TAU } else { wrapped }
}

/// A rigid 2D position plus heading.
///
/// Heading is in radians, counter-clockwise from +X, kept in `(-π, π]` by
/// every constructor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose {
    /// The global origin facing +X.
    pub const ORIGIN: Pose = Pose {
        x: 0.0,
        y: 0.0,
        theta: 0.0,
    };

    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            x,
            y,
            theta: normalize_angle(theta),
        }
    }

    pub fn position(&self) -> DVec2 {
        DVec2::new(self.x, self.y)
    }

    /// Unit vector along the heading.
    pub fn heading(&self) -> DVec2 {
        DVec2::from_angle(self.theta)
    }

    /// Maps a point expressed in this pose's local frame into the parent frame.
    pub fn transform_point(&self, local: DVec2) -> DVec2 {
        self.heading().rotate(local) + self.position()
    }

    /// `self ⊕ other`: applies `other`, expressed in this pose's frame.
    pub fn compose(&self, other: &Pose) -> Pose {
        let p = self.transform_point(other.position());
        Pose::new(p.x, p.y, self.theta + other.theta)
    }

    pub fn distance_to(&self, point: DVec2) -> f64 {
        self.position().distance(point)
    }
}
