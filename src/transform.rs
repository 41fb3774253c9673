//! Conversion of absolute curves into a chain of frame-local segments.
//!
//! The robot never knows where it is globally. Instead each curve is rewritten
//! in the frame the robot will be in when it starts that curve, i.e. the end
//! pose of everything drawn before it. Executing the segments in order and
//! composing each one's local points through the accumulated pose reproduces
//! the original drawing.
//!
//! The entry point is [`ProgramBuilder`] (or [`build_relative_program`] for the
//! default settings).

use crate::color;
use crate::curve::{CurveDef, PenSpec, RelativeSegment, validate_relative_segment};
use crate::error::ExprError;
use crate::expr::Expr;
use crate::pose::Pose;
use crate::program::Program;
use glam::DVec2;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// What heading to use when a curve ends on a stationary point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingFallback {
    /// Face +X in the curve's frame.
    #[default]
    Zero,
    /// Keep the heading the robot had before the curve.
    KeepPrevious,
}

/// Tunables for program construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Consecutive curves further apart than this get a pen-up travel move.
    pub gap_threshold: f64,
    /// End tangents slower than this are considered degenerate.
    pub degenerate_speed: f64,
    pub heading_fallback: HeadingFallback,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            gap_threshold: 1e-3,
            degenerate_speed: 1e-9,
            heading_fallback: HeadingFallback::Zero,
        }
    }
}

/// Step used for the backward difference at `t_max`.
fn derivative_step(span: f64) -> f64 {
    (1e-3 * span).max(1e-6).min(span / 2.0)
}

/// End pose of `curve` in whatever frame the curve is written in, or `None`
/// for the heading when the end tangent is degenerate.
fn end_pose_parts(
    curve: &CurveDef,
    degenerate_speed: f64,
) -> Result<(DVec2, Option<f64>), ExprError> {
    let end = curve.end_point()?;
    let delta = derivative_step(curve.span().abs());
    let before = curve.point_at(curve.t_max - delta)?;
    let velocity = (end - before) / delta;
    if velocity.length() < degenerate_speed {
        return Ok((end, None));
    }
    Ok((end, Some(velocity.y.atan2(velocity.x))))
}

fn end_pose_with(curve: &CurveDef, config: &BuilderConfig, previous_theta: f64) -> Pose {
    match end_pose_parts(curve, config.degenerate_speed) {
        Ok((end, Some(theta))) => {
            debug!(curve = %curve.name, x = end.x, y = end.y, theta, "end pose");
            Pose::new(end.x, end.y, theta)
        }
        Ok((end, None)) => {
            let theta = match config.heading_fallback {
                HeadingFallback::Zero => 0.0,
                HeadingFallback::KeepPrevious => previous_theta,
            };
            warn!(
                curve = %curve.name,
                t_max = curve.t_max,
                theta,
                "degenerate end tangent; using fallback heading"
            );
            Pose::new(end.x, end.y, theta)
        }
        Err(err) => {
            error!(curve = %curve.name, %err, "failed to evaluate end pose; using origin");
            Pose::ORIGIN
        }
    }
}

/// Pose at the end of `curve`: position `(x(t_max), y(t_max))` and the
/// heading of the end tangent.
///
/// The tangent comes from a backward difference over a step of `1e-3` of the
/// domain (at least `1e-6`, at most half the domain). A stationary end point
/// faces `0.0`. If the curve cannot be evaluated the origin pose is returned
/// and the failure is logged.
pub fn compute_end_pose(curve: &CurveDef) -> Pose {
    end_pose_with(curve, &BuilderConfig::default(), 0.0)
}

/// Rewrites `curve` in the local frame anchored at `anchor`.
///
/// The returned expressions are
///
/// ```text
/// x_rel(t) =  cos θ · (x(t) − ax) + sin θ · (y(t) − ay)
/// y_rel(t) = −sin θ · (x(t) − ax) + cos θ · (y(t) − ay)
/// ```
///
/// with the anchor's `θ`, `ax`, `ay` folded in as exact constants. Pen color
/// is the curve's own, else `default_color`, else black, always normalized.
pub fn wrap_to_relative(
    anchor: Pose,
    curve: &CurveDef,
    default_color: Option<&str>,
) -> RelativeSegment {
    let (sin, cos) = anchor.theta.sin_cos();
    let dx = || curve.x_expr.clone() - Expr::num(anchor.x);
    let dy = || curve.y_expr.clone() - Expr::num(anchor.y);

    let x_rel_expr = Expr::num(cos) * dx() + Expr::num(sin) * dy();
    let y_rel_expr = Expr::num(-sin) * dx() + Expr::num(cos) * dy();

    let requested = curve
        .color
        .as_deref()
        .or(default_color)
        .unwrap_or(color::BLACK);

    debug!(
        curve = %curve.name,
        anchor_x = anchor.x,
        anchor_y = anchor.y,
        anchor_theta = anchor.theta,
        "wrapped curve into local frame"
    );

    RelativeSegment {
        name: curve.name.clone(),
        x_rel_expr,
        y_rel_expr,
        t_min: curve.t_min,
        t_max: curve.t_max,
        pen: PenSpec::new(color::normalize(Some(requested))),
    }
}

/// Straight pen-up move from `from` to `to` over `t ∈ [0, 1]`.
pub fn travel_curve(name: impl Into<String>, from: DVec2, to: DVec2) -> CurveDef {
    let delta = to - from;
    let x = Expr::num(from.x) + Expr::t() * Expr::num(delta.x);
    let y = Expr::num(from.y) + Expr::t() * Expr::num(delta.y);
    CurveDef {
        name: name.into(),
        x_expr: x,
        y_expr: y,
        t_min: 0.0,
        t_max: 1.0,
        color: Some(color::PEN_UP.to_string()),
    }
}

/// Samples `n` points of `segment` and maps them through `start_pose` into the
/// parent frame. Points whose evaluation fails are `None`.
///
/// Used for visualization and checks only; execution works in local frames.
pub fn reconstruct_global_points(
    segment: &RelativeSegment,
    start_pose: Pose,
    n: usize,
) -> Vec<Option<DVec2>> {
    segment
        .sample_params(n)
        .map(|t| match segment.local_point_at(t) {
            Ok(local) => Some(start_pose.transform_point(local)),
            Err(err) => {
                debug!(segment = %segment.name, t, %err, "skipping unevaluable point");
                None
            }
        })
        .collect()
}

/// Builds a [`Program`] from absolute curves.
pub struct ProgramBuilder {
    config: BuilderConfig,
}

/// Accumulator threaded through the build fold.
struct BuildState {
    pose: Pose,
    program: Program,
}

impl ProgramBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// End pose of `curve`, honoring this builder's degenerate-tangent policy.
    pub fn end_pose(&self, curve: &CurveDef, previous: Pose) -> Pose {
        end_pose_with(curve, &self.config, previous.theta)
    }

    /// Converts `curves` into a chain of relative segments.
    ///
    /// Starting from the global origin, every curve after the first whose
    /// start lies further than `gap_threshold` from the current pose is
    /// preceded by a pen-up travel segment. Curves that cannot be evaluated or
    /// produce an invalid segment are logged and dropped; the rest of the
    /// build continues.
    pub fn build(&self, curves: &[CurveDef]) -> Program {
        let initial = BuildState {
            pose: Pose::ORIGIN,
            program: Program::default(),
        };
        let state = curves
            .iter()
            .enumerate()
            .fold(initial, |state, (i, curve)| self.step(state, i, curve));

        info!(
            curves = curves.len(),
            segments = state.program.len(),
            "built relative program"
        );
        state.program
    }

    fn step(&self, mut state: BuildState, index: usize, curve: &CurveDef) -> BuildState {
        let start = match curve.start_point() {
            Ok(p) => p,
            Err(err) => {
                error!(curve = %curve.name, %err, "cannot evaluate curve start; dropping curve");
                return state;
            }
        };

        let gap = state.pose.distance_to(start);
        if index > 0 && gap > self.config.gap_threshold {
            info!(
                curve = %curve.name,
                gap,
                from_x = state.pose.x,
                from_y = state.pose.y,
                "curves disconnected; inserting travel segment"
            );
            let travel = travel_curve(
                format!("travel_to_{}", curve.name),
                state.pose.position(),
                start,
            );
            let segment = wrap_to_relative(state.pose, &travel, Some(color::PEN_UP));
            if validate_relative_segment(&segment) {
                state.program.push(segment);
            }
            state.pose = self.end_pose(&travel, state.pose);
        }

        let segment = wrap_to_relative(state.pose, curve, Some(color::BLACK));
        if !validate_relative_segment(&segment) {
            warn!(curve = %curve.name, "skipping invalid relative segment");
            return state;
        }
        state.program.push(segment);
        // The absolute curve and its relative twin share tangents, so either works here.
        state.pose = self.end_pose(curve, state.pose);
        state
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new(BuilderConfig::default())
    }
}

/// [`ProgramBuilder::build`] with default settings.
pub fn build_relative_program(curves: &[CurveDef]) -> Program {
    ProgramBuilder::default().build(curves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::PenColor;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

    fn curve(name: &str, x: &str, y: &str, t_min: f64, t_max: f64) -> CurveDef {
        CurveDef::new(name, x, y, t_min, t_max, None).unwrap()
    }

    fn assert_pose(pose: Pose, x: f64, y: f64, theta: f64) {
        assert!((pose.x - x).abs() < 1e-6, "x: {} vs {}", pose.x, x);
        assert!((pose.y - y).abs() < 1e-6, "y: {} vs {}", pose.y, y);
        assert!((pose.theta - theta).abs() < 1e-3, "theta: {} vs {}", pose.theta, theta);
    }

    #[test]
    fn end_pose_of_straight_lines() {
        assert_pose(compute_end_pose(&curve("right", "t", "0", 0.0, 1.0)), 1.0, 0.0, 0.0);
        assert_pose(compute_end_pose(&curve("up", "0", "t", 0.0, 1.0)), 0.0, 1.0, FRAC_PI_2);
        assert_pose(compute_end_pose(&curve("diag", "t", "t", 0.0, 1.0)), 1.0, 1.0, FRAC_PI_4);
    }

    #[test]
    fn end_pose_follows_the_arrival_direction() {
        let quarter = curve("quarter", "cos(t)", "sin(t)", 0.0, FRAC_PI_2);
        assert_pose(compute_end_pose(&quarter), 0.0, 1.0, PI);

        // Vertex of a parabola: dy/dt vanishes but dx/dt does not.
        let parabola = curve("vertex", "t", "-(t - 1)**2", 0.0, 1.0);
        assert_pose(compute_end_pose(&parabola), 1.0, 0.0, 0.0);

        // Cusp: the backward difference still sees the approach from lower-left.
        let cusp = curve("cusp", "t**2", "t**2", -1.0, 0.0);
        let pose = compute_end_pose(&cusp);
        assert!((pose.theta + 3.0 * FRAC_PI_4).abs() < 1e-3);
    }

    #[test]
    fn stationary_curve_defaults_heading_to_zero() {
        let still = curve("still", "1", "1", 0.0, 1.0);
        assert_pose(compute_end_pose(&still), 1.0, 1.0, 0.0);

        let keep = ProgramBuilder::new(BuilderConfig {
            heading_fallback: HeadingFallback::KeepPrevious,
            ..Default::default()
        });
        let pose = keep.end_pose(&still, Pose::new(0.0, 0.0, 0.5));
        assert_pose(pose, 1.0, 1.0, 0.5);
    }

    #[test]
    fn end_pose_of_unevaluable_curve_is_origin() {
        let broken = curve("broken", "sqrt(t)", "0", -2.0, -1.0);
        assert_eq!(compute_end_pose(&broken), Pose::ORIGIN);
    }

    #[test]
    fn wrapped_degenerate_curve_has_finite_constants() {
        let still = CurveDef::new("still", "2", "3", 0.0, 1.0, Some("#FF00FF".into())).unwrap();
        let seg = wrap_to_relative(Pose::new(1.0, 1.0, FRAC_PI_4), &still, None);
        assert!(validate_relative_segment(&seg));
        for text in [seg.x_rel_expr.to_string(), seg.y_rel_expr.to_string()] {
            let lower = text.to_lowercase();
            assert!(!lower.contains("nan") && !lower.contains("inf"), "{text}");
        }
    }

    #[test]
    fn pen_color_resolution_order() {
        let red = CurveDef::new("red", "t", "0", 0.0, 1.0, Some("#FF0000".into())).unwrap();
        let plain = curve("plain", "t", "0", 0.0, 1.0);
        let blue = CurveDef::new("blue", "t", "0", 0.0, 1.0, Some("blue".into())).unwrap();

        let color = |c: &CurveDef, default| wrap_to_relative(Pose::ORIGIN, c, default).pen.color;
        assert_eq!(color(&red, Some("#0000FF")), PenColor::Black);
        assert_eq!(color(&plain, Some("#0000FF")), PenColor::Blue);
        assert_eq!(color(&plain, Some("none")), PenColor::Up);
        assert_eq!(color(&plain, None), PenColor::Black);
        assert_eq!(color(&blue, None), PenColor::Blue);
    }

    #[test]
    fn wrapping_then_reconstructing_recovers_the_curve() {
        let arc = curve("arc", "1 - sin(t)", "1 - cos(t)", 0.0, FRAC_PI_2);
        let anchors = [
            Pose::ORIGIN,
            Pose::new(1.0, 0.0, 0.0),
            Pose::new(-0.4, 2.5, 2.3),
            Pose::new(3.0, -1.0, -PI + 0.01),
        ];
        for anchor in anchors {
            let seg = wrap_to_relative(anchor, &arc, None);
            let points = reconstruct_global_points(&seg, anchor, 50);
            assert_eq!(points.len(), 50);
            for (t, p) in seg.sample_params(50).zip(points) {
                let expected = arc.point_at(t).unwrap();
                let p = p.unwrap();
                assert!(p.distance(expected) < 1e-9, "anchor {anchor:?} t {t}");
            }
        }
    }

    #[test]
    fn reconstruction_marks_failed_points() {
        let seg = wrap_to_relative(Pose::ORIGIN, &curve("root", "sqrt(t)", "0", -1.0, 1.0), None);
        let points = reconstruct_global_points(&seg, Pose::ORIGIN, 3);
        assert!(points[0].is_none());
        assert!(points[1].is_some());
        assert!(points[2].is_some());
    }

    #[test]
    fn travel_curve_connects_endpoints() {
        let travel = travel_curve("hop", DVec2::new(1.0, 2.0), DVec2::new(-1.0, 0.5));
        assert_eq!(travel.start_point().unwrap(), DVec2::new(1.0, 2.0));
        assert!(travel.end_point().unwrap().distance(DVec2::new(-1.0, 0.5)) < 1e-12);
        assert_eq!(color::normalize(travel.color.as_deref()), PenColor::Up);
    }

    #[test]
    fn connected_chain_has_no_travel_segments() {
        let curves = vec![
            curve("a", "t", "0", 0.0, 1.0),
            curve("b", "1 + t", "t", 0.0, 1.0),
            curve("c", "2 + t", "1", 0.0, 1.0),
        ];
        let program = build_relative_program(&curves);
        assert_eq!(program.len(), 3);
        assert!(program.iter().all(|s| s.pen.is_drawing()));
    }

    #[test]
    fn disconnected_curves_get_one_travel_segment() {
        let curves = vec![
            curve("left", "t", "0", 0.0, 1.0),
            curve("right", "5 + t", "2", 0.0, 1.0),
        ];
        let program = build_relative_program(&curves);
        let names: Vec<&str> = program.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["left", "travel_to_right", "right"]);
        assert_eq!(program.segments()[1].pen.color, PenColor::Up);
        assert_eq!(program.segments()[1].pen.color.as_str(), "none");
    }

    #[test]
    fn first_curve_off_origin_gets_no_travel() {
        let program = build_relative_program(&[curve("far", "3 + t", "3", 0.0, 1.0)]);
        assert_eq!(program.len(), 1);
    }

    #[test]
    fn bad_curve_is_dropped_without_aborting_the_build() {
        let curves = vec![
            curve("a", "t", "0", 0.0, 1.0),
            curve("broken", "log(t)", "0", -1.0, 0.0),
            curve("b", "1 + t", "0", 0.0, 1.0),
            curve("sliver", "2 + t", "0", 0.0, 1e-12),
        ];
        let program = build_relative_program(&curves);
        let names: Vec<&str> = program.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
