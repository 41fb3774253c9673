//! Runs a [`Program`] on the robot.
//!
//! Each segment is sampled in its own local frame and driven point to point.
//! Frames are chained the same way [`Program::anchors`] chains them, so the
//! robot follows the geometry the program describes even where the last chord
//! of a segment leaves it pointing slightly off the curve's end tangent.
//!
//! The pen is raised and the motors de-energized on every way out of
//! [`Plotter::run`], including interruption, errors and panics.

use crate::color::PenColor;
use crate::config::RobotConfig;
use crate::curve::RelativeSegment;
use crate::error::{ExecutionError, MotorError};
use crate::kinematics::DriveGeometry;
use crate::pen::{PenActuator, PenController};
use crate::pose::{Pose, normalize_angle};
use crate::program::Program;
use crate::stepper::{MotorOutput, StepperDriver};
use glam::DVec2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Timing and sampling parameters of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Points sampled per pen-down segment.
    pub drawing_samples: usize,
    /// Points sampled per travel segment.
    pub travel_samples: usize,
    /// Seconds between iterations of the stepping loop while drawing.
    pub draw_step_delay: f64,
    /// Seconds between iterations of the stepping loop while travelling.
    pub travel_step_delay: f64,
    /// Scale from curve units to meters. Curves are authored in feet.
    pub units_to_meters: f64,
    /// Seconds the pen takes to settle after moving.
    pub pen_settle: f64,
    /// Seconds given to the operator to swap inks.
    pub pen_change_pause: f64,
    /// Log progress every this many points (0 disables).
    pub progress_every: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            drawing_samples: 100,
            travel_samples: 50,
            draw_step_delay: 0.002,
            travel_step_delay: 0.001,
            units_to_meters: 0.3048,
            pen_settle: 0.3,
            pen_change_pause: 0.5,
            progress_every: 20,
        }
    }
}

impl ExecutionConfig {
    /// No delays at all, for simulation and tests.
    pub fn instant() -> Self {
        Self {
            draw_step_delay: 0.0,
            travel_step_delay: 0.0,
            pen_settle: 0.0,
            pen_change_pause: 0.0,
            ..Self::default()
        }
    }

    pub fn step_delay(&self, drawing: bool) -> Duration {
        seconds(if drawing {
            self.draw_step_delay
        } else {
            self.travel_step_delay
        })
    }

    pub fn samples(&self, drawing: bool) -> usize {
        if drawing {
            self.drawing_samples
        } else {
            self.travel_samples
        }
    }

    pub fn pen_settle_delay(&self) -> Duration {
        seconds(self.pen_settle)
    }

    pub fn pen_change_delay(&self) -> Duration {
        seconds(self.pen_change_pause)
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Live state of the robot, in meters and radians.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RobotState {
    pub pose: Pose,
    pub pen_down: bool,
    /// Ink currently loaded, once the pen has been lowered at least once.
    pub color: Option<PenColor>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionPhase {
    #[default]
    Idle,
    Running,
    Done,
}

/// Shared flag for asking a running program to stop.
///
/// Checked before every segment's pen move and before every elementary
/// motion, so a stop request never cuts a synchronized move in half and never
/// lowers the pen after it arrives.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a completed run did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionSummary {
    pub segments_executed: usize,
    pub segments_skipped: usize,
    pub motions: usize,
    /// Absolute half-steps issued per wheel.
    pub left_steps: u64,
    pub right_steps: u64,
    pub final_pose: Pose,
}

/// Drives the motors and pen through programs.
pub struct Plotter<M: MotorOutput, P: PenActuator> {
    driver: StepperDriver<M>,
    pen: PenController<P>,
    geometry: DriveGeometry,
    config: ExecutionConfig,
    state: RobotState,
    phase: ExecutionPhase,
}

impl<M: MotorOutput, P: PenActuator> Plotter<M, P> {
    /// Configures the motor outputs. The robot starts at the origin, pen up.
    pub fn new(output: M, actuator: P, config: &RobotConfig) -> Result<Self, MotorError> {
        let driver = StepperDriver::new(output, config.pins.clone())?;
        let pen = PenController::new(
            actuator,
            config.execution.pen_settle_delay(),
            config.execution.pen_change_delay(),
        );
        Ok(Self {
            driver,
            pen,
            geometry: config.geometry.clone(),
            config: config.execution.clone(),
            state: RobotState::default(),
            phase: ExecutionPhase::Idle,
        })
    }

    pub fn state(&self) -> &RobotState {
        &self.state
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    pub fn driver(&self) -> &StepperDriver<M> {
        &self.driver
    }

    pub fn pen(&self) -> &PenController<P> {
        &self.pen
    }

    /// Executes every segment of `program` in order, starting from the origin.
    ///
    /// Unusable points and segments are skipped with a warning. Motor or pen
    /// failures and cancellation abort the run; the cleanup has already
    /// happened when the error is returned.
    pub fn run(
        &mut self,
        program: &Program,
        cancel: &CancelToken,
    ) -> Result<ExecutionSummary, ExecutionError> {
        let Self {
            driver,
            pen,
            geometry,
            config,
            state,
            phase,
        } = self;

        *state = RobotState::default();
        *phase = ExecutionPhase::Running;
        info!(segments = program.len(), "starting drawing program");

        let mut run = Run {
            guard: Cleanup {
                driver,
                pen,
                armed: true,
            },
            geometry,
            config,
            state,
            summary: ExecutionSummary::default(),
        };

        let total = program.len();
        let mut outcome = Ok(());
        for (index, (segment, anchor)) in program.iter().zip(program.anchors()).enumerate() {
            info!(
                segment = %segment.name,
                n = index + 1,
                total,
                color = %segment.pen.color,
                t_min = segment.t_min,
                t_max = segment.t_max,
                "executing segment"
            );
            if let Err(err) = run.segment(segment, anchor, cancel) {
                outcome = Err(err);
                break;
            }
        }

        let Run {
            guard,
            state,
            mut summary,
            ..
        } = run;
        let cleanup = guard.finish();
        *phase = ExecutionPhase::Done;
        state.pen_down = false;
        summary.final_pose = state.pose;

        match (outcome, cleanup) {
            (Err(ExecutionError::Interrupted), _) => {
                warn!(
                    pose = ?state.pose,
                    "drawing interrupted, pen raised and motors released"
                );
                Err(ExecutionError::Interrupted)
            }
            (Err(err), _) => {
                error!(%err, "drawing aborted");
                Err(err)
            }
            (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => {
                info!(
                    executed = summary.segments_executed,
                    skipped = summary.segments_skipped,
                    motions = summary.motions,
                    pose = ?summary.final_pose,
                    "drawing program complete"
                );
                Ok(summary)
            }
        }
    }

    /// Releases the motor outputs and hands back the backends.
    pub fn shutdown(self) -> Result<(M, P), MotorError> {
        let Self { driver, pen, .. } = self;
        let output = driver.shutdown()?;
        Ok((output, pen.into_actuator()))
    }
}

/// Raises the pen and de-energizes the motors when dropped, unless
/// [`Cleanup::finish`] already did.
struct Cleanup<'a, M: MotorOutput, P: PenActuator> {
    driver: &'a mut StepperDriver<M>,
    pen: &'a mut PenController<P>,
    armed: bool,
}

impl<M: MotorOutput, P: PenActuator> Cleanup<'_, M, P> {
    /// Both steps are always attempted; the first failure is returned.
    fn release(&mut self) -> Result<(), ExecutionError> {
        self.armed = false;
        let pen = self.pen.raise();
        let motors = self.driver.deenergize();
        pen?;
        motors?;
        Ok(())
    }

    fn finish(mut self) -> Result<(), ExecutionError> {
        self.release()
    }
}

impl<M: MotorOutput, P: PenActuator> Drop for Cleanup<'_, M, P> {
    fn drop(&mut self) {
        if self.armed
            && let Err(err) = self.release()
        {
            error!(%err, "cleanup after aborted run failed");
        }
    }
}

/// Borrowed state of one [`Plotter::run`] call.
struct Run<'a, M: MotorOutput, P: PenActuator> {
    guard: Cleanup<'a, M, P>,
    geometry: &'a DriveGeometry,
    config: &'a ExecutionConfig,
    state: &'a mut RobotState,
    summary: ExecutionSummary,
}

impl<M: MotorOutput, P: PenActuator> Run<'_, M, P> {
    fn segment(
        &mut self,
        segment: &RelativeSegment,
        anchor: Pose,
        cancel: &CancelToken,
    ) -> Result<(), ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Interrupted);
        }
        let color = segment.pen.color;
        let drawing = color.is_drawing();

        self.guard.pen.apply(color)?;
        self.state.pen_down = drawing;
        if drawing {
            self.state.color = Some(color);
        }

        let points = self.sample(segment, drawing);
        if points.len() < 2 {
            warn!(
                segment = %segment.name,
                points = points.len(),
                "too few usable points, skipping segment"
            );
            self.summary.segments_skipped += 1;
            return Ok(());
        }
        debug!(segment = %segment.name, points = points.len(), "sampled segment");

        let scale = self.config.units_to_meters;
        let frame = Pose::new(anchor.x * scale, anchor.y * scale, anchor.theta);
        let delay = self.config.step_delay(drawing);
        let every = self.config.progress_every;

        let mut current = DVec2::ZERO;
        for (i, &target) in points.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Interrupted);
            }
            let heading = normalize_angle(self.state.pose.theta - frame.theta);
            if let Some(motion) = self.geometry.plan_motion(current, target, heading) {
                debug!(
                    distance_mm = motion.distance * 1000.0,
                    delta_theta_deg = motion.delta_theta.to_degrees(),
                    left = motion.left_steps,
                    right = motion.right_steps,
                    "moving"
                );
                self.guard
                    .driver
                    .execute_synchronized(motion.left_steps, motion.right_steps, delay)?;

                let global = frame.transform_point(target);
                let theta = self.state.pose.theta + motion.delta_theta;
                self.state.pose = Pose::new(global.x, global.y, theta);
                self.summary.motions += 1;
                self.summary.left_steps += motion.left_steps.unsigned_abs();
                self.summary.right_steps += motion.right_steps.unsigned_abs();
            }
            current = target;

            if every > 0 && (i + 1) % every == 0 {
                info!(
                    segment = %segment.name,
                    percent = 100.0 * (i + 1) as f64 / points.len() as f64,
                    x = self.state.pose.x,
                    y = self.state.pose.y,
                    heading_deg = self.state.pose.theta.to_degrees(),
                    "progress"
                );
            }
        }

        self.summary.segments_executed += 1;
        info!(segment = %segment.name, pose = ?self.state.pose, "segment complete");
        Ok(())
    }

    /// Local points in meters. Points that fail to evaluate are dropped.
    fn sample(&self, segment: &RelativeSegment, drawing: bool) -> Vec<DVec2> {
        let scale = self.config.units_to_meters;
        segment
            .sample_params(self.config.samples(drawing))
            .filter_map(|t| match segment.local_point_at(t) {
                Ok(p) => Some(p * scale),
                Err(err) => {
                    warn!(segment = %segment.name, t, %err, "skipping unevaluable point");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::PenSpec;
    use crate::error::PenError;
    use crate::expr::Expr;
    use crate::pen::{LoggingPen, PenState};
    use crate::stepper::SimulatedOutput;
    use std::f64::consts::{FRAC_PI_2, TAU};

    fn config() -> RobotConfig {
        RobotConfig {
            execution: ExecutionConfig {
                units_to_meters: 1.0,
                ..ExecutionConfig::instant()
            },
            ..RobotConfig::default()
        }
    }

    fn segment(name: &str, x: &str, y: &str, t_max: f64, color: PenColor) -> RelativeSegment {
        RelativeSegment {
            name: name.into(),
            x_rel_expr: Expr::parse(x).unwrap(),
            y_rel_expr: Expr::parse(y).unwrap(),
            t_min: 0.0,
            t_max,
            pen: PenSpec::new(color),
        }
    }

    fn plotter() -> Plotter<SimulatedOutput, LoggingPen> {
        Plotter::new(SimulatedOutput::new(), LoggingPen, &config()).unwrap()
    }

    #[test]
    fn square_returns_to_the_origin() {
        // After the first side every frame is rotated a quarter turn, so each
        // remaining side runs along its local y axis.
        let first = segment("a", "0.05 * t", "0", 1.0, PenColor::Black);
        let side = |name: &str| segment(name, "0", "0.05 * t", 1.0, PenColor::Black);
        let program = Program::from_segments(vec![first, side("b"), side("c"), side("d")]);

        let mut plotter = plotter();
        let summary = plotter.run(&program, &CancelToken::new()).unwrap();

        assert_eq!(summary.segments_executed, 4);
        assert_eq!(plotter.phase(), ExecutionPhase::Done);
        assert_eq!(plotter.pen().state(), PenState::Up);
        assert!(plotter.driver().output().all_low());

        let pose = plotter.state().pose;
        assert!(pose.x.abs() < 1e-9, "{pose:?}");
        assert!(pose.y.abs() < 1e-9, "{pose:?}");
        assert!((pose.theta + FRAC_PI_2).abs() < 1e-9, "{pose:?}");
    }

    #[test]
    fn position_follows_the_chained_frames() {
        // The last chord of the circle is not its end tangent; the following
        // line is still laid out in the frame the program describes.
        let circle = segment(
            "circle",
            "0.1 * sin(t)",
            "0.1 * (1 - cos(t))",
            TAU,
            PenColor::Black,
        );
        let line = segment("line", "0.05 * t", "0", 1.0, PenColor::Blue);
        let program = Program::from_segments(vec![circle, line]);

        let mut plotter = plotter();
        plotter.run(&program, &CancelToken::new()).unwrap();

        let traced = program.trace(100);
        let expected = *traced[1].points.last().unwrap();
        let pose = plotter.state().pose;
        assert!(pose.position().distance(expected) < 1e-9, "{pose:?} vs {expected:?}");
        assert!(pose.y.abs() > 1e-5, "line should start from the tangent frame");
    }

    #[test]
    fn step_totals_match_straight_distance() {
        let program =
            Program::from_segments(vec![segment("l", "0.1 * t", "0", 1.0, PenColor::Blue)]);
        let mut plotter = plotter();
        let summary = plotter.run(&program, &CancelToken::new()).unwrap();

        let expected = 0.1 * plotter.geometry.steps_per_meter();
        assert!((summary.left_steps as f64 - expected).abs() <= summary.motions as f64);
        assert_eq!(summary.left_steps, summary.right_steps);
        assert_eq!(summary.motions, 99);
        assert_eq!(plotter.state().color, Some(PenColor::Blue));
    }

    #[test]
    fn cancellation_raises_the_pen_and_releases_motors() {
        let program =
            Program::from_segments(vec![segment("l", "0.1 * t", "0", 1.0, PenColor::Black)]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut plotter = plotter();
        let err = plotter.run(&program, &cancel).unwrap_err();
        assert!(matches!(err, ExecutionError::Interrupted));
        assert_eq!(plotter.pen().state(), PenState::Up);
        assert!(plotter.driver().output().all_low());
        assert_eq!(plotter.phase(), ExecutionPhase::Done);
        assert!(!plotter.state().pen_down);
    }

    #[test]
    fn cancelling_during_a_motion_keeps_the_pen_up() {
        /// Requests a stop the first time a coil is energized.
        struct Tripwire {
            inner: SimulatedOutput,
            cancel: CancelToken,
        }
        impl MotorOutput for Tripwire {
            fn setup(&mut self, pins: &[u8]) -> Result<(), MotorError> {
                self.inner.setup(pins)
            }
            fn output(&mut self, pin: u8, high: bool) -> Result<(), MotorError> {
                if high {
                    self.cancel.cancel();
                }
                self.inner.output(pin, high)
            }
            fn cleanup(&mut self) -> Result<(), MotorError> {
                self.inner.cleanup()
            }
        }

        #[derive(Default)]
        struct Recorder {
            calls: Vec<Option<PenColor>>,
        }
        impl PenActuator for Recorder {
            fn lower(&mut self, color: PenColor) -> Result<(), PenError> {
                self.calls.push(Some(color));
                Ok(())
            }
            fn raise(&mut self) -> Result<(), PenError> {
                self.calls.push(None);
                Ok(())
            }
        }

        // Two travel samples: the only motion of the travel segment is its
        // last, and the stop arrives while it runs.
        let mut config = config();
        config.execution.travel_samples = 2;
        let cancel = CancelToken::new();
        let output = Tripwire {
            inner: SimulatedOutput::new(),
            cancel: cancel.clone(),
        };
        let program = Program::from_segments(vec![
            segment("travel", "0.01 * t", "0", 1.0, PenColor::Up),
            segment("draw", "0", "0.01 * t", 1.0, PenColor::Black),
        ]);

        let mut plotter = Plotter::new(output, Recorder::default(), &config).unwrap();
        let err = plotter.run(&program, &cancel).unwrap_err();

        assert!(matches!(err, ExecutionError::Interrupted));
        assert!(plotter.pen().actuator().calls.is_empty());
        assert_eq!(plotter.pen().state(), PenState::Up);
        assert!(plotter.driver().output().inner.all_low());
        assert!(plotter.state().pose.x > 0.0);
    }

    #[test]
    fn unusable_segments_are_skipped() {
        // sqrt of a negative number fails everywhere but t = 0.
        let broken = segment("broken", "sqrt(-t)", "0", 1.0, PenColor::Black);
        let fine = segment("fine", "0.01 * t", "0", 1.0, PenColor::Black);
        let program = Program::from_segments(vec![broken, fine]);

        let mut plotter = plotter();
        let summary = plotter.run(&program, &CancelToken::new()).unwrap();
        assert_eq!(summary.segments_skipped, 1);
        assert_eq!(summary.segments_executed, 1);
    }

    #[test]
    fn pen_failure_still_cleans_up() {
        struct Stuck;
        impl PenActuator for Stuck {
            fn lower(&mut self, _: PenColor) -> Result<(), PenError> {
                Err(PenError::Actuator("stuck".into()))
            }
            fn raise(&mut self) -> Result<(), PenError> {
                Ok(())
            }
        }
        let program = Program::from_segments(vec![
            segment("travel", "0.01 * t", "0", 1.0, PenColor::Up),
            segment("draw", "0.01 * t", "0", 1.0, PenColor::Black),
        ]);
        let mut plotter = Plotter::new(SimulatedOutput::new(), Stuck, &config()).unwrap();
        let err = plotter.run(&program, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecutionError::Pen(_)));
        assert!(plotter.driver().output().all_low());
    }

    #[test]
    fn delays_come_from_seconds() {
        let c = ExecutionConfig::default();
        assert_eq!(c.step_delay(true), Duration::from_millis(2));
        assert_eq!(c.step_delay(false), Duration::from_millis(1));
        assert_eq!(c.samples(false), 50);
        let broken = ExecutionConfig {
            pen_settle: f64::NAN,
            ..ExecutionConfig::default()
        };
        assert_eq!(broken.pen_settle_delay(), Duration::ZERO);
    }
}
