//! # diffdraw
//!
//! Drawing programs for a two-wheeled pen plotter.
//!
//! Absolute parametric curves are rewritten as a chain of *relative* segments,
//! each expressed in the frame the robot will occupy when it reaches it. The
//! robot then replays the chain with dead reckoning alone: every segment is
//! sampled in its local frame, turned into differential-drive wheel steps and
//! fed to a pair of half-stepping motors, with the pen lowered, raised or
//! swapped as each segment asks.
//!
//! The pipeline is [`ProgramBuilder`] → [`Program`] → [`Plotter`]. Motors and
//! pen are reached through the [`MotorOutput`] and [`PenActuator`] traits, so
//! the same code runs against hardware or against [`SimulatedOutput`].

pub mod color;
pub mod config;
pub mod curve;
pub mod error;
pub mod executor;
pub mod expr;
pub mod kinematics;
pub mod pen;
pub mod pose;
pub mod program;
pub mod stepper;
pub mod transform;

pub use color::PenColor;
pub use config::*;
pub use curve::*;
pub use error::*;
pub use executor::*;
pub use expr::*;
pub use kinematics::*;
pub use pen::*;
pub use pose::*;
pub use program::*;
pub use stepper::*;
pub use transform::*;
