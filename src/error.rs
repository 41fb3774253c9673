//! Error types for every layer of the plotter.
//!
//! Only [`ProgramError`] and [`ExecutionError`] are ever fatal to a run. The
//! others are reported per point, per curve or per segment and the caller
//! decides whether to skip.

use thiserror::Error;

/// Failure to parse or evaluate a curve expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// The expression string was empty or whitespace only.
    #[error("empty expression")]
    Empty,

    /// A character that cannot start any token.
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },

    /// A malformed numeric literal.
    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    /// An identifier outside the fixed function/constant set.
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    /// A token that does not fit the grammar at this position.
    #[error("unexpected {found} at offset {offset}")]
    UnexpectedToken { found: String, offset: usize },

    /// The input ended in the middle of an expression.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// Nesting or tree height beyond what the evaluator accepts.
    #[error("expression nested deeper than {limit} levels")]
    TooDeep { limit: usize },

    /// Evaluation produced NaN or an infinity.
    #[error("non-finite result at t={t}")]
    NonFinite { t: f64 },
}

/// Rejection of a [`CurveDef`](crate::curve::CurveDef) at construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CurveError {
    #[error("curve '{name}' has invalid domain [{t_min}, {t_max}]")]
    InvalidDomain { name: String, t_min: f64, t_max: f64 },

    #[error("curve '{name}' has an invalid {axis} expression: {source}")]
    Expression {
        name: String,
        axis: &'static str,
        #[source]
        source: ExprError,
    },
}

/// Failure to read or decode a program document. Always fatal. Individual
/// invalid segments inside a readable document are dropped, not reported here.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("failed to read program source: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed program document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to fetch program: {0}")]
    Fetch(String),
}

/// Failure reported by a [`MotorOutput`](crate::stepper::MotorOutput).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotorError {
    #[error("pin {0} was written before setup")]
    PinNotConfigured(u8),

    #[error("motor output failure: {0}")]
    Output(String),
}

/// Failure reported by a [`PenActuator`](crate::pen::PenActuator).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PenError {
    #[error("pen actuator failure: {0}")]
    Actuator(String),
}

/// Abort of a running program.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The operator interrupted the run. The pen has been raised and the
    /// motors de-energized before this is returned.
    #[error("execution interrupted")]
    Interrupted,

    #[error(transparent)]
    Motor(#[from] MotorError),

    #[error(transparent)]
    Pen(#[from] PenError),
}

/// Invalid or unreadable robot configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
