//! Parametric curve definitions and the frame-local segments built from them.

use crate::color::PenColor;
use crate::error::{CurveError, ExprError};
use crate::expr::Expr;
use glam::DVec2;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Parameter spans narrower than this are treated as empty.
pub const MIN_DOMAIN_SPAN: f64 = 1e-9;

/// A parametric curve `(x(t), y(t))` for `t ∈ [t_min, t_max]`.
///
/// The frame is whatever the expressions happen to be written in: global for
/// curves coming from the generator, local for the inside of a segment.
/// Construction (including deserialization) guarantees a finite, non-empty,
/// ordered domain and parseable expressions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCurveDef")]
pub struct CurveDef {
    pub name: String,
    #[serde(rename = "x")]
    pub x_expr: Expr,
    #[serde(rename = "y")]
    pub y_expr: Expr,
    pub t_min: f64,
    pub t_max: f64,
    /// Requested color before normalization, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Deserialize)]
struct RawCurveDef {
    name: String,
    x: String,
    y: String,
    t_min: f64,
    t_max: f64,
    #[serde(default)]
    color: Option<String>,
}

impl TryFrom<RawCurveDef> for CurveDef {
    type Error = CurveError;

    fn try_from(raw: RawCurveDef) -> Result<Self, Self::Error> {
        CurveDef::new(raw.name, &raw.x, &raw.y, raw.t_min, raw.t_max, raw.color)
    }
}

impl CurveDef {
    /// Parses both expressions and checks the domain.
    pub fn new(
        name: impl Into<String>,
        x: &str,
        y: &str,
        t_min: f64,
        t_max: f64,
        color: Option<String>,
    ) -> Result<Self, CurveError> {
        let name = name.into();
        let parse = |axis: &'static str, src: &str| {
            Expr::parse(src).map_err(|source| CurveError::Expression {
                name: name.clone(),
                axis,
                source,
            })
        };
        let x_expr = parse("x", x)?;
        let y_expr = parse("y", y)?;
        Self::from_exprs(name, x_expr, y_expr, t_min, t_max, color)
    }

    /// Builds a curve from already-parsed trees.
    pub fn from_exprs(
        name: impl Into<String>,
        x_expr: Expr,
        y_expr: Expr,
        t_min: f64,
        t_max: f64,
        color: Option<String>,
    ) -> Result<Self, CurveError> {
        let name = name.into();
        if !(t_min.is_finite() && t_max.is_finite() && t_min < t_max) {
            return Err(CurveError::InvalidDomain { name, t_min, t_max });
        }
        Ok(Self {
            name,
            x_expr,
            y_expr,
            t_min,
            t_max,
            color,
        })
    }

    pub fn point_at(&self, t: f64) -> Result<DVec2, ExprError> {
        Ok(DVec2::new(self.x_expr.eval(t)?, self.y_expr.eval(t)?))
    }

    pub fn start_point(&self) -> Result<DVec2, ExprError> {
        self.point_at(self.t_min)
    }

    pub fn end_point(&self) -> Result<DVec2, ExprError> {
        self.point_at(self.t_max)
    }

    pub fn span(&self) -> f64 {
        self.t_max - self.t_min
    }
}

/// Pen state requested for one segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenSpec {
    pub color: PenColor,
}

impl PenSpec {
    pub const UP: PenSpec = PenSpec { color: PenColor::Up };

    pub fn new(color: PenColor) -> Self {
        Self { color }
    }

    pub fn is_drawing(&self) -> bool {
        self.color.is_drawing()
    }
}

/// A curve expressed in the local frame anchored at the end pose of the
/// previous segment (the global origin for the first one).
///
/// The local curve starts at, or within a millimetre of, the local origin.
/// Segments are self-contained: the anchor is baked into the expressions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelativeSegment {
    pub name: String,
    #[serde(rename = "x_rel")]
    pub x_rel_expr: Expr,
    #[serde(rename = "y_rel")]
    pub y_rel_expr: Expr,
    pub t_min: f64,
    pub t_max: f64,
    pub pen: PenSpec,
}

impl RelativeSegment {
    pub fn local_point_at(&self, t: f64) -> Result<DVec2, ExprError> {
        Ok(DVec2::new(self.x_rel_expr.eval(t)?, self.y_rel_expr.eval(t)?))
    }

    /// The segment's geometry as a curve in its own local frame.
    ///
    /// Fails only when the domain is invalid.
    pub fn local_curve(&self) -> Result<CurveDef, CurveError> {
        CurveDef::from_exprs(
            self.name.clone(),
            self.x_rel_expr.clone(),
            self.y_rel_expr.clone(),
            self.t_min,
            self.t_max,
            Some(self.pen.color.to_string()),
        )
    }

    /// `n` parameter values evenly spaced over the closed domain.
    pub fn sample_params(&self, n: usize) -> impl Iterator<Item = f64> + '_ {
        let span = self.t_max - self.t_min;
        (0..n).map(move |i| {
            if n <= 1 {
                self.t_min
            } else {
                self.t_min + span * (i as f64 / (n - 1) as f64)
            }
        })
    }
}

/// Checks the parameter domain of a segment, logging why it is rejected.
pub fn validate_relative_segment(segment: &RelativeSegment) -> bool {
    let (t_min, t_max) = (segment.t_min, segment.t_max);
    if !(t_min.is_finite() && t_max.is_finite()) {
        warn!(segment = %segment.name, t_min, t_max, "non-finite parameter domain");
        return false;
    }
    if t_min >= t_max {
        warn!(segment = %segment.name, t_min, t_max, "t_min must be below t_max");
        return false;
    }
    if (t_max - t_min).abs() < MIN_DOMAIN_SPAN {
        warn!(segment = %segment.name, t_min, t_max, "parameter domain is too narrow");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(t_min: f64, t_max: f64) -> RelativeSegment {
        RelativeSegment {
            name: "s".into(),
            x_rel_expr: Expr::t(),
            y_rel_expr: Expr::num(0.0),
            t_min,
            t_max,
            pen: PenSpec::default(),
        }
    }

    #[test]
    fn curve_construction_validates_domain_and_expressions() {
        assert!(CurveDef::new("ok", "t", "0", 0.0, 1.0, None).is_ok());
        assert!(matches!(
            CurveDef::new("flat", "t", "0", 1.0, 1.0, None),
            Err(CurveError::InvalidDomain { .. })
        ));
        assert!(CurveDef::new("rev", "t", "0", 2.0, 1.0, None).is_err());
        assert!(CurveDef::new("inf", "t", "0", 0.0, f64::INFINITY, None).is_err());
        assert!(matches!(
            CurveDef::new("bad", "t", "foo(t)", 0.0, 1.0, None),
            Err(CurveError::Expression { axis: "y", .. })
        ));
    }

    #[test]
    fn curve_deserializes_through_validation() {
        let c: CurveDef = serde_json::from_str(
            r##"{"name": "arc", "x": "cos(t)", "y": "sin(t)",
                 "t_min": 0, "t_max": 3.14, "color": "#FF0000"}"##,
        )
        .unwrap();
        assert_eq!(c.color.as_deref(), Some("#FF0000"));
        assert!((c.end_point().unwrap().x - 3.14f64.cos()).abs() < 1e-12);

        let bad = serde_json::from_str::<CurveDef>(
            r#"{"name":"arc","x":"t","y":"t","t_min":1,"t_max":0}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn validation_rejects_degenerate_domains() {
        assert!(validate_relative_segment(&segment(0.0, 1.0)));
        assert!(!validate_relative_segment(&segment(1.0, 1.0)));
        assert!(!validate_relative_segment(&segment(1.0, 0.0)));
        assert!(!validate_relative_segment(&segment(0.0, 1e-12)));
        assert!(!validate_relative_segment(&segment(f64::NAN, 1.0)));
        assert!(!validate_relative_segment(&segment(0.0, f64::INFINITY)));
    }

    #[test]
    fn sample_params_cover_closed_domain() {
        let s = segment(0.0, 2.0);
        let ts: Vec<f64> = s.sample_params(5).collect();
        assert_eq!(ts, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert_eq!(s.sample_params(1).collect::<Vec<_>>(), vec![0.0]);
        assert_eq!(s.sample_params(0).count(), 0);
    }
}
