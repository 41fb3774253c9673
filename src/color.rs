//! Pen color normalization.
//!
//! The robot carries exactly two inks. Every requested color is mapped to the
//! nearer of black and blue by squared RGB distance, or to pen-up when the
//! request is literally `"none"`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const BLACK: &str = "#000000";
pub const BLUE: &str = "#0000FF";
pub const PEN_UP: &str = "none";

/// The only pen states a program may request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PenColor {
    #[default]
    Black,
    Blue,
    /// No ink: the segment is a travel move.
    Up,
}

impl PenColor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Black => BLACK,
            Self::Blue => BLUE,
            Self::Up => PEN_UP,
        }
    }

    pub fn is_drawing(self) -> bool {
        self != Self::Up
    }
}

impl fmt::Display for PenColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an arbitrary color request onto a [`PenColor`].
///
/// `"none"` (any case, surrounding whitespace ignored) is pen-up. `#RRGGBB`
/// and a handful of CSS names are parsed and snapped to the closer ink.
/// Anything unparseable, including a missing color, is black.
pub fn normalize(input: Option<&str>) -> PenColor {
    let Some(raw) = input.map(str::trim) else {
        return PenColor::Black;
    };
    if raw.eq_ignore_ascii_case(PEN_UP) {
        return PenColor::Up;
    }
    match parse_rgb(raw) {
        Some(rgb) if dist2(rgb, (0, 0, 255)) < dist2(rgb, (0, 0, 0)) => PenColor::Blue,
        _ => PenColor::Black,
    }
}

fn parse_rgb(raw: &str) -> Option<(u8, u8, u8)> {
    if let Some(hex) = raw.strip_prefix('#') {
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        return Some((channel(0)?, channel(2)?, channel(4)?));
    }
    let named = match raw.to_ascii_lowercase().as_str() {
        "black" => (0, 0, 0),
        "blue" => (0, 0, 255),
        "red" => (255, 0, 0),
        "green" => (0, 255, 0),
        "white" => (255, 255, 255),
        "yellow" => (255, 255, 0),
        "cyan" => (0, 255, 255),
        "magenta" => (255, 0, 255),
        _ => return None,
    };
    Some(named)
}

fn dist2(a: (u8, u8, u8), b: (u8, u8, u8)) -> i32 {
    let d = |x: u8, y: u8| i32::from(x) - i32::from(y);
    let (dr, dg, db) = (d(a.0, b.0), d(a.1, b.1), d(a.2, b.2));
    dr * dr + dg * dg + db * db
}

impl Serialize for PenColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PenColor {
    /// Any string is accepted and normalized; `null` is black.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(normalize(raw.as_deref()))
    }
}
