//! The ordered sequence of relative segments handed to the robot, and the
//! documents it travels in.
//!
//! Reading a document is all-or-nothing at the transport level: an unreadable
//! file, a failed request or JSON that is not a program document is an error
//! and nothing runs. Inside a well-formed document each segment stands alone.
//! One with an unparseable expression or an empty parameter domain is logged
//! and dropped, and the rest of the program is kept.

use crate::curve::{CurveDef, RelativeSegment, validate_relative_segment};
use crate::error::ProgramError;
use crate::pose::Pose;
use crate::transform::compute_end_pose;
use glam::DVec2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::Write as _;
use std::path::Path;
use tracing::{info, warn};

/// Validated relative segments in execution order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Program {
    segments: Vec<RelativeSegment>,
}

impl Program {
    /// Builds a program from `segments`, dropping the invalid ones.
    pub fn from_segments(segments: impl IntoIterator<Item = RelativeSegment>) -> Self {
        let mut program = Self::default();
        for segment in segments {
            program.push(segment);
        }
        program
    }

    /// Appends `segment` if it is valid. Returns whether it was kept.
    pub fn push(&mut self, segment: RelativeSegment) -> bool {
        if !validate_relative_segment(&segment) {
            warn!(segment = %segment.name, "dropping invalid segment");
            return false;
        }
        self.segments.push(segment);
        true
    }

    pub fn segments(&self) -> &[RelativeSegment] {
        &self.segments
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RelativeSegment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The frame each segment is expressed in, starting from the origin.
    ///
    /// Segment `i + 1` is anchored at segment `i`'s end pose, computed in
    /// segment `i`'s local frame and composed onto its anchor.
    pub fn anchors(&self) -> Vec<Pose> {
        let mut anchor = Pose::ORIGIN;
        self.segments
            .iter()
            .map(|segment| {
                let current = anchor;
                anchor = advance_anchor(current, segment);
                current
            })
            .collect()
    }

    /// Global polylines of every segment, `samples` points each, with
    /// unevaluable points left out.
    pub fn trace(&self, samples: usize) -> Vec<TracedSegment> {
        self.segments
            .iter()
            .zip(self.anchors())
            .map(|(segment, anchor)| TracedSegment {
                name: segment.name.clone(),
                drawing: segment.pen.is_drawing(),
                points: crate::transform::reconstruct_global_points(segment, anchor, samples)
                    .into_iter()
                    .flatten()
                    .collect(),
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a Program {
    type Item = &'a RelativeSegment;
    type IntoIter = std::slice::Iter<'a, RelativeSegment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

impl<'de> Deserialize<'de> for Program {
    /// Segments are decoded one at a time; malformed or invalid ones are
    /// logged and dropped.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            segments: Vec<serde_json::Value>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let total = raw.segments.len();
        let program = Program::from_segments(decode_each(raw.segments, "segment"));
        if program.len() < total {
            warn!(kept = program.len(), total, "program loaded with segments dropped");
        }
        Ok(program)
    }
}

/// Decodes every record on its own, logging and skipping the ones that fail.
fn decode_each<T: DeserializeOwned>(
    records: Vec<serde_json::Value>,
    kind: &'static str,
) -> impl Iterator<Item = T> {
    records
        .into_iter()
        .enumerate()
        .filter_map(move |(index, record)| match T::deserialize(record) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(kind, index, %err, "dropping malformed record");
                None
            }
        })
}

/// Frame of the segment that follows `segment` when `segment` is anchored at
/// `anchor`.
pub fn advance_anchor(anchor: Pose, segment: &RelativeSegment) -> Pose {
    match segment.local_curve() {
        Ok(local) => anchor.compose(&compute_end_pose(&local)),
        Err(_) => anchor,
    }
}

/// One segment of [`Program::trace`].
#[derive(Clone, Debug, PartialEq)]
pub struct TracedSegment {
    pub name: String,
    pub drawing: bool,
    pub points: Vec<DVec2>,
}

/// A program plus the metadata the drawing backend stores with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgramDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub relative_program: Program,
}

impl ProgramDocument {
    pub fn new(relative_program: Program) -> Self {
        Self {
            run_id: None,
            prompt: None,
            relative_program,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProgramError> {
        Ok(serde_json::from_str(text)?)
    }

    fn log_loaded(&self, source: &str) {
        info!(
            source,
            run_id = self.run_id.as_deref().unwrap_or("-"),
            prompt = self.prompt.as_deref().unwrap_or("-"),
            segments = self.relative_program.len(),
            "loaded drawing program"
        );
    }
}

/// Reads a program document from a JSON file.
pub fn load_program_file(path: impl AsRef<Path>) -> Result<ProgramDocument, ProgramError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let doc = ProgramDocument::from_json(&text)?;
    doc.log_loaded(&path.display().to_string());
    Ok(doc)
}

/// Writes `doc` to `path` atomically: a sibling temp file is written, flushed
/// and renamed over the target, so readers never see a partial document.
pub fn save_program_file(
    doc: &ProgramDocument,
    path: impl AsRef<Path>,
) -> Result<(), ProgramError> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(doc)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);
    {
        let mut file = fs::File::create(tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(tmp, path) {
        let _ = fs::remove_file(tmp);
        return Err(err.into());
    }
    info!(
        path = %path.display(),
        segments = doc.relative_program.len(),
        "saved drawing program"
    );
    Ok(())
}

/// Absolute curves as produced by the drawing generator.
///
/// Each curve is validated on its own while decoding. A curve with a bad
/// domain or expression is logged and left out.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CurveSet {
    pub curves: Vec<CurveDef>,
}

impl<'de> Deserialize<'de> for CurveSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            curves: Vec<serde_json::Value>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Self {
            curves: decode_each(raw.curves, "curve").collect(),
        })
    }
}

/// Reads a `{"curves": [...]}` file.
pub fn load_curves_file(path: impl AsRef<Path>) -> Result<CurveSet, ProgramError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let set: CurveSet = serde_json::from_str(&text)?;
    info!(path = %path.display(), curves = set.curves.len(), "loaded curves");
    Ok(set)
}

/// Downloads the program for `run_id` from the drawing backend
/// (`GET {base_url}/robot/{run_id}`).
#[cfg(feature = "fetch")]
pub fn fetch_program(base_url: &str, run_id: &str) -> Result<ProgramDocument, ProgramError> {
    use std::time::Duration;

    let url = format!("{}/robot/{}", base_url.trim_end_matches('/'), run_id);
    info!(%url, "fetching drawing program");

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ProgramError::Fetch(e.to_string()))?;
    let response = client
        .get(&url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| ProgramError::Fetch(e.to_string()))?;
    let text = response
        .text()
        .map_err(|e| ProgramError::Fetch(e.to_string()))?;

    let doc = ProgramDocument::from_json(&text)?;
    doc.log_loaded(&url);
    Ok(doc)
}
