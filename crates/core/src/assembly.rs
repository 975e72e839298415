//! Media assembly primitives: transitions, concat strategy, and ffmpeg
//! filter graphs.
//!
//! Everything here is pure. [`crate::ffmpeg::Ffmpeg`] turns these values
//! into process invocations.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Transition length used when a fade or dissolve omits `duration`.
pub const DEFAULT_TRANSITION_SECS: f64 = 0.5;

/// Encoder arguments used whenever a stream copy is not possible.
pub const REENCODE_ARGS: &[&str] = &[
    "-c:v", "libx264", "-preset", "medium", "-crf", "18", "-pix_fmt", "yuv420p",
];

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// How one scene hands over to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    Cut,
    /// Motion carries over from the previous scene's last frame; joined like a cut.
    Continuous,
    Fade,
    Dissolve,
}

impl TransitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cut => "cut",
            Self::Continuous => "continuous",
            Self::Fade => "fade",
            Self::Dissolve => "dissolve",
        }
    }

    /// Joined with a plain concatenation.
    pub fn is_simple(self) -> bool {
        matches!(self, Self::Cut | Self::Continuous)
    }

    pub fn needs_duration(self) -> bool {
        !self.is_simple()
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cut" => Ok(Self::Cut),
            "continuous" => Ok(Self::Continuous),
            "fade" => Ok(Self::Fade),
            "dissolve" => Ok(Self::Dissolve),
            other => Err(format!(
                "invalid transition type '{other}', expected one of: cut, continuous, fade, dissolve"
            )),
        }
    }
}

/// A resolved transition with its duration in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionSpec {
    pub kind: TransitionKind,
    pub duration: f64,
}

impl TransitionSpec {
    pub fn cut() -> Self {
        Self {
            kind: TransitionKind::Cut,
            duration: 0.0,
        }
    }

    pub fn is_simple(&self) -> bool {
        self.kind.is_simple()
    }
}

/// `true` when every boundary is absent, a cut, or continuous, so a whole
/// scene list can be joined with a single concatenation.
pub fn all_simple(transitions: &[Option<TransitionSpec>]) -> bool {
    transitions.iter().flatten().all(TransitionSpec::is_simple)
}

/// Point in the first clip where a fade or dissolve begins.
pub fn transition_offset(first_duration: f64, transition_duration: f64) -> f64 {
    (first_duration - transition_duration).max(0.0)
}

/// Fade `[0]` out from `fade_out_start`, fade `[1]` in, and concatenate.
pub fn fade_filter(fade_out_start: f64, duration: f64) -> String {
    format!(
        "[0:v]fade=t=out:st={fade_out_start}:d={duration}[v0];\
         [1:v]fade=t=in:st=0:d={duration}[v1];\
         [v0][v1]concat=n=2:v=1:a=0[outv]"
    )
}

/// Cross-dissolve `[0]` into `[1]` starting at `offset`.
pub fn dissolve_filter(offset: f64, duration: f64) -> String {
    format!("[0:v][1:v]xfade=transition=fade:duration={duration}:offset={offset}[outv]")
}

/// Select exactly one decoded frame by index. The comma is escaped for the
/// filtergraph parser.
pub fn select_frame_filter(index: u64) -> String {
    format!("select=eq(n\\,{index})")
}

/// Input list for the concat demuxer.
pub fn concat_list<P: AsRef<Path>>(paths: &[P]) -> String {
    paths
        .iter()
        .map(|p| {
            let escaped = p.as_ref().to_string_lossy().replace('\'', "'\\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Concat strategy
// ---------------------------------------------------------------------------

/// Stream properties that decide whether clips can be joined without
/// re-encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipFormat {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl ClipFormat {
    /// What differs from `other`, if anything.
    fn mismatch(&self, other: &ClipFormat) -> Option<&'static str> {
        if self.codec != other.codec {
            Some("codec")
        } else if (self.width, self.height) != (other.width, other.height) {
            Some("resolution")
        } else if (self.fps - other.fps).abs() > 0.01 {
            Some("framerate")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcatStrategy {
    /// `-c copy` through the concat demuxer.
    StreamCopy,
    ReEncode { reason: String },
}

/// Stream copy when every clip matches the first; otherwise re-encode and
/// name the first clip that differs.
pub fn concat_strategy(formats: &[ClipFormat]) -> ConcatStrategy {
    let Some((first, rest)) = formats.split_first() else {
        return ConcatStrategy::StreamCopy;
    };
    rest.iter()
        .enumerate()
        .find_map(|(i, clip)| {
            first.mismatch(clip).map(|what| ConcatStrategy::ReEncode {
                reason: format!("clip {} differs in {what}", i + 1),
            })
        })
        .unwrap_or(ConcatStrategy::StreamCopy)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
