//! Plan schema version detection.

use std::fmt;

use serde_json::Value;

use super::Stage;

/// The three on-disk plan layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanVersion {
    /// Flat keyframe and video lists.
    V1,
    /// Top-level first keyframe plus one video per scene.
    V2,
    /// Scenes made of ordered segments.
    V3,
}

impl PlanVersion {
    pub fn number(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    pub fn from_number(n: u64) -> Option<Self> {
        match n {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    /// Stages this layout supports, in execution order.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Self::V1 => &[Stage::Assets, Stage::Keyframes, Stage::Videos],
            Self::V2 | Self::V3 => &[Stage::Assets, Stage::Keyframes, Stage::Scenes],
        }
    }

    pub fn supports(self, stage: Stage) -> bool {
        self.stages().contains(&stage)
    }
}

impl fmt::Display for PlanVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// Classify a raw plan document.
///
/// A `segments` key on any scene always means v3, whatever the `version`
/// field says. Otherwise an explicit, recognised `version` wins, then a
/// top-level `first_keyframe` means v2, and anything else is v1.
pub fn detect_version(doc: &Value) -> PlanVersion {
    let has_segments = doc
        .get("scenes")
        .and_then(Value::as_array)
        .is_some_and(|scenes| scenes.iter().any(|s| s.get("segments").is_some()));
    if has_segments {
        return PlanVersion::V3;
    }

    if let Some(raw) = doc.get("version") {
        match explicit_version(raw) {
            Some(v) => return v,
            None => tracing::warn!(version = %raw, "Ignoring unrecognised plan version field"),
        }
    }

    if doc.get("first_keyframe").is_some() {
        PlanVersion::V2
    } else {
        PlanVersion::V1
    }
}

/// Accept `3`, `"3"` and `"v3"`.
fn explicit_version(raw: &Value) -> Option<PlanVersion> {
    match raw {
        Value::Number(n) => n.as_u64().and_then(PlanVersion::from_number),
        Value::String(s) => s
            .trim()
            .trim_start_matches(['v', 'V'])
            .parse::<u64>()
            .ok()
            .and_then(PlanVersion::from_number),
        _ => None,
    }
}
