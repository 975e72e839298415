//! Plan document model.
//!
//! A plan is one JSON file describing everything a production needs:
//! assets, keyframes, and either a flat video list (v1), scene videos (v2),
//! or scenes built from ordered segments (v3). Records are lenient on read
//! (missing fields become `None`) and preserve unknown keys across rewrites
//! through a flattened `extra` map. Structural checks live in
//! [`validation`].

pub mod validation;
pub mod version;

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::assembly::{TransitionKind, TransitionSpec, DEFAULT_TRANSITION_SECS};
use crate::error::CoreError;
use crate::status::{derive_scene_status, Status};

pub use validation::{IssueSeverity, ValidationIssue, ValidationResult};
pub use version::{detect_version, PlanVersion};

/// Unknown keys carried through a read/write cycle untouched.
pub type Extra = Map<String, Value>;

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// A named pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Assets,
    Keyframes,
    Videos,
    Scenes,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assets => "assets",
            Self::Keyframes => "keyframes",
            Self::Videos => "videos",
            Self::Scenes => "scenes",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assets" => Ok(Self::Assets),
            "keyframes" => Ok(Self::Keyframes),
            "videos" => Ok(Self::Videos),
            "scenes" | "segments" => Ok(Self::Scenes),
            other => Err(CoreError::Validation(format!(
                "Unknown stage '{other}'. Must be one of: assets, keyframes, videos, scenes"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared records
// ---------------------------------------------------------------------------

/// Generation knobs passed through to the sub-tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Clip length in frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl GenerationSettings {
    pub fn is_empty(&self) -> bool {
        self.preset.is_none()
            && self.control_strength.is_none()
            && self.seed.is_none()
            && self.length.is_none()
            && self.extra.is_empty()
    }
}

/// Asset categories, in the order the assets stage processes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Character,
    Background,
    Pose,
    Style,
}

impl AssetKind {
    pub const ALL: [AssetKind; 4] = [
        AssetKind::Character,
        AssetKind::Background,
        AssetKind::Pose,
        AssetKind::Style,
    ];

    /// Key of the section under `assets`.
    pub fn section(self) -> &'static str {
        match self {
            Self::Character => "characters",
            Self::Background => "backgrounds",
            Self::Pose => "poses",
            Self::Style => "styles",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Background => "background",
            Self::Pose => "pose",
            Self::Style => "style",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reusable visual reference (character sheet, background plate, pose, style).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Pose mode: `generate` (default) or `extract` from `source`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "GenerationSettings::is_empty")]
    pub settings: GenerationSettings,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Asset {
    pub fn is_extracted(&self) -> bool {
        self.mode.as_deref() == Some("extract")
    }
}

/// All asset sections, each keyed by asset name in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assets {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub characters: IndexMap<String, Asset>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub backgrounds: IndexMap<String, Asset>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub poses: IndexMap<String, Asset>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub styles: IndexMap<String, Asset>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Assets {
    pub fn section(&self, kind: AssetKind) -> &IndexMap<String, Asset> {
        match kind {
            AssetKind::Character => &self.characters,
            AssetKind::Background => &self.backgrounds,
            AssetKind::Pose => &self.poses,
            AssetKind::Style => &self.styles,
        }
    }

    pub fn section_mut(&mut self, kind: AssetKind) -> &mut IndexMap<String, Asset> {
        match kind {
            AssetKind::Character => &mut self.characters,
            AssetKind::Background => &mut self.backgrounds,
            AssetKind::Pose => &mut self.poses,
            AssetKind::Style => &mut self.styles,
        }
    }

    pub fn get(&self, kind: AssetKind, id: &str) -> Option<&Asset> {
        self.section(kind).get(id)
    }

    /// First section that declares `id`.
    pub fn find(&self, id: &str) -> Option<AssetKind> {
        AssetKind::ALL
            .into_iter()
            .find(|kind| self.section(*kind).contains_key(id))
    }

    pub fn is_empty(&self) -> bool {
        self.extra.is_empty() && AssetKind::ALL.iter().all(|k| self.section(*k).is_empty())
    }
}

/// How a keyframe comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeOrigin {
    Generated,
    /// Pulled from the tail of the previous scene.
    Extracted,
}

impl FromStr for KeyframeOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" | "generate" => Ok(Self::Generated),
            "extracted" | "extract" => Ok(Self::Extracted),
            other => Err(format!(
                "invalid keyframe type '{other}', expected 'generated' or 'extracted'"
            )),
        }
    }
}

/// A still image: v1 keyframe, v2 top-level first keyframe, or a scene's
/// start keyframe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub characters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "GenerationSettings::is_empty")]
    pub settings: GenerationSettings,
    #[serde(default)]
    pub status: Status,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Keyframe {
    /// Parsed `type`; absent means generated.
    pub fn origin(&self) -> Result<KeyframeOrigin, String> {
        match self.origin.as_deref() {
            None => Ok(KeyframeOrigin::Generated),
            Some(raw) => raw.parse(),
        }
    }

    pub fn is_extracted(&self) -> bool {
        matches!(self.origin(), Ok(KeyframeOrigin::Extracted))
    }
}

/// v1 clip between one or two keyframes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Video {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_keyframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_keyframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "GenerationSettings::is_empty")]
    pub settings: GenerationSettings,
    #[serde(default)]
    pub status: Status,
    #[serde(flatten)]
    pub extra: Extra,
}

/// `transition_from_previous` as written in the plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Transition {
    /// Resolve into a concrete transition. A missing type is a cut and a
    /// missing duration falls back to [`DEFAULT_TRANSITION_SECS`].
    pub fn resolve(&self) -> Result<TransitionSpec, String> {
        let kind = match self.kind.as_deref() {
            None => TransitionKind::Cut,
            Some(raw) => raw.parse()?,
        };
        let duration = self.duration.unwrap_or(DEFAULT_TRANSITION_SECS);
        if kind.needs_duration() && !(duration.is_finite() && duration > 0.0) {
            return Err(format!(
                "{kind} transition needs a positive duration, got {duration}"
            ));
        }
        Ok(TransitionSpec { kind, duration })
    }
}

/// One motion clip inside a v3 scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_keyframe: Option<String>,
    #[serde(default, skip_serializing_if = "GenerationSettings::is_empty")]
    pub settings: GenerationSettings,
    #[serde(default)]
    pub status: Status,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A scene. In v2 it is one generated video; in v3 it owns segments and
/// its status is derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_keyframe: Option<Keyframe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_from_previous: Option<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_video: Option<String>,
    #[serde(default, skip_serializing_if = "GenerationSettings::is_empty")]
    pub settings: GenerationSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Scene {
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// The scene starts from an extracted frame. Scene 0 only counts when it
    /// explicitly says so, which validation rejects.
    pub fn starts_extracted(&self, index: usize) -> bool {
        match &self.first_keyframe {
            Some(kf) => kf.is_extracted(),
            None => index > 0,
        }
    }

    /// Transition into this scene; the first scene never has one.
    pub fn transition(&self, index: usize) -> Result<Option<TransitionSpec>, String> {
        if index == 0 {
            return Ok(None);
        }
        self.transition_from_previous
            .as_ref()
            .map(Transition::resolve)
            .transpose()
    }

    pub fn segment(&self, id: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id.as_deref() == Some(id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalVideo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(flatten)]
    pub extra: Extra,
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// Version-specific part of the plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanBody {
    Legacy {
        keyframes: Vec<Keyframe>,
        videos: Vec<Video>,
    },
    Scenes {
        first_keyframe: Option<Keyframe>,
        scenes: Vec<Scene>,
        final_video: Option<FinalVideo>,
    },
    Segmented {
        scenes: Vec<Scene>,
        final_video: Option<FinalVideo>,
    },
}

impl PlanBody {
    pub fn version(&self) -> PlanVersion {
        match self {
            Self::Legacy { .. } => PlanVersion::V1,
            Self::Scenes { .. } => PlanVersion::V2,
            Self::Segmented { .. } => PlanVersion::V3,
        }
    }
}

/// Address of one status-bearing node in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Asset { kind: AssetKind, id: String },
    /// v1 keyframe by id.
    Keyframe(String),
    /// v2 top-level first keyframe.
    FirstKeyframe,
    /// A scene's own `first_keyframe`, addressed by scene id.
    SceneKeyframe(String),
    Video(String),
    Scene(String),
    Segment { scene: String, segment: String },
    FinalVideo,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asset { kind, id } => write!(f, "{kind}:{id}"),
            Self::Keyframe(id) => write!(f, "keyframe:{id}"),
            Self::FirstKeyframe => f.write_str("first_keyframe"),
            Self::SceneKeyframe(scene) => write!(f, "scene:{scene}:first_keyframe"),
            Self::Video(id) => write!(f, "video:{id}"),
            Self::Scene(id) => write!(f, "scene:{id}"),
            Self::Segment { scene, segment } => write!(f, "segment:{scene}/{segment}"),
            Self::FinalVideo => f.write_str("final_video"),
        }
    }
}

/// The whole plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDocument {
    pub project_name: Option<String>,
    pub assets: Assets,
    pub body: PlanBody,
    pub extra: Extra,
}

/// On-disk shape, used only to move between JSON and [`PipelineDocument`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<Value>,
    #[serde(default, skip_serializing_if = "Assets::is_empty")]
    assets: Assets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keyframes: Option<Vec<Keyframe>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    videos: Option<Vec<Video>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_keyframe: Option<Keyframe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scenes: Option<Vec<Scene>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    final_video: Option<FinalVideo>,
    #[serde(flatten)]
    extra: Extra,
}

/// Move a field the body does not use back into `extra` so it survives a
/// rewrite untouched.
fn stash<T: Serialize>(extra: &mut Extra, key: &str, value: Option<T>) -> Result<(), CoreError> {
    if let Some(value) = value {
        extra.insert(key.to_string(), serde_json::to_value(value)?);
    }
    Ok(())
}

impl PipelineDocument {
    /// Classify and parse a raw JSON plan.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        if !value.is_object() {
            return Err(CoreError::Validation(
                "Plan document must be a JSON object".to_string(),
            ));
        }
        let version = detect_version(&value);
        let raw: RawDocument = serde_json::from_value(value)?;
        let mut extra = raw.extra;

        let body = match version {
            PlanVersion::V1 => {
                stash(&mut extra, "first_keyframe", raw.first_keyframe)?;
                stash(&mut extra, "scenes", raw.scenes)?;
                stash(&mut extra, "final_video", raw.final_video)?;
                PlanBody::Legacy {
                    keyframes: raw.keyframes.unwrap_or_default(),
                    videos: raw.videos.unwrap_or_default(),
                }
            }
            PlanVersion::V2 => {
                stash(&mut extra, "keyframes", raw.keyframes)?;
                stash(&mut extra, "videos", raw.videos)?;
                PlanBody::Scenes {
                    first_keyframe: raw.first_keyframe,
                    scenes: raw.scenes.unwrap_or_default(),
                    final_video: raw.final_video,
                }
            }
            PlanVersion::V3 => {
                stash(&mut extra, "keyframes", raw.keyframes)?;
                stash(&mut extra, "videos", raw.videos)?;
                stash(&mut extra, "first_keyframe", raw.first_keyframe)?;
                let mut scenes = raw.scenes.unwrap_or_default();
                for scene in &mut scenes {
                    scene.status = None;
                }
                PlanBody::Segmented {
                    scenes,
                    final_video: raw.final_video,
                }
            }
        };

        Ok(Self {
            project_name: raw.project_name,
            assets: raw.assets,
            body,
            extra,
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_value(value)
    }

    /// Serialize back to JSON. The `version` field always reflects the body.
    pub fn to_value(&self) -> Result<Value, CoreError> {
        let mut raw = RawDocument {
            project_name: self.project_name.clone(),
            version: Some(Value::from(self.version().number())),
            assets: self.assets.clone(),
            extra: self.extra.clone(),
            ..RawDocument::default()
        };
        match &self.body {
            PlanBody::Legacy { keyframes, videos } => {
                raw.keyframes = Some(keyframes.clone());
                raw.videos = Some(videos.clone());
            }
            PlanBody::Scenes {
                first_keyframe,
                scenes,
                final_video,
            } => {
                raw.first_keyframe = first_keyframe.clone();
                raw.scenes = Some(scenes.clone());
                raw.final_video = final_video.clone();
            }
            PlanBody::Segmented {
                scenes,
                final_video,
            } => {
                let mut scenes = scenes.clone();
                for scene in &mut scenes {
                    scene.status = None;
                }
                raw.scenes = Some(scenes);
                raw.final_video = final_video.clone();
            }
        }
        Ok(serde_json::to_value(raw)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(&self.to_value()?)?)
    }

    pub fn version(&self) -> PlanVersion {
        self.body.version()
    }

    pub fn project_name(&self) -> &str {
        self.project_name.as_deref().unwrap_or("untitled")
    }

    /// Scene list for v2/v3, empty for v1.
    pub fn scenes(&self) -> &[Scene] {
        match &self.body {
            PlanBody::Legacy { .. } => &[],
            PlanBody::Scenes { scenes, .. } | PlanBody::Segmented { scenes, .. } => scenes,
        }
    }

    pub fn final_video(&self) -> Option<&FinalVideo> {
        match &self.body {
            PlanBody::Legacy { .. } => None,
            PlanBody::Scenes { final_video, .. } | PlanBody::Segmented { final_video, .. } => {
                final_video.as_ref()
            }
        }
    }

    pub fn scene_index(&self, id: &str) -> Option<usize> {
        self.scenes().iter().position(|s| s.id.as_deref() == Some(id))
    }

    /// Status of the scene at `index`: stored for v2, derived for v3.
    pub fn scene_status(&self, index: usize) -> Option<Status> {
        let scene = self.scenes().get(index)?;
        Some(match self.version() {
            PlanVersion::V3 => derive_scene_status(scene.segments.iter().map(|s| s.status)),
            _ => scene.status.unwrap_or_default(),
        })
    }

    /// Resolve a bare id to the entity it names. Search order: assets,
    /// keyframes, videos, scenes, segments.
    pub fn locate(&self, id: &str) -> Option<EntityKey> {
        if let Some(kind) = self.assets.find(id) {
            return Some(EntityKey::Asset {
                kind,
                id: id.to_string(),
            });
        }
        if let Some(key) = self.locate_keyframe(id) {
            return Some(key);
        }
        match &self.body {
            PlanBody::Legacy { videos, .. } => videos
                .iter()
                .any(|v| v.id.as_deref() == Some(id))
                .then(|| EntityKey::Video(id.to_string())),
            PlanBody::Scenes { scenes, .. } | PlanBody::Segmented { scenes, .. } => {
                if scenes.iter().any(|s| s.id.as_deref() == Some(id)) {
                    return Some(EntityKey::Scene(id.to_string()));
                }
                scenes.iter().find_map(|scene| {
                    scene.segment(id).map(|_| EntityKey::Segment {
                        scene: scene.id().to_string(),
                        segment: id.to_string(),
                    })
                })
            }
        }
    }

    /// Keyframe lookup by the keyframe's own `id`. A v2 top-level first
    /// keyframe also answers to `first_keyframe`.
    pub fn locate_keyframe(&self, id: &str) -> Option<EntityKey> {
        let matches = |kf: &Keyframe| kf.id.as_deref() == Some(id);
        match &self.body {
            PlanBody::Legacy { keyframes, .. } => keyframes
                .iter()
                .any(matches)
                .then(|| EntityKey::Keyframe(id.to_string())),
            PlanBody::Scenes {
                first_keyframe,
                scenes,
                ..
            } => {
                if id == "first_keyframe" || first_keyframe.as_ref().is_some_and(matches) {
                    return first_keyframe.as_ref().map(|_| EntityKey::FirstKeyframe);
                }
                Self::scene_keyframe_key(scenes, matches)
            }
            PlanBody::Segmented { scenes, .. } => Self::scene_keyframe_key(scenes, matches),
        }
    }

    fn scene_keyframe_key(
        scenes: &[Scene],
        matches: impl Fn(&Keyframe) -> bool,
    ) -> Option<EntityKey> {
        scenes.iter().find_map(|scene| {
            scene
                .first_keyframe
                .as_ref()
                .filter(|&kf| matches(kf))
                .map(|_| EntityKey::SceneKeyframe(scene.id().to_string()))
        })
    }

    /// Current status of an entity. v3 scenes report their derived status.
    pub fn status_of(&self, key: &EntityKey) -> Option<Status> {
        match key {
            EntityKey::Asset { kind, id } => self.assets.get(*kind, id).map(|a| a.status),
            EntityKey::Scene(id) => self.scene_index(id).and_then(|i| self.scene_status(i)),
            _ => self.keyframe(key).map(|kf| kf.status).or_else(|| match (key, &self.body) {
                (EntityKey::Video(id), PlanBody::Legacy { videos, .. }) => videos
                    .iter()
                    .find(|v| v.id.as_deref() == Some(id.as_str()))
                    .map(|v| v.status),
                (EntityKey::Segment { scene, segment }, _) => self
                    .scene_index(scene)
                    .and_then(|i| self.scenes()[i].segment(segment))
                    .map(|s| s.status),
                (EntityKey::FinalVideo, _) => self.final_video().map(|f| f.status),
                _ => None,
            }),
        }
    }

    /// Keyframe record behind a keyframe-like key.
    pub fn keyframe(&self, key: &EntityKey) -> Option<&Keyframe> {
        match (key, &self.body) {
            (EntityKey::Keyframe(id), PlanBody::Legacy { keyframes, .. }) => keyframes
                .iter()
                .find(|k| k.id.as_deref() == Some(id.as_str())),
            (EntityKey::FirstKeyframe, PlanBody::Scenes { first_keyframe, .. }) => {
                first_keyframe.as_ref()
            }
            (EntityKey::SceneKeyframe(scene), _) => self
                .scene_index(scene)
                .and_then(|i| self.scenes()[i].first_keyframe.as_ref()),
            _ => None,
        }
    }

    /// Apply a status change with transition checks. Returns the previous
    /// status.
    pub fn set_status(&mut self, key: &EntityKey, next: Status) -> Result<Status, CoreError> {
        self.apply_status(key, next, false)
    }

    /// Operator reset to `pending`, bypassing transition checks.
    pub fn reset_status(&mut self, key: &EntityKey) -> Result<Status, CoreError> {
        self.apply_status(key, Status::Pending, true)
    }

    fn apply_status(
        &mut self,
        key: &EntityKey,
        next: Status,
        force: bool,
    ) -> Result<Status, CoreError> {
        let version = self.version();
        let not_found = |entity: &'static str, id: &str| CoreError::NotFound {
            entity,
            id: id.to_string(),
        };

        // v3 scenes have no stored status: resetting one resets its segments.
        if let (EntityKey::Scene(id), PlanVersion::V3) = (key, version) {
            if !force {
                return Err(CoreError::Unsupported {
                    version,
                    operation: "setting a scene status (derived from segments)",
                });
            }
            let index = self.scene_index(id).ok_or_else(|| not_found("scene", id))?;
            let previous = self.scene_status(index).unwrap_or_default();
            if let Some(scene) = self.scenes_mut().get_mut(index) {
                for segment in &mut scene.segments {
                    segment.status = Status::Pending;
                }
            }
            return Ok(previous);
        }

        let slot = self.status_slot(key).ok_or_else(|| match key {
            EntityKey::Asset { kind, id } => not_found(kind.as_str(), id),
            EntityKey::Keyframe(id) => not_found("keyframe", id),
            EntityKey::FirstKeyframe => not_found("first_keyframe", "first_keyframe"),
            EntityKey::SceneKeyframe(id) => not_found("scene first_keyframe", id),
            EntityKey::Video(id) => not_found("video", id),
            EntityKey::Scene(id) => not_found("scene", id),
            EntityKey::Segment { segment, .. } => not_found("segment", segment),
            EntityKey::FinalVideo => not_found("final_video", "final_video"),
        })?;

        let previous = *slot;
        *slot = if force { next } else { previous.transition(next)? };
        Ok(previous)
    }

    fn scenes_mut(&mut self) -> &mut [Scene] {
        match &mut self.body {
            PlanBody::Legacy { .. } => &mut [],
            PlanBody::Scenes { scenes, .. } | PlanBody::Segmented { scenes, .. } => scenes,
        }
    }

    fn status_slot(&mut self, key: &EntityKey) -> Option<&mut Status> {
        let by_id = |id: &str, candidate: &Option<String>| candidate.as_deref() == Some(id);
        match key {
            EntityKey::Asset { kind, id } => {
                self.assets.section_mut(*kind).get_mut(id).map(|a| &mut a.status)
            }
            EntityKey::Keyframe(id) => match &mut self.body {
                PlanBody::Legacy { keyframes, .. } => keyframes
                    .iter_mut()
                    .find(|k| by_id(id, &k.id))
                    .map(|k| &mut k.status),
                _ => None,
            },
            EntityKey::FirstKeyframe => match &mut self.body {
                PlanBody::Scenes { first_keyframe, .. } => {
                    first_keyframe.as_mut().map(|k| &mut k.status)
                }
                _ => None,
            },
            EntityKey::SceneKeyframe(scene) => self
                .scenes_mut()
                .iter_mut()
                .find(|s| by_id(scene, &s.id))
                .and_then(|s| s.first_keyframe.as_mut())
                .map(|k| &mut k.status),
            EntityKey::Video(id) => match &mut self.body {
                PlanBody::Legacy { videos, .. } => videos
                    .iter_mut()
                    .find(|v| by_id(id, &v.id))
                    .map(|v| &mut v.status),
                _ => None,
            },
            EntityKey::Scene(id) => match &mut self.body {
                PlanBody::Scenes { scenes, .. } => scenes
                    .iter_mut()
                    .find(|s| by_id(id, &s.id))
                    .map(|s| s.status.get_or_insert(Status::Pending)),
                _ => None,
            },
            EntityKey::Segment { scene, segment } => self
                .scenes_mut()
                .iter_mut()
                .find(|s| by_id(scene, &s.id))
                .and_then(|s| s.segments.iter_mut().find(|g| by_id(segment, &g.id)))
                .map(|g| &mut g.status),
            EntityKey::FinalVideo => match &mut self.body {
                PlanBody::Legacy { .. } => None,
                PlanBody::Scenes { final_video, .. } | PlanBody::Segmented { final_video, .. } => {
                    final_video.as_mut().map(|f| &mut f.status)
                }
            },
        }
    }

    /// Structural check. Pure and read-only.
    pub fn validate(&self) -> ValidationResult {
        validation::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn v3_doc() -> PipelineDocument {
        PipelineDocument::from_value(json!({
            "project_name": "demo",
            "assets": {
                "characters": {"alice": {"prompt": "a", "output": "c/alice.png"}},
                "backgrounds": {"park": {"prompt": "p", "output": "b/park.png", "status": "approved"}}
            },
            "scenes": [
                {
                    "id": "A",
                    "output_video": "v/A.mp4",
                    "status": "approved",
                    "first_keyframe": {"type": "generated", "prompt": "x", "output": "k/A.png"},
                    "segments": [
                        {"id": "A1", "prompt": "walk", "output_video": "v/A1.mp4", "output_keyframe": "k/A1.png"},
                        {"id": "A2", "prompt": "run", "output_video": "v/A2.mp4", "status": "generated"}
                    ],
                    "camera": "dolly"
                }
            ],
            "final_video": {"output": "final.mp4"},
            "notes": {"owner": "ops"}
        }))
        .unwrap()
    }

    #[test]
    fn v3_scene_status_is_derived_not_stored() {
        let doc = v3_doc();
        assert_eq!(doc.version(), PlanVersion::V3);
        assert_eq!(doc.scenes()[0].status, None);
        assert_eq!(doc.scene_status(0), Some(Status::Pending));

        let value = doc.to_value().unwrap();
        assert!(value["scenes"][0].get("status").is_none());
    }

    #[test]
    fn unknown_keys_survive_rewrite() {
        let doc = v3_doc();
        let value = doc.to_value().unwrap();
        assert_eq!(value["notes"]["owner"], "ops");
        assert_eq!(value["scenes"][0]["camera"], "dolly");
        assert_eq!(value["version"], 3);
    }

    #[test]
    fn asset_order_is_preserved() {
        let doc = PipelineDocument::from_value(json!({
            "assets": {"characters": {
                "zed": {"prompt": "z", "output": "z.png"},
                "amy": {"prompt": "a", "output": "a.png"},
                "bob": {"prompt": "b", "output": "b.png"}
            }}
        }))
        .unwrap();
        let names: Vec<_> = doc.assets.characters.keys().cloned().collect();
        assert_eq!(names, ["zed", "amy", "bob"]);
    }

    #[test]
    fn locate_resolves_each_kind() {
        let doc = v3_doc();
        assert_eq!(
            doc.locate("park"),
            Some(EntityKey::Asset {
                kind: AssetKind::Background,
                id: "park".into()
            })
        );
        assert_eq!(doc.locate("A"), Some(EntityKey::Scene("A".into())));
        assert_eq!(
            doc.locate("A2"),
            Some(EntityKey::Segment {
                scene: "A".into(),
                segment: "A2".into()
            })
        );
        assert_eq!(doc.locate("nope"), None);
    }

    #[test]
    fn set_status_enforces_transitions() {
        let mut doc = v3_doc();
        let key = EntityKey::Segment {
            scene: "A".into(),
            segment: "A2".into(),
        };
        assert_matches!(
            doc.set_status(&key, Status::Pending),
            Err(CoreError::InvalidTransition { .. })
        );
        assert_eq!(doc.set_status(&key, Status::Approved).unwrap(), Status::Generated);
        assert_eq!(doc.reset_status(&key).unwrap(), Status::Approved);
        assert_eq!(doc.status_of(&key), Some(Status::Pending));
    }

    #[test]
    fn v3_scene_status_cannot_be_set_directly() {
        let mut doc = v3_doc();
        assert_matches!(
            doc.set_status(&EntityKey::Scene("A".into()), Status::Generated),
            Err(CoreError::Unsupported { .. })
        );
    }

    #[test]
    fn resetting_v3_scene_resets_segments() {
        let mut doc = v3_doc();
        doc.reset_status(&EntityKey::Scene("A".into())).unwrap();
        assert!(doc.scenes()[0]
            .segments
            .iter()
            .all(|s| s.status == Status::Pending));
    }

    #[test]
    fn missing_entity_is_not_found() {
        let mut doc = v3_doc();
        assert_matches!(
            doc.set_status(&EntityKey::Video("v".into()), Status::InProgress),
            Err(CoreError::NotFound { entity: "video", .. })
        );
    }

    #[test]
    fn v2_scene_status_is_stored() {
        let mut doc = PipelineDocument::from_value(json!({
            "first_keyframe": {"id": "start", "prompt": "x", "output": "k.png"},
            "scenes": [{"id": "S1", "prompt": "p", "output_video": "s1.mp4"}]
        }))
        .unwrap();
        assert_eq!(doc.version(), PlanVersion::V2);
        assert_eq!(doc.locate("start"), Some(EntityKey::FirstKeyframe));

        let key = EntityKey::Scene("S1".into());
        doc.set_status(&key, Status::InProgress).unwrap();
        assert_eq!(doc.scene_status(0), Some(Status::InProgress));
        assert_eq!(doc.to_value().unwrap()["scenes"][0]["status"], "in_progress");
    }

    #[test]
    fn v1_body_keeps_stray_scene_keys() {
        let doc = PipelineDocument::from_value(json!({
            "version": 1,
            "keyframes": [{"id": "k1", "prompt": "p", "output": "k1.png"}],
            "scenes": [{"id": "draft"}]
        }))
        .unwrap();
        assert_eq!(doc.version(), PlanVersion::V1);
        assert_eq!(doc.to_value().unwrap()["scenes"][0]["id"], "draft");
    }

    #[test]
    fn non_object_documents_rejected() {
        assert_matches!(
            PipelineDocument::from_value(json!([1, 2])),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn stage_names_parse() {
        assert_eq!("scenes".parse::<Stage>().unwrap(), Stage::Scenes);
        assert_eq!("Assets".parse::<Stage>().unwrap(), Stage::Assets);
        assert!("render".parse::<Stage>().is_err());
    }
}
