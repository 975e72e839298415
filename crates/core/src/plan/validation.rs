//! Structural validation of a plan document.
//!
//! [`validate`] never mutates the document and never stops at the first
//! problem: it walks every entity and returns the full list of issues.
//! Errors refuse execution; warnings are reported but do not.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::{
    AssetKind, Assets, Keyframe, KeyframeOrigin, PipelineDocument, PlanBody, Scene, Segment,
    Transition,
};

// ---------------------------------------------------------------------------
// Issue types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
}

/// Issue categories.
pub const CATEGORY_MISSING_FIELD: &str = "missing_field";
pub const CATEGORY_DANGLING_REFERENCE: &str = "dangling_reference";
pub const CATEGORY_DUPLICATE_ID: &str = "duplicate_id";
pub const CATEGORY_STRUCTURE: &str = "structure";
pub const CATEGORY_TRANSITION: &str = "transition";

/// A single defect found in the plan.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub category: String,
    pub message: String,
    /// Human-readable path of the offending entity, e.g. `scenes[1].segments[0]`.
    pub entity: Option<String>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{entity}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Aggregated result of a validation run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Build a result from a flat list of issues.
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) = issues
            .into_iter()
            .partition(|i| i.severity == IssueSeverity::Error);
        Self {
            passed: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Issues(Vec<ValidationIssue>);

impl Issues {
    fn error(&mut self, category: &str, entity: &str, message: impl Into<String>) {
        self.push(IssueSeverity::Error, category, entity, message);
    }

    fn warning(&mut self, category: &str, entity: &str, message: impl Into<String>) {
        self.push(IssueSeverity::Warning, category, entity, message);
    }

    fn push(&mut self, severity: IssueSeverity, category: &str, entity: &str, message: impl Into<String>) {
        self.0.push(ValidationIssue {
            severity,
            category: category.to_string(),
            message: message.into(),
            entity: (!entity.is_empty()).then(|| entity.to_string()),
        });
    }

    fn require(&mut self, entity: &str, field: &str, value: Option<&str>) {
        if !matches!(value, Some(v) if !v.trim().is_empty()) {
            self.error(
                CATEGORY_MISSING_FIELD,
                entity,
                format!("missing required field '{field}'"),
            );
        }
    }

    /// Record a duplicate id; `seen` collects ids across the call site's scope.
    fn unique(&mut self, seen: &mut HashSet<String>, entity: &str, id: Option<&str>) {
        if let Some(id) = id {
            if !seen.insert(id.to_string()) {
                self.error(CATEGORY_DUPLICATE_ID, entity, format!("duplicate id '{id}'"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Walk the whole document and collect every defect.
pub fn validate(doc: &PipelineDocument) -> ValidationResult {
    let mut issues = Issues::default();

    issues.require("", "project_name", doc.project_name.as_deref());
    check_assets(&doc.assets, &mut issues);

    match &doc.body {
        PlanBody::Legacy { keyframes, videos } => {
            check_legacy(&doc.assets, keyframes, videos, &mut issues)
        }
        PlanBody::Scenes {
            first_keyframe,
            scenes,
            final_video,
        } => {
            match first_keyframe {
                Some(kf) => {
                    check_keyframe(&doc.assets, kf, "first_keyframe", &mut issues);
                    if kf.is_extracted() {
                        issues.error(
                            CATEGORY_STRUCTURE,
                            "first_keyframe",
                            "the opening keyframe cannot be extracted",
                        );
                    }
                }
                None => issues.error(
                    CATEGORY_MISSING_FIELD,
                    "",
                    "missing required field 'first_keyframe'",
                ),
            }
            check_scenes(&doc.assets, scenes, false, &mut issues);
            if let Some(fv) = final_video {
                issues.require("final_video", "output", fv.output.as_deref());
            }
        }
        PlanBody::Segmented {
            scenes,
            final_video,
        } => {
            check_scenes(&doc.assets, scenes, true, &mut issues);
            if let Some(fv) = final_video {
                issues.require("final_video", "output", fv.output.as_deref());
            }
        }
    }

    ValidationResult::from_issues(issues.0)
}

// ---------------------------------------------------------------------------
// Per-entity checks
// ---------------------------------------------------------------------------

fn check_assets(assets: &Assets, issues: &mut Issues) {
    for kind in AssetKind::ALL {
        for (name, asset) in assets.section(kind) {
            let entity = format!("assets.{}.{name}", kind.section());
            issues.require(&entity, "output", asset.output.as_deref());

            match (kind, asset.mode.as_deref()) {
                (AssetKind::Pose, Some("extract")) => {
                    issues.require(&entity, "source", asset.source.as_deref());
                }
                (AssetKind::Pose, Some("generate") | None) => {
                    issues.require(&entity, "prompt", asset.prompt.as_deref());
                }
                (AssetKind::Pose, Some(other)) => issues.error(
                    CATEGORY_STRUCTURE,
                    &entity,
                    format!("invalid pose type '{other}', expected 'generate' or 'extract'"),
                ),
                _ => issues.require(&entity, "prompt", asset.prompt.as_deref()),
            }
        }
    }
}

/// Field and reference checks shared by every generated keyframe.
fn check_keyframe(assets: &Assets, kf: &Keyframe, entity: &str, issues: &mut Issues) {
    let origin = match kf.origin() {
        Ok(origin) => origin,
        Err(msg) => {
            issues.error(CATEGORY_STRUCTURE, entity, msg);
            return;
        }
    };
    if origin == KeyframeOrigin::Generated {
        issues.require(entity, "prompt", kf.prompt.as_deref());
        issues.require(entity, "output", kf.output.as_deref());
    }

    let mut check_ref = |kind: AssetKind, name: &str| {
        if assets.get(kind, name).is_none() {
            issues.error(
                CATEGORY_DANGLING_REFERENCE,
                entity,
                format!("{kind} '{name}' not found in assets.{}", kind.section()),
            );
        }
    };
    for name in &kf.characters {
        check_ref(AssetKind::Character, name);
    }
    if let Some(name) = &kf.background {
        check_ref(AssetKind::Background, name);
    }
    if let Some(name) = &kf.pose {
        check_ref(AssetKind::Pose, name);
    }
    if let Some(name) = &kf.style {
        check_ref(AssetKind::Style, name);
    }
}

fn check_legacy(
    assets: &Assets,
    keyframes: &[Keyframe],
    videos: &[super::Video],
    issues: &mut Issues,
) {
    let mut seen = HashSet::new();
    for (i, kf) in keyframes.iter().enumerate() {
        let entity = format!("keyframes[{i}]");
        issues.require(&entity, "id", kf.id.as_deref());
        issues.unique(&mut seen, &entity, kf.id.as_deref());
        check_keyframe(assets, kf, &entity, issues);
    }

    let mut seen_videos = HashSet::new();
    for (i, video) in videos.iter().enumerate() {
        let entity = format!("videos[{i}]");
        issues.require(&entity, "id", video.id.as_deref());
        issues.unique(&mut seen_videos, &entity, video.id.as_deref());
        issues.require(&entity, "prompt", video.prompt.as_deref());
        issues.require(&entity, "output", video.output.as_deref());
        issues.require(&entity, "start_keyframe", video.start_keyframe.as_deref());

        for (field, target) in [
            ("start_keyframe", &video.start_keyframe),
            ("end_keyframe", &video.end_keyframe),
        ] {
            if let Some(target) = target {
                if !seen.contains(target) {
                    issues.error(
                        CATEGORY_DANGLING_REFERENCE,
                        &entity,
                        format!("{field} '{target}' does not name a keyframe"),
                    );
                }
            }
        }
    }
}

fn check_transition(transition: &Transition, index: usize, entity: &str, issues: &mut Issues) {
    if index == 0 {
        issues.error(
            CATEGORY_TRANSITION,
            entity,
            "the first scene cannot have a transition_from_previous",
        );
        return;
    }
    match transition.resolve() {
        Ok(spec) => {
            if spec.kind.needs_duration() && transition.duration.is_none() {
                issues.warning(
                    CATEGORY_TRANSITION,
                    entity,
                    format!("{} transition has no duration, using {}s", spec.kind, spec.duration),
                );
            }
        }
        Err(msg) => issues.error(CATEGORY_TRANSITION, entity, msg),
    }
}

fn check_scenes(assets: &Assets, scenes: &[Scene], segmented: bool, issues: &mut Issues) {
    if scenes.is_empty() {
        issues.error(CATEGORY_STRUCTURE, "scenes", "plan declares no scenes");
        return;
    }

    let mut seen_scenes = HashSet::new();
    let mut seen_segments = HashSet::new();

    for (i, scene) in scenes.iter().enumerate() {
        let entity = format!("scenes[{i}]");
        issues.require(&entity, "id", scene.id.as_deref());
        issues.unique(&mut seen_scenes, &entity, scene.id.as_deref());
        issues.require(&entity, "output_video", scene.output_video.as_deref());
        if !segmented {
            issues.require(&entity, "prompt", scene.prompt.as_deref());
        }

        let kf_entity = format!("{entity}.first_keyframe");
        match &scene.first_keyframe {
            Some(kf) => {
                check_keyframe(assets, kf, &kf_entity, issues);
                if i == 0 && kf.is_extracted() {
                    issues.error(
                        CATEGORY_STRUCTURE,
                        &kf_entity,
                        "the first scene cannot start from an extracted keyframe",
                    );
                }
            }
            None if i == 0 && segmented => issues.error(
                CATEGORY_MISSING_FIELD,
                &entity,
                "the first scene needs a generated first_keyframe",
            ),
            None => {}
        }

        if let Some(transition) = &scene.transition_from_previous {
            check_transition(transition, i, &entity, issues);
        }

        if segmented {
            check_segments(&entity, &scene.segments, &mut seen_segments, issues);
        }
    }
}

fn check_segments(
    scene_entity: &str,
    segments: &[Segment],
    seen: &mut HashSet<String>,
    issues: &mut Issues,
) {
    if segments.is_empty() {
        issues.error(CATEGORY_STRUCTURE, scene_entity, "scene has no segments");
        return;
    }
    let last = segments.len() - 1;
    for (j, segment) in segments.iter().enumerate() {
        let entity = format!("{scene_entity}.segments[{j}]");
        issues.require(&entity, "id", segment.id.as_deref());
        issues.unique(seen, &entity, segment.id.as_deref());
        issues.require(&entity, "prompt", segment.prompt.as_deref());
        issues.require(&entity, "output_video", segment.output_video.as_deref());
        if j < last && segment.output_keyframe.is_none() {
            issues.error(
                CATEGORY_STRUCTURE,
                &entity,
                "every segment except the last must declare output_keyframe",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: serde_json::Value) -> PipelineDocument {
        PipelineDocument::from_value(value).unwrap()
    }

    fn messages(result: &ValidationResult) -> Vec<String> {
        result.errors.iter().map(ToString::to_string).collect()
    }

    fn valid_v3() -> serde_json::Value {
        json!({
            "project_name": "demo",
            "assets": {"characters": {"alice": {"prompt": "a", "output": "alice.png"}}},
            "scenes": [
                {
                    "id": "A", "output_video": "A.mp4",
                    "first_keyframe": {"type": "generated", "prompt": "p", "output": "A.png", "characters": ["alice"]},
                    "segments": [
                        {"id": "A1", "prompt": "m", "output_video": "A1.mp4", "output_keyframe": "A1.png"},
                        {"id": "A2", "prompt": "m", "output_video": "A2.mp4"}
                    ]
                },
                {
                    "id": "B", "output_video": "B.mp4",
                    "first_keyframe": {"type": "extracted"},
                    "transition_from_previous": {"type": "fade", "duration": 0.5},
                    "segments": [{"id": "B1", "prompt": "m", "output_video": "B1.mp4"}]
                }
            ]
        })
    }

    #[test]
    fn valid_v3_plan_passes() {
        let result = validate(&doc(valid_v3()));
        assert!(result.passed, "{:?}", messages(&result));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn non_last_segment_without_output_keyframe() {
        let mut value = valid_v3();
        value["scenes"][0]["segments"][0]
            .as_object_mut()
            .unwrap()
            .remove("output_keyframe");
        let result = validate(&doc(value));
        assert!(!result.passed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].entity.as_deref(), Some("scenes[0].segments[0]"));
        assert_eq!(result.errors[0].category, CATEGORY_STRUCTURE);
    }

    #[test]
    fn collects_every_defect() {
        let mut value = valid_v3();
        value["scenes"][0]["first_keyframe"]["type"] = json!("extracted");
        value["scenes"][0]["transition_from_previous"] = json!({"type": "cut"});
        value["scenes"][1]["transition_from_previous"]["type"] = json!("wipe");
        value["scenes"][0]["first_keyframe"]["characters"] = json!(["ghost"]);

        let result = validate(&doc(value));
        let msgs = messages(&result).join("\n");
        assert!(msgs.contains("cannot start from an extracted keyframe"), "{msgs}");
        assert!(msgs.contains("cannot have a transition_from_previous"), "{msgs}");
        assert!(msgs.contains("wipe"), "{msgs}");
        assert!(msgs.contains("character 'ghost' not found"), "{msgs}");
    }

    #[test]
    fn missing_duration_is_a_warning() {
        let mut value = valid_v3();
        value["scenes"][1]["transition_from_previous"] = json!({"type": "dissolve"});
        let result = validate(&doc(value));
        assert!(result.passed);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn non_positive_fade_duration_is_an_error() {
        let mut value = valid_v3();
        value["scenes"][1]["transition_from_previous"]["duration"] = json!(0.0);
        assert!(!validate(&doc(value)).passed);
    }

    #[test]
    fn duplicate_segment_ids_across_scenes() {
        let mut value = valid_v3();
        value["scenes"][1]["segments"][0]["id"] = json!("A1");
        let result = validate(&doc(value));
        assert!(result.errors.iter().any(|e| e.category == CATEGORY_DUPLICATE_ID));
    }

    #[test]
    fn v1_dangling_keyframe_reference() {
        let result = validate(&doc(json!({
            "project_name": "legacy",
            "keyframes": [{"id": "k1", "prompt": "p", "output": "k1.png"}],
            "videos": [
                {"id": "v1", "prompt": "p", "output": "v1.mp4", "start_keyframe": "k1"},
                {"id": "v2", "prompt": "p", "output": "v2.mp4", "start_keyframe": "k1", "end_keyframe": "k9"}
            ]
        })));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("k9"));
    }

    #[test]
    fn v2_requires_first_keyframe() {
        let result = validate(&doc(json!({
            "project_name": "p",
            "version": 2,
            "scenes": [{"id": "S1", "prompt": "p", "output_video": "s.mp4"}]
        })));
        assert!(messages(&result)
            .iter()
            .any(|m| m.contains("first_keyframe")));
    }

    #[test]
    fn pose_assets_by_mode() {
        let result = validate(&doc(json!({
            "project_name": "p",
            "assets": {"poses": {
                "wave": {"type": "extract", "output": "wave.png"},
                "sit": {"type": "generate", "prompt": "sitting", "output": "sit.png"},
                "jump": {"type": "dance", "output": "jump.png"}
            }}
        })));
        let msgs = messages(&result);
        assert_eq!(msgs.len(), 2, "{msgs:?}");
        assert!(msgs[0].contains("source"));
        assert!(msgs[1].contains("dance"));
    }
}
