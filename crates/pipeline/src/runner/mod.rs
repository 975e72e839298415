//! Stage runners.
//!
//! One [`StageRunner`] exists per plan layout and is chosen once, when the
//! plan is loaded. Runners walk their entities in declaration order
//! through a [`StageContext`], which owns the per-entity protocol:
//!
//! 1. `generated`/`approved` entities are skipped.
//! 2. Inputs are resolved to files on disk; a missing input marks the
//!    entity `failed` without invoking anything.
//! 3. The entity goes `in_progress`, the generation tool runs, and the
//!    entity ends `generated` or `failed`.
//!
//! Every status change is persisted by the store before the next step.

pub mod legacy;
pub mod scenes;
pub mod segments;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use storyloom_core::plan::{AssetKind, EntityKey, PipelineDocument, PlanBody, PlanVersion, Stage};
use storyloom_core::status::Status;
use storyloom_store::PlanStore;
use tokio_util::sync::CancellationToken;

use crate::assembler::{MediaAssembler, SceneClip};
use crate::error::PipelineError;
use crate::keyframe::extract_representative_frame;
use crate::media::MediaTool;
use crate::tool::{GenerationKind, GenerationRequest, GenerationTool, ToolError};

pub use legacy::LegacyRunner;
pub use scenes::SceneRunner;
pub use segments::SegmentRunner;

/// Executes the stages of one plan layout.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn version(&self) -> PlanVersion;

    /// Run `ctx.stage()` over the plan held by the context.
    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError>;
}

/// The runner for a plan layout.
pub fn runner_for(version: PlanVersion) -> Box<dyn StageRunner> {
    match version {
        PlanVersion::V1 => Box::new(LegacyRunner),
        PlanVersion::V2 => Box::new(SceneRunner),
        PlanVersion::V3 => Box::new(SegmentRunner),
    }
}

fn incompatible(stage: Stage, version: PlanVersion) -> PipelineError {
    PipelineError::IncompatibleStage { stage, version }
}

// ---------------------------------------------------------------------------
// Stage report
// ---------------------------------------------------------------------------

/// An entity that ended the stage in `failed`, or an assembly step that
/// did not complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedEntity {
    pub entity: String,
    pub reason: String,
}

/// What one stage run did.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub generated: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedEntity>,
    /// Generation tool invocations.
    pub invocations: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            generated: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            invocations: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Wall-clock time of the stage, once finished.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} generated, {} skipped, {} failed",
            self.stage,
            self.generated.len(),
            self.skipped.len(),
            self.failed.len()
        )?;
        for failure in &self.failed {
            write!(f, "\n  x {}: {}", failure.entity, failure.reason)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stage context
// ---------------------------------------------------------------------------

/// Everything a runner needs for one stage: the store, the two external
/// seams, the cancellation token, and an optional regeneration scope.
pub struct StageContext<'a> {
    stage: Stage,
    store: &'a mut PlanStore,
    tool: &'a dyn GenerationTool,
    media: &'a dyn MediaTool,
    cancel: CancellationToken,
    scope: Option<EntityKey>,
    memory_hint_pending: bool,
    report: StageReport,
}

impl<'a> StageContext<'a> {
    pub fn new(
        stage: Stage,
        store: &'a mut PlanStore,
        tool: &'a dyn GenerationTool,
        media: &'a dyn MediaTool,
    ) -> Self {
        Self {
            stage,
            store,
            tool,
            media,
            cancel: CancellationToken::new(),
            scope: None,
            memory_hint_pending: true,
            report: StageReport::new(stage),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Restrict the run to one entity (and, for a scene, its segments).
    pub fn with_scope(mut self, scope: Option<EntityKey>) -> Self {
        self.scope = scope;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn document(&self) -> &PipelineDocument {
        self.store.document()
    }

    pub fn media(&self) -> &'a dyn MediaTool {
        self.media
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.store.resolve(relative)
    }

    pub fn into_report(mut self) -> StageReport {
        self.report.finished_at = Some(Utc::now());
        self.report
    }

    // ---- scope ----

    pub fn in_scope(&self, key: &EntityKey) -> bool {
        match (&self.scope, key) {
            (None, _) => true,
            (Some(EntityKey::Scene(scope)), EntityKey::Segment { scene, .. }) => scope == scene,
            (Some(scope), key) => scope == key,
        }
    }

    /// Whether assembly work for `scene_id` belongs to this run.
    pub fn scene_in_scope(&self, scene_id: &str) -> bool {
        match &self.scope {
            None => true,
            Some(EntityKey::Scene(scene)) | Some(EntityKey::Segment { scene, .. }) => {
                scene == scene_id
            }
            Some(_) => false,
        }
    }

    pub fn final_in_scope(&self) -> bool {
        matches!(
            self.scope,
            None | Some(EntityKey::Scene(_) | EntityKey::Segment { .. } | EntityKey::FinalVideo)
        )
    }

    // ---- per-entity protocol ----

    /// Stop cooperatively if the operator cancelled the run.
    pub fn checkpoint(&self, next: &EntityKey) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            tracing::warn!(stage = %self.stage, next = %next, "Run cancelled");
            return Err(PipelineError::Cancelled(next.to_string()));
        }
        Ok(())
    }

    pub fn status(&self, key: &EntityKey) -> Status {
        self.document().status_of(key).unwrap_or_default()
    }

    pub fn skip(&mut self, key: &EntityKey) {
        tracing::info!(stage = %self.stage, entity = %key, "Already done, skipping");
        self.report.skipped.push(key.to_string());
    }

    /// A required input is missing: the entity fails without an attempt.
    pub fn block(&mut self, key: &EntityKey, reason: impl Into<String>) -> Result<(), PipelineError> {
        let reason = reason.into();
        tracing::warn!(stage = %self.stage, entity = %key, %reason, "Dependency missing");
        self.store.set_status(key, Status::Failed)?;
        self.record_failure(key.to_string(), reason);
        Ok(())
    }

    pub fn begin(&mut self, key: &EntityKey) -> Result<(), PipelineError> {
        self.store.set_status(key, Status::InProgress)?;
        Ok(())
    }

    pub fn succeed(&mut self, key: &EntityKey) -> Result<(), PipelineError> {
        self.store.set_status(key, Status::Generated)?;
        tracing::info!(stage = %self.stage, entity = %key, "Generated");
        self.report.generated.push(key.to_string());
        Ok(())
    }

    pub fn fail(&mut self, key: &EntityKey, reason: impl Into<String>) -> Result<(), PipelineError> {
        let reason = reason.into();
        tracing::error!(stage = %self.stage, entity = %key, %reason, "Generation failed");
        self.store.set_status(key, Status::Failed)?;
        self.record_failure(key.to_string(), reason);
        Ok(())
    }

    /// Note a failure that has no status of its own (scene assembly).
    pub fn record_failure(&mut self, entity: String, reason: String) {
        self.report.failed.push(FailedEntity { entity, reason });
    }

    /// Run the generation tool. The first invocation of a stage carries
    /// the memory-release hint.
    pub async fn invoke(&mut self, mut request: GenerationRequest) -> Result<(), ToolError> {
        request.free_memory = std::mem::take(&mut self.memory_hint_pending);
        self.report.invocations += 1;
        tracing::info!(
            stage = %self.stage,
            entity = %request.entity,
            kind = %request.kind,
            output = %request.output.display(),
            "Generating",
        );
        self.tool.generate(&request).await
    }

    /// `in_progress`, invoke, then `generated` or `failed`. Returns whether
    /// the entity succeeded.
    pub async fn run_entity(
        &mut self,
        key: &EntityKey,
        request: GenerationRequest,
    ) -> Result<bool, PipelineError> {
        self.begin(key)?;
        match self.invoke(request).await {
            Ok(()) => {
                self.succeed(key)?;
                Ok(true)
            }
            Err(e) => {
                self.fail(key, e.to_string())?;
                Ok(false)
            }
        }
    }

    /// Mark an extracted scene keyframe as produced.
    pub fn settle_extracted(&mut self, scene_id: &str) -> Result<(), PipelineError> {
        let key = EntityKey::SceneKeyframe(scene_id.to_string());
        let extracted = self
            .document()
            .keyframe(&key)
            .is_some_and(|kf| kf.is_extracted());
        if !extracted || self.status(&key).is_done() {
            return Ok(());
        }
        self.begin(&key)?;
        self.store.set_status(&key, Status::Generated)?;
        Ok(())
    }

    // ---- dependency resolution ----

    /// A declared path that must already exist.
    fn existing(&self, relative: Option<&str>, what: &str) -> Result<PathBuf, String> {
        let relative = relative.ok_or_else(|| format!("{what} declares no path"))?;
        let path = self.resolve(relative);
        if path.is_file() {
            Ok(path)
        } else {
            Err(format!("{what} {} does not exist", path.display()))
        }
    }

    fn asset_file(&self, kind: AssetKind, id: &str) -> Result<PathBuf, String> {
        let asset = self
            .document()
            .assets
            .get(kind, id)
            .ok_or_else(|| format!("{kind} '{id}' is not declared"))?;
        self.existing(asset.output.as_deref(), &format!("{kind} '{id}'"))
    }

    fn keyframe_file(&self, id: &str) -> Result<PathBuf, String> {
        let doc = self.document();
        let kf = doc
            .locate_keyframe(id)
            .and_then(|key| doc.keyframe(&key))
            .ok_or_else(|| format!("keyframe '{id}' is not declared"))?;
        self.existing(kf.output.as_deref(), &format!("keyframe '{id}'"))
    }

    /// Build the request for an independent entity: an asset, a keyframe
    /// or a v1 video.
    pub fn request_for(&self, key: &EntityKey) -> Result<GenerationRequest, String> {
        let doc = self.document();
        let output = |relative: Option<&str>| {
            relative
                .map(|r| self.resolve(r))
                .ok_or_else(|| "no output path declared".to_string())
        };

        match key {
            EntityKey::Asset { kind, id } => {
                let asset = doc
                    .assets
                    .get(*kind, id)
                    .ok_or_else(|| format!("{kind} '{id}' is not declared"))?;
                let mut request = if *kind == AssetKind::Pose && asset.is_extracted() {
                    let mut request = GenerationRequest::new(
                        GenerationKind::PoseExtract,
                        key.to_string(),
                        output(asset.output.as_deref())?,
                    );
                    request.reference =
                        Some(self.existing(asset.source.as_deref(), "pose source")?);
                    request
                } else {
                    GenerationRequest::new(
                        (*kind).into(),
                        key.to_string(),
                        output(asset.output.as_deref())?,
                    )
                };
                request.prompt = asset.prompt.clone();
                request.settings = asset.settings.clone();
                Ok(request)
            }
            EntityKey::Video(id) => {
                let video = match &doc.body {
                    PlanBody::Legacy { videos, .. } => videos
                        .iter()
                        .find(|v| v.id.as_deref() == Some(id.as_str())),
                    _ => None,
                }
                .ok_or_else(|| format!("video '{id}' is not declared"))?;

                let start = video
                    .start_keyframe
                    .as_deref()
                    .ok_or_else(|| "no start_keyframe declared".to_string())?;
                let mut request = GenerationRequest::new(
                    GenerationKind::Video,
                    key.to_string(),
                    output(video.output.as_deref())?,
                );
                request.prompt = video.prompt.clone();
                request.start_frame = Some(self.keyframe_file(start)?);
                if let Some(end) = video.end_keyframe.as_deref() {
                    request.end_frame = Some(self.keyframe_file(end)?);
                }
                request.settings = video.settings.clone();
                Ok(request)
            }
            _ => {
                let kf = doc
                    .keyframe(key)
                    .ok_or_else(|| format!("{key} is not declared"))?;
                let mut request = GenerationRequest::new(
                    GenerationKind::Keyframe,
                    key.to_string(),
                    output(kf.output.as_deref())?,
                );
                request.prompt = kf.prompt.clone();
                request.characters = kf
                    .characters
                    .iter()
                    .map(|name| self.asset_file(AssetKind::Character, name))
                    .collect::<Result<_, _>>()?;
                request.background = kf
                    .background
                    .as_deref()
                    .map(|name| self.asset_file(AssetKind::Background, name))
                    .transpose()?;
                request.pose = kf
                    .pose
                    .as_deref()
                    .map(|name| self.asset_file(AssetKind::Pose, name))
                    .transpose()?;
                request.style = kf
                    .style
                    .as_deref()
                    .map(|name| self.asset_file(AssetKind::Style, name))
                    .transpose()?;
                request.settings = kf.settings.clone();
                Ok(request)
            }
        }
    }

    /// Start frame of the scene at `index`.
    ///
    /// A generated start uses the scene's own keyframe (or, in a v2 plan,
    /// the top-level first keyframe for scene 0). An extracted start reuses
    /// the previous scene's last segment keyframe when one exists, and
    /// otherwise takes the representative frame of the previous scene's
    /// video. The frame lands in the scene's `first_keyframe.output`, or
    /// next to the previous video as `<stem>_last.png`.
    pub async fn scene_start(&self, index: usize) -> Result<PathBuf, String> {
        let doc = self.document();
        let scenes = doc.scenes();
        let scene = scenes
            .get(index)
            .ok_or_else(|| format!("no scene at index {index}"))?;

        if !scene.starts_extracted(index) {
            let kf = match &scene.first_keyframe {
                Some(kf) => Some(kf),
                None if index == 0 => doc.keyframe(&EntityKey::FirstKeyframe),
                None => None,
            };
            let relative = kf.and_then(|kf| kf.output.as_deref());
            return self.existing(relative, &format!("start keyframe of scene '{}'", scene.id()));
        }

        let previous = index
            .checked_sub(1)
            .and_then(|i| scenes.get(i))
            .ok_or_else(|| "the first scene cannot start from an extracted frame".to_string())?;
        let video = previous
            .output_video
            .as_deref()
            .map(|r| self.resolve(r))
            .ok_or_else(|| format!("scene '{}' declares no output_video", previous.id()))?;
        let target = match scene.first_keyframe.as_ref().and_then(|kf| kf.output.as_deref()) {
            Some(relative) => self.resolve(relative),
            None => last_frame_path(&video),
        };
        let tail_keyframe = previous
            .segments
            .last()
            .and_then(|s| s.output_keyframe.as_deref())
            .map(|r| self.resolve(r))
            .filter(|p| p.is_file());

        if let Some(keyframe) = tail_keyframe {
            if keyframe != target {
                copy_file(&keyframe, &target).await?;
            }
            return Ok(target);
        }

        if !video.is_file() {
            return Err(format!(
                "scene '{}' video {} does not exist",
                previous.id(),
                video.display()
            ));
        }
        extract_representative_frame(self.media, &video, &target)
            .await
            .map_err(|e| format!("could not extract start frame: {e}"))?;
        tracing::info!(
            scene = %scene.id(),
            from = %video.display(),
            to = %target.display(),
            "Extracted scene start frame",
        );
        Ok(target)
    }

    // ---- final video ----

    /// Merge all scene videos into the final cut once every scene is done.
    pub async fn finish_final_video(&mut self) -> Result<(), PipelineError> {
        if !self.final_in_scope() {
            return Ok(());
        }
        let key = EntityKey::FinalVideo;
        let doc = self.document();
        let Some(final_video) = doc.final_video() else {
            return Ok(());
        };
        if final_video.status.is_done() {
            self.skip(&key);
            return Ok(());
        }

        let mut clips = Vec::with_capacity(doc.scenes().len());
        for (index, scene) in doc.scenes().iter().enumerate() {
            if !doc.scene_status(index).is_some_and(Status::is_done) {
                tracing::info!(scene = %scene.id(), "Final video waits for unfinished scene");
                return Ok(());
            }
            let video = self.existing(
                scene.output_video.as_deref(),
                &format!("scene '{}' video", scene.id()),
            );
            let clip = video.and_then(|video| {
                let transition = scene.transition(index)?;
                Ok(SceneClip { video, transition })
            });
            match clip {
                Ok(clip) => clips.push(clip),
                Err(reason) => return self.block(&key, reason),
            }
        }
        let output = match final_video.output.as_deref() {
            Some(relative) => self.resolve(relative),
            None => return self.block(&key, "no output path declared"),
        };

        self.checkpoint(&key)?;
        self.begin(&key)?;
        let merged = MediaAssembler::new(self.media)
            .merge_all_scenes(&clips, &output)
            .await;
        match merged {
            Ok(()) => self.succeed(&key),
            Err(e) => self.fail(&key, format!("final merge failed: {e}")),
        }
    }
}

/// `<dir>/<stem>_last.png` next to `video`.
pub fn last_frame_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scene".to_string());
    video.with_file_name(format!("{stem}_last.png"))
}

async fn copy_file(from: &Path, to: &Path) -> Result<(), String> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("could not create {}: {e}", parent.display()))?;
    }
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|e| format!("could not copy {} to {}: {e}", from.display(), to.display()))
}

// ---------------------------------------------------------------------------
// Shared stage bodies
// ---------------------------------------------------------------------------

/// Run independent entities in order. A failure never stops the loop.
pub async fn run_independent(
    ctx: &mut StageContext<'_>,
    keys: Vec<EntityKey>,
) -> Result<(), PipelineError> {
    for key in keys {
        if !ctx.in_scope(&key) {
            continue;
        }
        if ctx.status(&key).is_done() {
            ctx.skip(&key);
            continue;
        }
        ctx.checkpoint(&key)?;
        match ctx.request_for(&key) {
            Ok(request) => {
                ctx.run_entity(&key, request).await?;
            }
            Err(reason) => ctx.block(&key, reason)?,
        }
    }
    Ok(())
}

/// Every asset, section by section in declaration order.
pub fn asset_keys(doc: &PipelineDocument) -> Vec<EntityKey> {
    AssetKind::ALL
        .into_iter()
        .flat_map(|kind| {
            doc.assets.section(kind).keys().map(move |id| EntityKey::Asset {
                kind,
                id: id.clone(),
            })
        })
        .collect()
}

/// Scene first keyframes that are generated rather than extracted.
pub fn generated_scene_keyframes(doc: &PipelineDocument) -> Vec<EntityKey> {
    doc.scenes()
        .iter()
        .filter(|scene| {
            scene
                .first_keyframe
                .as_ref()
                .is_some_and(|kf| !kf.is_extracted())
        })
        .map(|scene| EntityKey::SceneKeyframe(scene.id().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_frame_sits_next_to_the_video() {
        assert_eq!(
            last_frame_path(Path::new("out/scenes/a.mp4")),
            PathBuf::from("out/scenes/a_last.png")
        );
    }

    #[test]
    fn each_layout_has_its_own_runner() {
        for version in [PlanVersion::V1, PlanVersion::V2, PlanVersion::V3] {
            assert_eq!(runner_for(version).version(), version);
        }
    }

    #[test]
    fn report_lists_failures() {
        let mut report = StageReport::new(Stage::Scenes);
        report.generated.push("segment:A/A1".into());
        report.failed.push(FailedEntity {
            entity: "segment:A/A2".into(),
            reason: "boom".into(),
        });
        assert!(!report.is_clean());
        assert_eq!(
            report.to_string(),
            "scenes: 1 generated, 0 skipped, 1 failed\n  x segment:A/A2: boom"
        );
    }
}
