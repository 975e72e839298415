//! v3 runner: scenes built from ordered segments.
//!
//! Segments inside a scene are strictly sequential. Each one starts from
//! the keyframe its predecessor left behind, so the first failure halts
//! the rest of that scene. Scenes themselves stay independent: a failed
//! scene does not stop the next one from trying.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use storyloom_core::plan::{EntityKey, PlanVersion, Segment, Stage};
use storyloom_core::status::Status;

use super::{
    asset_keys, generated_scene_keyframes, incompatible, run_independent, StageContext,
    StageRunner,
};
use crate::assembler::MediaAssembler;
use crate::error::PipelineError;
use crate::keyframe::extract_representative_frame;
use crate::tool::{GenerationKind, GenerationRequest};

pub struct SegmentRunner;

#[async_trait]
impl StageRunner for SegmentRunner {
    fn version(&self) -> PlanVersion {
        PlanVersion::V3
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        match ctx.stage() {
            Stage::Assets => {
                let keys = asset_keys(ctx.document());
                run_independent(ctx, keys).await
            }
            Stage::Keyframes => {
                let keys = generated_scene_keyframes(ctx.document());
                run_independent(ctx, keys).await
            }
            Stage::Scenes => {
                for index in 0..ctx.document().scenes().len() {
                    run_scene(ctx, index).await?;
                }
                ctx.finish_final_video().await
            }
            stage => Err(incompatible(stage, self.version())),
        }
    }
}

async fn run_scene(ctx: &mut StageContext<'_>, index: usize) -> Result<(), PipelineError> {
    let scene = &ctx.document().scenes()[index];
    let scene_id = scene.id().to_string();
    let segments: Vec<Segment> = scene.segments.clone();
    if !ctx.scene_in_scope(&scene_id) {
        return Ok(());
    }

    // Start frame for the next segment that needs work; `None` until
    // something has produced one.
    let mut start: Option<PathBuf> = None;
    let mut changed = false;

    for (position, segment) in segments.iter().enumerate() {
        let segment_id = segment.id.clone().unwrap_or_default();
        let key = EntityKey::Segment {
            scene: scene_id.clone(),
            segment: segment_id,
        };
        let keyframe = segment.output_keyframe.as_deref().map(|r| ctx.resolve(r));

        if segment.status.is_done() {
            ctx.skip(&key);
            if let Some(keyframe) = &keyframe {
                repair_keyframe(ctx, &key, segment, keyframe).await;
            }
            start = keyframe;
            continue;
        }
        if !ctx.in_scope(&key) {
            tracing::debug!(entity = %key, "Outside regeneration scope, stopping scene");
            break;
        }
        ctx.checkpoint(&key)?;

        let start_frame = if position == 0 {
            match ctx.scene_start(index).await {
                Ok(path) => {
                    ctx.settle_extracted(&scene_id)?;
                    Ok(path)
                }
                Err(reason) => Err(reason),
            }
        } else {
            match &start {
                Some(path) if path.is_file() => Ok(path.clone()),
                Some(path) => Err(format!(
                    "previous segment keyframe {} does not exist",
                    path.display()
                )),
                None => Err("previous segment declares no output_keyframe".to_string()),
            }
        };
        let output = segment
            .output_video
            .as_deref()
            .map(|r| ctx.resolve(r))
            .ok_or_else(|| "no output_video declared".to_string());

        let (start_frame, output) = match (start_frame, output) {
            (Ok(start_frame), Ok(output)) => (start_frame, output),
            (Err(reason), _) | (_, Err(reason)) => {
                ctx.block(&key, reason)?;
                halt(&key, segments.len() - position - 1);
                break;
            }
        };

        let mut request = GenerationRequest::new(GenerationKind::Video, key.to_string(), &output);
        request.prompt = segment.prompt.clone();
        request.start_frame = Some(start_frame);
        request.settings = segment.settings.clone();

        ctx.begin(&key)?;
        if let Err(e) = ctx.invoke(request).await {
            ctx.fail(&key, e.to_string())?;
            halt(&key, segments.len() - position - 1);
            break;
        }
        if let Some(keyframe) = &keyframe {
            if let Err(e) = extract_representative_frame(ctx.media(), &output, keyframe).await {
                ctx.fail(&key, format!("keyframe extraction failed: {e}"))?;
                halt(&key, segments.len() - position - 1);
                break;
            }
        }
        ctx.succeed(&key)?;
        changed = true;
        start = keyframe;
    }

    assemble_scene(ctx, index, changed).await;
    Ok(())
}

fn halt(key: &EntityKey, remaining: usize) {
    if remaining > 0 {
        tracing::warn!(
            entity = %key,
            remaining,
            "Halting scene, later segments depend on this one",
        );
    }
}

/// A finished segment whose keyframe went missing gets it back from its
/// video without regenerating anything.
async fn repair_keyframe(
    ctx: &mut StageContext<'_>,
    key: &EntityKey,
    segment: &Segment,
    keyframe: &Path,
) {
    if keyframe.is_file() {
        return;
    }
    let Some(video) = segment
        .output_video
        .as_deref()
        .map(|r| ctx.resolve(r))
        .filter(|p| p.is_file())
    else {
        tracing::warn!(entity = %key, "Keyframe and video both missing, cannot repair");
        return;
    };

    tracing::info!(entity = %key, keyframe = %keyframe.display(), "Re-extracting missing keyframe");
    if let Err(e) = extract_representative_frame(ctx.media(), &video, keyframe).await {
        ctx.record_failure(key.to_string(), format!("keyframe repair failed: {e}"));
    }
}

/// Concatenate a finished scene's segments into its video when something
/// changed or the video is missing.
async fn assemble_scene(ctx: &mut StageContext<'_>, index: usize, changed: bool) {
    let doc = ctx.document();
    if !doc.scene_status(index).is_some_and(Status::is_done) {
        return;
    }
    let scene = &doc.scenes()[index];
    let entity = format!("scene:{}", scene.id());
    let Some(output) = scene.output_video.as_deref().map(|r| ctx.resolve(r)) else {
        return;
    };
    if !changed && output.is_file() {
        return;
    }
    // A failed assembly must not leave the previous cut for the final merge.
    if output.is_file() {
        if let Err(e) = tokio::fs::remove_file(&output).await {
            let reason = format!("could not remove stale {}: {e}", output.display());
            tracing::error!(entity = %entity, %reason, "Scene assembly skipped");
            ctx.record_failure(entity, reason);
            return;
        }
    }

    let inputs: Vec<PathBuf> = scene
        .segments
        .iter()
        .filter_map(|s| s.output_video.as_deref())
        .map(|r| ctx.resolve(r))
        .collect();
    if let Some(missing) = inputs.iter().find(|p| !p.is_file()) {
        let reason = format!("segment video {} does not exist", missing.display());
        tracing::error!(entity = %entity, %reason, "Scene assembly skipped");
        ctx.record_failure(entity, reason);
        return;
    }

    let result = MediaAssembler::new(ctx.media())
        .concatenate(&inputs, &output)
        .await;
    match result {
        Ok(()) => tracing::info!(entity = %entity, output = %output.display(), "Scene assembled"),
        Err(e) => {
            tracing::error!(entity = %entity, error = %e, "Scene assembly failed");
            ctx.record_failure(entity, format!("scene assembly failed: {e}"));
        }
    }
}
