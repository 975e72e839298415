//! v2 runner: one generated video per scene.

use async_trait::async_trait;
use storyloom_core::plan::{EntityKey, PlanVersion, Stage};

use super::{
    asset_keys, generated_scene_keyframes, incompatible, run_independent, StageContext,
    StageRunner,
};
use crate::error::PipelineError;
use crate::tool::{GenerationKind, GenerationRequest};

pub struct SceneRunner;

#[async_trait]
impl StageRunner for SceneRunner {
    fn version(&self) -> PlanVersion {
        PlanVersion::V2
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        match ctx.stage() {
            Stage::Assets => {
                let keys = asset_keys(ctx.document());
                run_independent(ctx, keys).await
            }
            Stage::Keyframes => {
                let doc = ctx.document();
                let mut keys = Vec::new();
                if doc.keyframe(&EntityKey::FirstKeyframe).is_some() {
                    keys.push(EntityKey::FirstKeyframe);
                }
                keys.extend(generated_scene_keyframes(doc));
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
    let scene = ctx.document().scenes()[index].clone();
    let key = EntityKey::Scene(scene.id().to_string());
    if !ctx.in_scope(&key) {
        return Ok(());
    }
    if ctx.status(&key).is_done() {
        ctx.skip(&key);
        return Ok(());
    }
    ctx.checkpoint(&key)?;

    let start = match ctx.scene_start(index).await {
        Ok(path) => path,
        Err(reason) => return ctx.block(&key, reason),
    };
    ctx.settle_extracted(scene.id())?;

    let Some(output) = scene.output_video.as_deref().map(|r| ctx.resolve(r)) else {
        return ctx.block(&key, "no output_video declared");
    };
    let mut request = GenerationRequest::new(GenerationKind::Video, key.to_string(), output);
    request.prompt = scene.prompt.clone();
    request.start_frame = Some(start);
    request.settings = scene.settings.clone();

    ctx.run_entity(&key, request).await?;
    Ok(())
}
