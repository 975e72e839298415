//! v1 runner: flat keyframe and video lists. Every entity is independent.

use async_trait::async_trait;
use storyloom_core::plan::{EntityKey, PlanBody, PlanVersion, Stage};

use super::{asset_keys, incompatible, run_independent, StageContext, StageRunner};
use crate::error::PipelineError;

pub struct LegacyRunner;

#[async_trait]
impl StageRunner for LegacyRunner {
    fn version(&self) -> PlanVersion {
        PlanVersion::V1
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let keys = match (ctx.stage(), &ctx.document().body) {
            (Stage::Assets, _) => asset_keys(ctx.document()),
            (Stage::Keyframes, PlanBody::Legacy { keyframes, .. }) => keyframes
                .iter()
                .filter(|kf| {
                    if kf.is_extracted() {
                        tracing::warn!(
                            keyframe = kf.id.as_deref().unwrap_or_default(),
                            "Extracted keyframes are not generated in v1 plans, skipping",
                        );
                    }
                    !kf.is_extracted()
                })
                .filter_map(|kf| kf.id.clone().map(EntityKey::Keyframe))
                .collect(),
            (Stage::Videos, PlanBody::Legacy { videos, .. }) => videos
                .iter()
                .filter_map(|v| v.id.clone().map(EntityKey::Video))
                .collect(),
            (stage, _) => return Err(incompatible(stage, self.version())),
        };
        run_independent(ctx, keys).await
    }
}
