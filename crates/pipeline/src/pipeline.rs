//! The orchestrator facade used by the binary.

use std::sync::Arc;

use storyloom_core::plan::{EntityKey, PipelineDocument, PlanVersion, Stage, ValidationResult};
use storyloom_store::PlanStore;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::media::MediaTool;
use crate::runner::{runner_for, StageContext, StageReport, StageRunner};
use crate::summary::StatusSummary;
use crate::tool::GenerationTool;

pub struct Pipeline {
    store: PlanStore,
    tool: Arc<dyn GenerationTool>,
    media: Arc<dyn MediaTool>,
    runner: Box<dyn StageRunner>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Wrap an opened plan. The runner is fixed by the plan's layout.
    pub fn new(store: PlanStore, tool: Arc<dyn GenerationTool>, media: Arc<dyn MediaTool>) -> Self {
        let runner = runner_for(store.version());
        tracing::debug!(version = %store.version(), plan = %store.path().display(), "Pipeline ready");
        Self {
            store,
            tool,
            media,
            runner,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a token that stops the run before the next entity.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    pub fn document(&self) -> &PipelineDocument {
        self.store.document()
    }

    pub fn version(&self) -> PlanVersion {
        self.store.version()
    }

    pub fn validate(&self) -> ValidationResult {
        self.store.validate()
    }

    pub fn status_summary(&self) -> StatusSummary {
        StatusSummary::from_document(self.document())
    }

    /// Run one stage over the whole plan.
    pub async fn run_stage(&mut self, stage: Stage) -> Result<StageReport, PipelineError> {
        self.ensure_supported(stage)?;
        self.ensure_valid()?;
        self.execute(stage, None).await
    }

    /// Run every stage of the plan's layout in order. `confirm` is asked
    /// before each stage after the first; returning `false` stops the run.
    pub async fn run_all<F>(&mut self, mut confirm: F) -> Result<Vec<StageReport>, PipelineError>
    where
        F: FnMut(Stage) -> bool,
    {
        let mut reports = Vec::new();
        for (i, stage) in self.version().stages().iter().copied().enumerate() {
            if i > 0 && !confirm(stage) {
                tracing::info!(%stage, "Stopped by operator");
                break;
            }
            reports.push(self.run_stage(stage).await?);
        }
        Ok(reports)
    }

    /// Reset one entity to `pending` and rerun its stage for that entity
    /// alone. Regenerating anything that feeds the final video also resets
    /// the final video so it is rebuilt.
    pub async fn regenerate(&mut self, id: &str) -> Result<StageReport, PipelineError> {
        self.ensure_valid()?;
        let doc = self.document();
        let key = doc
            .locate(id)
            .ok_or_else(|| PipelineError::UnknownEntity(id.to_string()))?;

        let stage = match &key {
            EntityKey::Asset { .. } => Stage::Assets,
            EntityKey::Keyframe(_) | EntityKey::FirstKeyframe => Stage::Keyframes,
            EntityKey::SceneKeyframe(scene) => {
                if doc.keyframe(&key).is_some_and(|kf| kf.is_extracted()) {
                    return Err(PipelineError::NotRegenerable {
                        id: id.to_string(),
                        hint: format!("it is extracted from the previous scene; regenerate scene '{scene}'"),
                    });
                }
                Stage::Keyframes
            }
            EntityKey::Video(_) => Stage::Videos,
            EntityKey::Scene(_) | EntityKey::Segment { .. } | EntityKey::FinalVideo => {
                Stage::Scenes
            }
        };
        self.ensure_supported(stage)?;
        let resets_final = stage == Stage::Scenes
            && key != EntityKey::FinalVideo
            && doc.final_video().is_some();

        self.store.reset(&key)?;
        if resets_final {
            self.store.reset(&EntityKey::FinalVideo)?;
        }
        tracing::info!(entity = %key, %stage, "Regenerating");
        self.execute(stage, Some(key)).await
    }

    fn ensure_supported(&self, stage: Stage) -> Result<(), PipelineError> {
        let version = self.version();
        if version.supports(stage) {
            Ok(())
        } else {
            Err(PipelineError::IncompatibleStage { stage, version })
        }
    }

    fn ensure_valid(&self) -> Result<(), PipelineError> {
        let result = self.validate();
        for warning in &result.warnings {
            tracing::warn!(issue = %warning, "Plan warning");
        }
        if result.passed {
            Ok(())
        } else {
            Err(PipelineError::ValidationRefused(result))
        }
    }

    async fn execute(
        &mut self,
        stage: Stage,
        scope: Option<EntityKey>,
    ) -> Result<StageReport, PipelineError> {
        tracing::info!(%stage, version = %self.store.version(), "Running stage");
        let mut ctx = StageContext::new(stage, &mut self.store, self.tool.as_ref(), self.media.as_ref())
            .with_cancellation(self.cancel.clone())
            .with_scope(scope);
        self.runner.run(&mut ctx).await?;
        let report = ctx.into_report();
        tracing::info!(
            %stage,
            generated = report.generated.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            invocations = report.invocations,
            elapsed_ms = report.elapsed_ms().unwrap_or_default(),
            "Stage finished",
        );
        Ok(report)
    }
}
