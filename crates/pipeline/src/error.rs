use storyloom_core::error::CoreError;
use storyloom_core::ffmpeg::FfmpegError;
use storyloom_core::frame::FrameError;
use storyloom_core::plan::{PlanVersion, Stage, ValidationResult};
use storyloom_store::StoreError;

/// Process exit code for a plan that failed validation.
pub const EXIT_VALIDATION: i32 = 2;
/// Process exit code for every other fatal error.
pub const EXIT_FATAL: i32 = 1;

/// Fatal orchestration errors. Per-entity generation failures are not
/// errors at this level: they are recorded as `failed` statuses and the
/// run continues.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Plan failed validation with {} error(s); nothing was run", .0.errors.len())]
    ValidationRefused(ValidationResult),

    #[error("Stage '{stage}' is not available for {version} plans (supported: {})", supported(*.version))]
    IncompatibleStage { stage: Stage, version: PlanVersion },

    #[error("No entity with id '{0}' in this plan")]
    UnknownEntity(String),

    #[error("'{id}' cannot be regenerated on its own: {hint}")]
    NotRegenerable { id: String, hint: String },

    #[error("Run cancelled before {0}")]
    Cancelled(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Media error: {0}")]
    Media(#[from] FfmpegError),

    #[error("Frame check failed: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Exit code the binary reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ValidationRefused(_) => EXIT_VALIDATION,
            _ => EXIT_FATAL,
        }
    }
}

fn supported(version: PlanVersion) -> String {
    version
        .stages()
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_refusal_maps_to_its_own_exit_code() {
        let err = PipelineError::ValidationRefused(ValidationResult::from_issues(Vec::new()));
        assert_eq!(err.exit_code(), EXIT_VALIDATION);
        assert_eq!(
            PipelineError::UnknownEntity("x".into()).exit_code(),
            EXIT_FATAL
        );
    }

    #[test]
    fn incompatible_stage_lists_supported_stages() {
        let err = PipelineError::IncompatibleStage {
            stage: Stage::Videos,
            version: PlanVersion::V3,
        };
        assert_eq!(
            err.to_string(),
            "Stage 'videos' is not available for v3 plans (supported: assets, keyframes, scenes)"
        );
    }
}
