//! Pipeline orchestration: stage runners, the generation tool seam, media
//! assembly and the [`Pipeline`] facade that ties them to a plan store.

pub mod assembler;
pub mod error;
pub mod keyframe;
pub mod media;
pub mod pipeline;
pub mod runner;
pub mod summary;
pub mod tool;

pub use assembler::{MediaAssembler, SceneClip};
pub use error::PipelineError;
pub use media::MediaTool;
pub use pipeline::Pipeline;
pub use runner::{runner_for, StageContext, StageReport, StageRunner};
pub use summary::StatusSummary;
pub use tool::{GenerationKind, GenerationRequest, GenerationTool, ProcessTool, ToolError};
