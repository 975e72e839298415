use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use storyloom_comfyui::ResolutionPreset;
use storyloom_core::plan::Stage;
use storyloom_pipeline::GenerationKind;

#[derive(Parser)]
#[command(name = "storyloom")]
#[command(author, version, about = "Plan-driven image and video production pipeline")]
pub struct Cli {
    /// Path to the plan document
    #[arg(short, long, global = true, env = "STORYLOOM_PLAN", default_value = "pipeline.json")]
    pub plan: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one stage over the whole plan
    Run {
        /// assets, keyframes, videos (v1) or scenes (v2/v3)
        #[arg(short, long)]
        stage: Stage,
    },

    /// Run every stage of the plan in order
    All {
        /// Do not ask for confirmation between stages
        #[arg(short, long)]
        yes: bool,
    },

    /// Reset one entity to pending and generate it again
    Regenerate {
        /// Entity id (asset, keyframe, video, scene or segment)
        id: String,
    },

    /// Show per-entity status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the plan and list every defect
    Validate,

    /// Produce one artifact through ComfyUI (the per-entity generator)
    Generate(GenerateArgs),
}

/// Flags of the generator contract, one request per invocation.
#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(long)]
    pub kind: GenerationKind,

    #[arg(long)]
    pub prompt: Option<String>,

    /// Where the artifact is written
    #[arg(long)]
    pub output: PathBuf,

    /// Character reference image (repeatable)
    #[arg(long = "character")]
    pub characters: Vec<PathBuf>,

    #[arg(long)]
    pub background: Option<PathBuf>,

    #[arg(long)]
    pub pose: Option<PathBuf>,

    #[arg(long)]
    pub style: Option<PathBuf>,

    /// Source image for pose extraction
    #[arg(long)]
    pub reference: Option<PathBuf>,

    #[arg(long)]
    pub start_frame: Option<PathBuf>,

    #[arg(long)]
    pub end_frame: Option<PathBuf>,

    /// low, medium or high
    #[arg(long)]
    pub preset: Option<ResolutionPreset>,

    #[arg(long)]
    pub control_strength: Option<f64>,

    #[arg(long)]
    pub seed: Option<i64>,

    /// Clip length in frames
    #[arg(long)]
    pub length: Option<u32>,

    /// Ask the backend to unload models before running
    #[arg(long)]
    pub free_memory: bool,
}
