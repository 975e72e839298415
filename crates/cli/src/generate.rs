//! The `generate` sub-command: one request in, one artifact out, through
//! ComfyUI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use storyloom_comfyui::{ComfyUIApi, ComfyUIClient, JobClient, ResolutionPreset, Workflow, WorkflowBuilder};
use storyloom_pipeline::GenerationKind;

use crate::cli::GenerateArgs;
use crate::config::Config;

const IMAGE_STEPS: u32 = 4;
const IMAGE_CFG: f64 = 1.0;
const VIDEO_STEPS: u32 = 8;

/// Workflow template for a request.
pub fn template_name(args: &GenerateArgs) -> anyhow::Result<&'static str> {
    let name = match args.kind {
        GenerationKind::PoseExtract => {
            if args.reference.is_none() {
                bail!("pose extraction needs --reference");
            }
            "pose_extract.json"
        }
        GenerationKind::Video => match (&args.start_frame, &args.end_frame) {
            (Some(_), Some(_)) => "video_flf2v.json",
            (None, None) => bail!("video generation needs --start-frame"),
            _ => "video_i2v.json",
        },
        _ if args.pose.is_some() => "image_pose.json",
        _ if !references(args).is_empty() => "image_edit.json",
        _ => "image_t2i.json",
    };
    Ok(name)
}

/// Reference images in slot order: characters, then background, then style.
fn references(args: &GenerateArgs) -> Vec<PathBuf> {
    args.characters
        .iter()
        .chain(&args.background)
        .chain(&args.style)
        .chain(&args.reference)
        .cloned()
        .collect()
}

/// Fill the template for `args` from `workflow_dir`.
pub fn build_workflow(args: &GenerateArgs, workflow_dir: &Path) -> anyhow::Result<Workflow> {
    let template = workflow_dir.join(template_name(args)?);
    let mut builder = WorkflowBuilder::load(&template)?;

    if let Some(prompt) = &args.prompt {
        builder = builder.prompt(prompt.clone());
    }
    if let Some(preset) = args.preset {
        builder = builder.preset(preset);
    }
    if let Some(seed) = args.seed {
        builder = builder.seed(seed);
    }
    if let Some(strength) = args.control_strength {
        builder = builder.control_strength(strength);
    }

    if args.kind.is_video() {
        // A lone end frame becomes the start frame.
        let (start, end) = match (&args.start_frame, &args.end_frame) {
            (Some(start), end) => (start, end.as_ref()),
            (None, Some(end)) => (end, None),
            (None, None) => bail!("video generation needs --start-frame"),
        };
        builder = builder.start_frame(start).steps(VIDEO_STEPS);
        if let Some(end) = end {
            builder = builder.end_frame(end);
        }
        let length = args
            .length
            .unwrap_or_else(|| args.preset.unwrap_or(ResolutionPreset::Medium).default_length());
        builder = builder.length(length);
    } else {
        for (slot, path) in references(args).into_iter().take(3).enumerate() {
            builder = if slot == 0 {
                builder.reference(path)
            } else {
                builder.extra_reference(slot + 1, path)
            };
        }
        if let Some(pose) = &args.pose {
            builder = builder.pose(pose);
        }
        builder = builder.steps(IMAGE_STEPS).cfg(IMAGE_CFG);
    }

    builder
        .build()
        .with_context(|| format!("Failed to fill workflow {}", template.display()))
}

/// Run one generation request end to end.
pub async fn run(args: GenerateArgs, config: &Config) -> anyhow::Result<()> {
    let workflow = build_workflow(&args, &config.workflow_dir)?;

    let client = Arc::new(ComfyUIClient::from_host(&config.comfyui_host, config.comfyui_port));
    let api = Arc::new(ComfyUIApi::new(client.api_url().to_string()));
    let jobs = JobClient::new(api, client).with_settings(config.job_settings());

    if !jobs.is_available().await {
        bail!(
            "ComfyUI is not reachable at {}:{}",
            config.comfyui_host,
            config.comfyui_port
        );
    }
    if args.free_memory {
        if let Err(e) = jobs.free_memory().await {
            tracing::warn!(error = %e, "Could not release backend memory");
        }
    }

    tracing::info!(kind = %args.kind, output = %args.output.display(), "Submitting job");
    let record = jobs
        .execute(&workflow, config.job_timeout(), |event| {
            tracing::info!(%event, "Job progress");
        })
        .await?;
    let written = jobs
        .download_first(&record, args.kind.is_video(), &args.output)
        .await?;

    tracing::info!(
        prompt_id = %record.prompt_id,
        output = %written.display(),
        "Generation complete",
    );
    Ok(())
}
