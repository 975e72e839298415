mod cli;
mod config;
mod generate;

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use storyloom_core::ffmpeg::Ffmpeg;
use storyloom_core::plan::{Stage, ValidationResult};
use storyloom_pipeline::error::{EXIT_FATAL, EXIT_VALIDATION};
use storyloom_pipeline::{Pipeline, PipelineError, ProcessTool, StageReport, StatusSummary};
use storyloom_store::PlanStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};
use config::Config;

const DEFAULT_LOG_FILTER: &str = "storyloom=info,storyloom_pipeline=info,storyloom_comfyui=info,\
                                  storyloom_store=info,storyloom_core=info";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            let code = match err.downcast_ref::<PipelineError>() {
                Some(PipelineError::ValidationRefused(result)) => {
                    print_validation(result);
                    EXIT_VALIDATION
                }
                Some(e) => e.exit_code(),
                None => EXIT_FATAL,
            };
            tracing::error!(error = %format!("{err:#}"), "Run failed");
            exit_code(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::from_env()?;

    match cli.command {
        Commands::Generate(args) => {
            generate::run(args, &config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            let store = PlanStore::open(&cli.plan)?;
            let result = store.validate();
            println!(
                "{} ({} plan)",
                store.document().project_name(),
                store.version()
            );
            print_validation(&result);
            Ok(if result.passed {
                ExitCode::SUCCESS
            } else {
                exit_code(EXIT_VALIDATION)
            })
        }
        Commands::Status { json } => {
            let store = PlanStore::open(&cli.plan)?;
            let summary = StatusSummary::from_document(store.document());
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{summary}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { stage } => {
            let mut pipeline = open_pipeline(&cli.plan, &config)?;
            let report = pipeline.run_stage(stage).await?;
            Ok(finish(&[report]))
        }
        Commands::All { yes } => {
            let mut pipeline = open_pipeline(&cli.plan, &config)?;
            let reports = pipeline
                .run_all(|stage| yes || confirm(stage))
                .await?;
            Ok(finish(&reports))
        }
        Commands::Regenerate { id } => {
            let mut pipeline = open_pipeline(&cli.plan, &config)?;
            let report = pipeline.regenerate(&id).await?;
            Ok(finish(&[report]))
        }
    }
}

/// Wire the plan to the process generator, ffmpeg and Ctrl-C.
fn open_pipeline(plan: &Path, config: &Config) -> anyhow::Result<Pipeline> {
    let plan = std::fs::canonicalize(plan)
        .with_context(|| format!("Cannot open plan {}", plan.display()))?;
    let store = PlanStore::open(plan)?;

    // This binary's own `generate` sub-command is the default generator.
    let tool = match &config.generator {
        Some(program) => ProcessTool::new(program).with_leading_args(Vec::<String>::new()),
        None => {
            let exe = std::env::current_exe().context("Cannot locate the storyloom executable")?;
            ProcessTool::new(exe)
        }
    }
    .with_timeout(config.tool_timeout())
    .with_working_directory(store.base_dir());
    tracing::debug!(generator = %tool.program().display(), "Generator configured");

    let media = Ffmpeg::new(&config.ffmpeg_path, &config.ffprobe_path);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping before the next entity");
            token.cancel();
        }
    });

    Ok(Pipeline::new(store, Arc::new(tool), Arc::new(media)).with_cancellation(cancel))
}

/// Print the stage reports; any failed entity makes the run unsuccessful.
fn finish(reports: &[StageReport]) -> ExitCode {
    for report in reports {
        println!("{report}");
    }
    if reports.iter().all(StageReport::is_clean) {
        ExitCode::SUCCESS
    } else {
        exit_code(EXIT_FATAL)
    }
}

fn confirm(stage: Stage) -> bool {
    print!("Continue with stage '{stage}'? [y/N] ");
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn print_validation(result: &ValidationResult) {
    for issue in &result.errors {
        println!("error: {issue}");
    }
    for issue in &result.warnings {
        println!("warning: {issue}");
    }
    if result.passed {
        println!("Plan is valid ({} warning(s))", result.warnings.len());
    } else {
        println!(
            "Plan is invalid: {} error(s), {} warning(s)",
            result.errors.len(),
            result.warnings.len()
        );
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
