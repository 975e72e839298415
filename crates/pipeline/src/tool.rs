//! The generation sub-tool seam.
//!
//! Stage runners never talk to a compute backend themselves. Each entity
//! that needs work is turned into a [`GenerationRequest`] and handed to a
//! [`GenerationTool`]; the production implementation, [`ProcessTool`],
//! runs an external command per request.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use storyloom_core::plan::{AssetKind, GenerationSettings};
use storyloom_core::process::{self, ProcessError, RunOptions};
use tokio::process::Command;

/// Per-entity command timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// What the sub-tool is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKind {
    Character,
    Background,
    Pose,
    /// Pose skeleton pulled from a source image rather than generated.
    PoseExtract,
    Style,
    Keyframe,
    Video,
}

impl GenerationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Background => "background",
            Self::Pose => "pose",
            Self::PoseExtract => "pose-extract",
            Self::Style => "style",
            Self::Keyframe => "keyframe",
            Self::Video => "video",
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Character,
            Self::Background,
            Self::Pose,
            Self::PoseExtract,
            Self::Style,
            Self::Keyframe,
            Self::Video,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s)
        .ok_or_else(|| format!("unknown generation kind '{s}'"))
    }
}

impl From<AssetKind> for GenerationKind {
    fn from(kind: AssetKind) -> Self {
        match kind {
            AssetKind::Character => Self::Character,
            AssetKind::Background => Self::Background,
            AssetKind::Pose => Self::Pose,
            AssetKind::Style => Self::Style,
        }
    }
}

/// One unit of generation work with every input already resolved to a
/// concrete path.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    /// Display name of the entity, used in logs.
    pub entity: String,
    pub prompt: Option<String>,
    pub output: PathBuf,
    pub characters: Vec<PathBuf>,
    pub background: Option<PathBuf>,
    pub pose: Option<PathBuf>,
    pub style: Option<PathBuf>,
    /// Source image for extraction-style work.
    pub reference: Option<PathBuf>,
    pub start_frame: Option<PathBuf>,
    pub end_frame: Option<PathBuf>,
    pub settings: GenerationSettings,
    /// Ask the backend to unload models first.
    pub free_memory: bool,
}

impl GenerationRequest {
    pub fn new(kind: GenerationKind, entity: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            prompt: None,
            output: output.into(),
            characters: Vec::new(),
            background: None,
            pose: None,
            style: None,
            reference: None,
            start_frame: None,
            end_frame: None,
            settings: GenerationSettings::default(),
            free_memory: false,
        }
    }

    /// Command-line flags understood by the `generate` sub-command.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut flag = |name: &str, value: OsString| {
            args.push(name.into());
            args.push(value);
        };

        flag("--kind", self.kind.as_str().into());
        if let Some(prompt) = &self.prompt {
            flag("--prompt", prompt.into());
        }
        flag("--output", self.output.clone().into());
        for character in &self.characters {
            flag("--character", character.clone().into());
        }
        let paths = [
            ("--background", &self.background),
            ("--pose", &self.pose),
            ("--style", &self.style),
            ("--reference", &self.reference),
            ("--start-frame", &self.start_frame),
            ("--end-frame", &self.end_frame),
        ];
        for (name, path) in paths {
            if let Some(path) = path {
                flag(name, path.clone().into());
            }
        }
        if let Some(preset) = &self.settings.preset {
            flag("--preset", preset.into());
        }
        if let Some(strength) = self.settings.control_strength {
            flag("--control-strength", strength.to_string().into());
        }
        if let Some(seed) = self.settings.seed {
            flag("--seed", seed.to_string().into());
        }
        if let Some(length) = self.settings.length {
            flag("--length", length.to_string().into());
        }
        if self.free_memory {
            args.push("--free-memory".into());
        }
        args
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// Why a single generation attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("generator exited with code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    #[error("generator timed out after {seconds}s (try a lower resolution preset or fewer frames)")]
    Timeout { seconds: u64 },

    #[error("generator reported success but {0} is missing or empty")]
    MissingOutput(String),

    #[error("could not start generator: {0}")]
    Spawn(String),
}

/// Produces the artifact described by a [`GenerationRequest`].
#[async_trait]
pub trait GenerationTool: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<(), ToolError>;
}

// ---------------------------------------------------------------------------
// Process-backed implementation
// ---------------------------------------------------------------------------

/// Runs `program [leading args] <request flags>` once per request.
#[derive(Debug, Clone)]
pub struct ProcessTool {
    program: PathBuf,
    leading_args: Vec<OsString>,
    timeout: Duration,
    working_directory: Option<PathBuf>,
}

impl ProcessTool {
    /// A tool invoked as `program generate ...`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: vec!["generate".into()],
            timeout: DEFAULT_TOOL_TIMEOUT,
            working_directory: None,
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl GenerationTool for ProcessTool {
    async fn generate(&self, request: &GenerationRequest) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args).args(request.to_args());

        let options = RunOptions::new(self.timeout).in_dir(self.working_directory.clone());

        tracing::debug!(
            entity = %request.entity,
            kind = %request.kind,
            program = %self.program.display(),
            "Invoking generator",
        );
        let output = process::run(&mut cmd, &options).await.map_err(|e| match e {
            ProcessError::Timeout { .. } => ToolError::Timeout {
                seconds: self.timeout.as_secs(),
            },
            other => ToolError::Spawn(other.to_string()),
        })?;

        if !output.success() {
            return Err(ToolError::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr_excerpt(),
            });
        }

        match tokio::fs::metadata(&request.output).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                tracing::debug!(
                    entity = %request.entity,
                    elapsed_ms = output.elapsed.as_millis() as u64,
                    "Generator finished",
                );
                Ok(())
            }
            _ => Err(ToolError::MissingOutput(request.output.display().to_string())),
        }
    }
}
