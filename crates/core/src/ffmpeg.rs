//! FFmpeg/FFprobe command wrapper.
//!
//! [`Ffmpeg`] holds the two binary paths and exposes the handful of media
//! operations the pipeline needs: probing, frame extraction, concatenation,
//! and the two transition merges. Filter graphs and concat strategy come
//! from [`crate::assembly`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::assembly::{
    concat_list, concat_strategy, dissolve_filter, fade_filter, select_frame_filter, ClipFormat,
    ConcatStrategy, REENCODE_ARGS,
};
use crate::process::{self, excerpt, ProcessError, RunOptions, STDERR_EXCERPT_CHARS};

/// Upper bound for any single ffmpeg/ffprobe invocation.
const MEDIA_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("ffprobe/ffmpeg could not be run: {0}")]
    Command(#[from] ProcessError),

    #[error("{program} exited with {exit_code}: {stderr}")]
    Failed {
        program: &'static str,
        exit_code: i32,
        stderr: String,
    },

    #[error("unusable ffprobe output: {0}")]
    Probe(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("media file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("nothing to concatenate")]
    NoInputs,
}

// ---------------------------------------------------------------------------
// Probe results
// ---------------------------------------------------------------------------

/// The parts of `ffprobe -show_format -show_streams` output that are read.
#[derive(Debug, Deserialize)]
struct ProbeJson {
    #[serde(default)]
    streams: Vec<StreamJson>,
    #[serde(default)]
    format: FormatJson,
}

#[derive(Debug, Deserialize)]
struct StreamJson {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FormatJson {
    duration: Option<String>,
}

/// First video stream of a file, summarised.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    /// Seconds; container duration preferred over the stream's.
    pub duration: f64,
    /// Header frame count, or duration × fps when the header has none.
    pub frames: u64,
    pub format: ClipFormat,
}

impl VideoInfo {
    /// Read ffprobe's JSON. Files without a video stream are rejected.
    pub fn from_probe_json(json: &str) -> Result<Self, FfmpegError> {
        let probe: ProbeJson = serde_json::from_str(json).map_err(|e| {
            FfmpegError::Probe(format!("{e}: {}", excerpt(json, STDERR_EXCERPT_CHARS)))
        })?;
        let Some(video) = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
        else {
            return Err(FfmpegError::Probe("no video stream".into()));
        };

        let duration = [probe.format.duration.as_deref(), video.duration.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);
        let fps = video.r_frame_rate.as_deref().map_or(0.0, frame_rate);
        let frames = video
            .nb_frames
            .as_deref()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or_else(|| (duration * fps).round().max(0.0) as u64);

        Ok(Self {
            duration,
            frames,
            format: ClipFormat {
                codec: video.codec_name.clone().unwrap_or_default(),
                width: video.width.unwrap_or(0),
                height: video.height.unwrap_or(0),
                fps,
            },
        })
    }
}

/// `"24000/1001"` or `"25"` as frames per second; 0 when unreadable.
fn frame_rate(rate: &str) -> f64 {
    let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));
    match (num.parse::<f64>(), den.parse::<f64>()) {
        (Ok(num), Ok(den)) if den > 0.0 => num / den,
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Wrapper
// ---------------------------------------------------------------------------

/// Paths to the ffmpeg and ffprobe binaries.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub async fn probe(&self, path: &Path) -> Result<VideoInfo, FfmpegError> {
        ensure_exists(path)?;

        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "quiet", "-of", "json", "-show_format", "-show_streams"])
            .arg(path);
        let stdout = self.run("ffprobe", &mut cmd).await?;
        VideoInfo::from_probe_json(&stdout)
    }

    /// Duration in seconds. Zero is an error since transitions are placed
    /// relative to it.
    pub async fn probe_duration(&self, path: &Path) -> Result<f64, FfmpegError> {
        let info = self.probe(path).await?;
        if info.duration <= 0.0 {
            return Err(FfmpegError::Probe(format!(
                "{} has no duration",
                path.display()
            )));
        }
        Ok(info.duration)
    }

    pub async fn frame_count(&self, path: &Path) -> Result<u64, FfmpegError> {
        Ok(self.probe(path).await?.frames)
    }

    /// Decode frame `index` of `video` and write it as an image.
    pub async fn extract_frame(
        &self,
        video: &Path,
        index: u64,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        ensure_exists(video)?;
        ensure_parent(output).await?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-v", "error", "-i"])
            .arg(video)
            .args(["-vf", &select_frame_filter(index), "-vsync", "0", "-frames:v", "1"])
            .arg(output);
        self.run("ffmpeg", &mut cmd).await?;

        if !output.exists() {
            return Err(FfmpegError::Failed {
                program: "ffmpeg",
                exit_code: 0,
                stderr: format!("frame {index} not found in {}", video.display()),
            });
        }
        Ok(())
    }

    /// Join `inputs` in order. One input is copied; matching inputs are
    /// stream-copied through the concat demuxer; anything else is re-encoded.
    pub async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError> {
        let Some(first) = inputs.first() else {
            return Err(FfmpegError::NoInputs);
        };
        for input in inputs {
            ensure_exists(input)?;
        }
        ensure_parent(output).await?;

        if inputs.len() == 1 {
            tokio::fs::copy(first, output).await?;
            return Ok(());
        }

        let strategy = self.concat_strategy(inputs).await?;
        tracing::debug!(
            inputs = inputs.len(),
            output = %output.display(),
            strategy = ?strategy,
            "Concatenating clips",
        );

        // The demuxer resolves relative entries against the list file, so
        // entries are made absolute.
        let absolute: Vec<PathBuf> = inputs
            .iter()
            .map(std::path::absolute)
            .collect::<Result<_, _>>()?;
        let list = tempfile::Builder::new()
            .prefix("storyloom-concat-")
            .suffix(".txt")
            .tempfile()?;
        tokio::fs::write(list.path(), concat_list(&absolute)).await?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(list.path());
        match strategy {
            ConcatStrategy::StreamCopy => {
                cmd.args(["-c", "copy"]);
            }
            ConcatStrategy::ReEncode { .. } => {
                cmd.args(REENCODE_ARGS).arg("-an");
            }
        }
        cmd.arg(output);
        self.run("ffmpeg", &mut cmd).await?;
        Ok(())
    }

    /// Fade `first` out starting at `fade_out_start`, fade `second` in.
    pub async fn fade(
        &self,
        first: &Path,
        second: &Path,
        fade_out_start: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        self.merge_with_filter(first, second, &fade_filter(fade_out_start, duration), output)
            .await
    }

    /// Cross-dissolve `first` into `second` beginning at `offset`.
    pub async fn dissolve(
        &self,
        first: &Path,
        second: &Path,
        offset: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        self.merge_with_filter(first, second, &dissolve_filter(offset, duration), output)
            .await
    }

    async fn merge_with_filter(
        &self,
        first: &Path,
        second: &Path,
        filter: &str,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        ensure_exists(first)?;
        ensure_exists(second)?;
        ensure_parent(output).await?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-v", "error", "-i"])
            .arg(first)
            .arg("-i")
            .arg(second)
            .args(["-filter_complex", filter, "-map", "[outv]"])
            .args(REENCODE_ARGS)
            .arg(output);
        self.run("ffmpeg", &mut cmd).await?;
        Ok(())
    }

    async fn concat_strategy(&self, inputs: &[PathBuf]) -> Result<ConcatStrategy, FfmpegError> {
        let mut formats = Vec::with_capacity(inputs.len());
        for input in inputs {
            formats.push(self.probe(input).await?.format);
        }
        Ok(concat_strategy(&formats))
    }

    /// Run a media command and return its stdout; non-zero exit is an error.
    async fn run(&self, program: &'static str, cmd: &mut Command) -> Result<String, FfmpegError> {
        let output = process::run(cmd, &RunOptions::new(MEDIA_COMMAND_TIMEOUT)).await?;
        if !output.success() {
            return Err(FfmpegError::Failed {
                program,
                exit_code: output.exit_code,
                stderr: output.stderr_excerpt(),
            });
        }
        Ok(output.stdout)
    }
}

fn ensure_exists(path: &Path) -> Result<(), FfmpegError> {
    match path.try_exists() {
        Ok(true) => Ok(()),
        _ => Err(FfmpegError::MissingInput(path.to_path_buf())),
    }
}

async fn ensure_parent(path: &Path) -> Result<(), FfmpegError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}
