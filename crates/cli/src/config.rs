use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use storyloom_comfyui::JobSettings;

/// Runtime configuration loaded from environment variables.
///
/// Every field has a default suitable for a local ComfyUI install.
#[derive(Debug, Clone)]
pub struct Config {
    /// ComfyUI host (default: `127.0.0.1`).
    pub comfyui_host: String,
    /// ComfyUI port (default: `8188`).
    pub comfyui_port: u16,
    /// Program run once per entity. `None` means this executable.
    pub generator: Option<PathBuf>,
    /// Directory holding the workflow templates used by `generate`.
    pub workflow_dir: PathBuf,
    pub tool_timeout_secs: u64,
    pub job_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default            |
    /// |-------------------------------|--------------------|
    /// | `COMFYUI_HOST`                | `127.0.0.1`        |
    /// | `COMFYUI_PORT`                | `8188`             |
    /// | `STORYLOOM_GENERATOR`         | current executable |
    /// | `STORYLOOM_WORKFLOW_DIR`      | `workflows`        |
    /// | `STORYLOOM_TOOL_TIMEOUT_SECS` | `900`              |
    /// | `STORYLOOM_JOB_TIMEOUT_SECS`  | `600`              |
    /// | `STORYLOOM_POLL_INTERVAL_MS`  | `2000`             |
    /// | `FFMPEG_PATH`                 | `ffmpeg`           |
    /// | `FFPROBE_PATH`                | `ffprobe`          |
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            comfyui_host: text("COMFYUI_HOST", "127.0.0.1"),
            comfyui_port: parsed(&lookup, "COMFYUI_PORT", 8188)?,
            generator: lookup("STORYLOOM_GENERATOR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            workflow_dir: text("STORYLOOM_WORKFLOW_DIR", "workflows").into(),
            tool_timeout_secs: parsed(&lookup, "STORYLOOM_TOOL_TIMEOUT_SECS", 900)?,
            job_timeout_secs: parsed(&lookup, "STORYLOOM_JOB_TIMEOUT_SECS", 600)?,
            poll_interval_ms: parsed(&lookup, "STORYLOOM_POLL_INTERVAL_MS", 2000)?,
            ffmpeg_path: text("FFMPEG_PATH", "ffmpeg").into(),
            ffprobe_path: text("FFPROBE_PATH", "ffprobe").into(),
        })
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Job client timing. The poll interval also bounds each stream read.
    pub fn job_settings(&self) -> JobSettings {
        let tick = Duration::from_millis(self.poll_interval_ms.max(1));
        JobSettings {
            stream_wait: tick,
            poll_interval: tick,
            ..JobSettings::default()
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{key} must be a valid {}: {e}", short_type_name::<T>())),
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}
