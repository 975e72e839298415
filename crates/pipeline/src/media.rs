//! Media operations the orchestrator needs, behind a trait so runs can be
//! driven without ffmpeg.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use storyloom_core::ffmpeg::{Ffmpeg, FfmpegError};

#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn probe_duration(&self, path: &Path) -> Result<f64, FfmpegError>;

    async fn frame_count(&self, path: &Path) -> Result<u64, FfmpegError>;

    async fn extract_frame(&self, video: &Path, index: u64, output: &Path)
        -> Result<(), FfmpegError>;

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError>;

    async fn fade(
        &self,
        first: &Path,
        second: &Path,
        fade_out_start: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), FfmpegError>;

    async fn dissolve(
        &self,
        first: &Path,
        second: &Path,
        offset: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), FfmpegError>;
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn probe_duration(&self, path: &Path) -> Result<f64, FfmpegError> {
        Ffmpeg::probe_duration(self, path).await
    }

    async fn frame_count(&self, path: &Path) -> Result<u64, FfmpegError> {
        Ffmpeg::frame_count(self, path).await
    }

    async fn extract_frame(
        &self,
        video: &Path,
        index: u64,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        Ffmpeg::extract_frame(self, video, index, output).await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError> {
        Ffmpeg::concat(self, inputs, output).await
    }

    async fn fade(
        &self,
        first: &Path,
        second: &Path,
        fade_out_start: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        Ffmpeg::fade(self, first, second, fade_out_start, duration, output).await
    }

    async fn dissolve(
        &self,
        first: &Path,
        second: &Path,
        offset: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        Ffmpeg::dissolve(self, first, second, offset, duration, output).await
    }
}
