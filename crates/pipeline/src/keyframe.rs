//! Representative-frame extraction.
//!
//! The frame handed to the next segment (or scene) is the last frame of a
//! clip. Generated clips sometimes end on a fade to black, so a near-black
//! last frame is replaced by the second-to-last one. The retry happens once.

use std::path::Path;

use storyloom_core::ffmpeg::FfmpegError;
use storyloom_core::frame::{is_near_black, mean_luminance};

use crate::error::PipelineError;
use crate::media::MediaTool;

/// Write the representative frame of `video` to `output` and return the
/// frame index used.
pub async fn extract_representative_frame(
    media: &dyn MediaTool,
    video: &Path,
    output: &Path,
) -> Result<u64, PipelineError> {
    let frames = media.frame_count(video).await?;
    if frames == 0 {
        return Err(FfmpegError::Probe(format!(
            "{} reports no video frames",
            video.display()
        ))
        .into());
    }

    let last = frames - 1;
    media.extract_frame(video, last, output).await?;
    if last == 0 {
        return Ok(0);
    }

    let luminance = mean_luminance(output)?;
    if !is_near_black(luminance) {
        return Ok(last);
    }

    tracing::info!(
        video = %video.display(),
        luminance,
        "Last frame is near-black, using the previous frame",
    );
    let previous = last - 1;
    media.extract_frame(video, previous, output).await?;
    Ok(previous)
}
