//! Joining generated clips into scene videos and the final cut.

use std::path::{Path, PathBuf};

use storyloom_core::assembly::{all_simple, transition_offset, TransitionKind, TransitionSpec};
use storyloom_core::ffmpeg::FfmpegError;

use crate::media::MediaTool;

/// One scene's video and the transition that leads into it.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneClip {
    pub video: PathBuf,
    /// `None` for the first scene.
    pub transition: Option<TransitionSpec>,
}

pub struct MediaAssembler<'a> {
    media: &'a dyn MediaTool,
}

impl<'a> MediaAssembler<'a> {
    pub fn new(media: &'a dyn MediaTool) -> Self {
        Self { media }
    }

    /// Join clips back to back. A single input is copied.
    pub async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError> {
        tracing::info!(clips = inputs.len(), output = %output.display(), "Concatenating");
        self.media.concat(inputs, output).await
    }

    /// Join two clips through one transition. Cuts and continuous
    /// boundaries concatenate; fades and dissolves start `duration`
    /// seconds before the end of `first`.
    pub async fn merge_with_transition(
        &self,
        first: &Path,
        second: &Path,
        transition: TransitionSpec,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        let TransitionSpec { kind, duration } = transition;
        match kind {
            TransitionKind::Cut | TransitionKind::Continuous => {
                self.concatenate(&[first.to_path_buf(), second.to_path_buf()], output)
                    .await
            }
            TransitionKind::Fade | TransitionKind::Dissolve => {
                let first_duration = self.media.probe_duration(first).await?;
                let offset = transition_offset(first_duration, duration);
                tracing::info!(
                    %kind,
                    duration,
                    offset,
                    output = %output.display(),
                    "Merging with transition",
                );
                if kind == TransitionKind::Fade {
                    self.media.fade(first, second, offset, duration, output).await
                } else {
                    self.media
                        .dissolve(first, second, offset, duration, output)
                        .await
                }
            }
        }
    }

    /// Produce the final video from all scenes in order.
    ///
    /// When every boundary is simple this is one concatenation. Otherwise
    /// the scenes are folded left, each step writing to a scratch directory
    /// that is removed whether or not the fold succeeds.
    pub async fn merge_all_scenes(
        &self,
        scenes: &[SceneClip],
        output: &Path,
    ) -> Result<(), FfmpegError> {
        let Some((first, rest)) = scenes.split_first() else {
            return Err(FfmpegError::NoInputs);
        };

        let transitions: Vec<Option<TransitionSpec>> =
            scenes.iter().map(|s| s.transition).collect();
        if all_simple(&transitions) {
            let videos: Vec<PathBuf> = scenes.iter().map(|s| s.video.clone()).collect();
            return self.concatenate(&videos, output).await;
        }

        let scratch = tempfile::Builder::new()
            .prefix("storyloom-merge-")
            .tempdir()?;

        let mut current = first.video.clone();
        for (i, scene) in rest.iter().enumerate() {
            let target = if i + 1 == rest.len() {
                output.to_path_buf()
            } else {
                scratch.path().join(format!("merge_{i:03}.mp4"))
            };
            let transition = scene.transition.unwrap_or_else(TransitionSpec::cut);
            self.merge_with_transition(&current, &scene.video, transition, &target)
                .await?;
            current = target;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Records calls; every clip is 4 seconds long.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    #[async_trait]
    impl MediaTool for Recorder {
        async fn probe_duration(&self, path: &Path) -> Result<f64, FfmpegError> {
            self.push(format!("probe {}", name(path)));
            Ok(4.0)
        }

        async fn frame_count(&self, _path: &Path) -> Result<u64, FfmpegError> {
            Ok(1)
        }

        async fn extract_frame(&self, _: &Path, _: u64, _: &Path) -> Result<(), FfmpegError> {
            Ok(())
        }

        async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError> {
            let names: Vec<String> = inputs.iter().map(|p| name(p)).collect();
            self.push(format!("concat {} -> {}", names.join(","), name(output)));
            Ok(())
        }

        async fn fade(
            &self,
            first: &Path,
            second: &Path,
            start: f64,
            duration: f64,
            output: &Path,
        ) -> Result<(), FfmpegError> {
            self.push(format!(
                "fade {}+{} at {start} for {duration} -> {}",
                name(first),
                name(second),
                name(output)
            ));
            Ok(())
        }

        async fn dissolve(
            &self,
            first: &Path,
            second: &Path,
            offset: f64,
            duration: f64,
            output: &Path,
        ) -> Result<(), FfmpegError> {
            self.push(format!(
                "dissolve {}+{} at {offset} for {duration} -> {}",
                name(first),
                name(second),
                name(output)
            ));
            Ok(())
        }
    }

    fn clip(video: &str, transition: Option<TransitionSpec>) -> SceneClip {
        SceneClip {
            video: PathBuf::from(video),
            transition,
        }
    }

    fn spec(kind: TransitionKind, duration: f64) -> Option<TransitionSpec> {
        Some(TransitionSpec { kind, duration })
    }

    #[tokio::test]
    async fn simple_boundaries_short_circuit_to_one_concat() {
        let media = Recorder::default();
        let scenes = [
            clip("a.mp4", None),
            clip("b.mp4", spec(TransitionKind::Cut, 0.0)),
            clip("c.mp4", spec(TransitionKind::Continuous, 0.0)),
        ];
        MediaAssembler::new(&media)
            .merge_all_scenes(&scenes, Path::new("final.mp4"))
            .await
            .unwrap();
        assert_eq!(media.calls(), ["concat a.mp4,b.mp4,c.mp4 -> final.mp4"]);
    }

    #[tokio::test]
    async fn dissolve_offset_is_measured_from_the_end() {
        let media = Recorder::default();
        MediaAssembler::new(&media)
            .merge_with_transition(
                Path::new("a.mp4"),
                Path::new("b.mp4"),
                TransitionSpec {
                    kind: TransitionKind::Dissolve,
                    duration: 1.5,
                },
                Path::new("ab.mp4"),
            )
            .await
            .unwrap();
        assert_eq!(
            media.calls(),
            ["probe a.mp4", "dissolve a.mp4+b.mp4 at 2.5 for 1.5 -> ab.mp4"]
        );
    }

    #[tokio::test]
    async fn mixed_boundaries_fold_left_into_the_output() {
        let media = Recorder::default();
        let scenes = [
            clip("a.mp4", None),
            clip("b.mp4", spec(TransitionKind::Fade, 0.5)),
            clip("c.mp4", spec(TransitionKind::Cut, 0.0)),
        ];
        MediaAssembler::new(&media)
            .merge_all_scenes(&scenes, Path::new("final.mp4"))
            .await
            .unwrap();

        let calls = media.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], "probe a.mp4");
        assert_eq!(calls[1], "fade a.mp4+b.mp4 at 3.5 for 0.5 -> merge_000.mp4");
        assert_eq!(calls[2], "concat merge_000.mp4,c.mp4 -> final.mp4");
    }

    #[tokio::test]
    async fn no_scenes_is_an_error() {
        let media = Recorder::default();
        let result = MediaAssembler::new(&media)
            .merge_all_scenes(&[], Path::new("final.mp4"))
            .await;
        assert!(matches!(result, Err(FfmpegError::NoInputs)));
    }
}
