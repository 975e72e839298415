//! Fake generation tool and media backend shared by the pipeline tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{GrayImage, Luma};
use serde_json::Value;
use storyloom_core::ffmpeg::FfmpegError;
use storyloom_pipeline::{GenerationRequest, GenerationTool, MediaTool, Pipeline, ToolError};
use storyloom_store::PlanStore;

// ---------------------------------------------------------------------------
// Generation tool
// ---------------------------------------------------------------------------

/// Writes a placeholder file for every request, except for the entities
/// listed in `fail`.
#[derive(Default)]
pub struct FakeTool {
    pub fail: Vec<String>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeTool {
    pub fn failing(entities: &[&str]) -> Self {
        Self {
            fail: entities.iter().map(|e| e.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn entities(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.entity).collect()
    }

    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl GenerationTool for FakeTool {
    async fn generate(&self, request: &GenerationRequest) -> Result<(), ToolError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.contains(&request.entity) {
            return Err(ToolError::Failed {
                exit_code: 1,
                stderr: "out of memory".to_string(),
            });
        }
        touch(&request.output);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Records every call by file name. Extracted frames are real PNGs, black
/// for the indices in `dark_frames` and bright otherwise. `fail_concat`
/// makes every concatenation fail without writing its output.
pub struct FakeMedia {
    pub frames: u64,
    pub dark_frames: Vec<u64>,
    pub duration: f64,
    pub fail_concat: bool,
    pub calls: Mutex<Vec<String>>,
}

impl Default for FakeMedia {
    fn default() -> Self {
        Self {
            frames: 10,
            dark_frames: Vec::new(),
            duration: 6.0,
            fail_concat: false,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeMedia {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl MediaTool for FakeMedia {
    async fn probe_duration(&self, path: &Path) -> Result<f64, FfmpegError> {
        self.record(format!("probe {}", name(path)));
        Ok(self.duration)
    }

    async fn frame_count(&self, path: &Path) -> Result<u64, FfmpegError> {
        self.record(format!("frames {}", name(path)));
        Ok(self.frames)
    }

    async fn extract_frame(
        &self,
        video: &Path,
        index: u64,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        self.record(format!("extract {}#{index} -> {}", name(video), name(output)));
        let luma = if self.dark_frames.contains(&index) { 2 } else { 180 };
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        GrayImage::from_pixel(4, 4, Luma([luma])).save(output).unwrap();
        Ok(())
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), FfmpegError> {
        let names: Vec<String> = inputs.iter().map(|p| name(p)).collect();
        self.record(format!("concat {} -> {}", names.join(","), name(output)));
        if self.fail_concat {
            return Err(FfmpegError::Failed {
                program: "ffmpeg",
                exit_code: 1,
                stderr: "Invalid data found when processing input".to_string(),
            });
        }
        touch(output);
        Ok(())
    }

    async fn fade(
        &self,
        first: &Path,
        second: &Path,
        fade_out_start: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), FfmpegError> {
        self.record(format!(
            "fade {}+{} at {fade_out_start} for {duration} -> {}",
            name(first),
            name(second),
            name(output)
        ));
        touch(output);
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
        self.record(format!(
            "dissolve {}+{} at {offset} for {duration} -> {}",
            name(first),
            name(second),
            name(output)
        ));
        touch(output);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, b"media").unwrap();
}

/// Write `plan` as `plan.json` inside `dir`.
pub fn write_plan(dir: &Path, plan: &Value) -> PathBuf {
    let path = dir.join("plan.json");
    std::fs::write(&path, serde_json::to_string_pretty(plan).unwrap()).unwrap();
    path
}

pub fn pipeline(plan: &Path, tool: &Arc<FakeTool>, media: &Arc<FakeMedia>) -> Pipeline {
    let store = PlanStore::open(plan).unwrap();
    Pipeline::new(store, tool.clone(), media.clone())
}

/// Status of `id` as persisted on disk.
pub fn stored_status(plan: &Path, id: &str) -> storyloom_core::status::Status {
    let store = PlanStore::open(plan).unwrap();
    let doc = store.document();
    let key = doc.locate(id).unwrap();
    doc.status_of(&key).unwrap()
}
