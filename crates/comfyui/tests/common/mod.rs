//! In-memory backend and event stream used by the job client tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use storyloom_comfyui::api::{
    ComfyBackend, ComfyUIApiError, QueueSnapshot, SubmitResponse, UploadedImage,
};
use storyloom_comfyui::client::{ComfyUIClientError, EventSource, StreamConnector, StreamRead};
use storyloom_comfyui::job::{JobClient, JobSettings};
use storyloom_comfyui::messages::parse_message;

pub const PROMPT_ID: &str = "p1";

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Scripted backend. `get_history` answers `{}` until it has been called
/// `history_ready_after` times, then returns `history_record`.
pub struct FakeBackend {
    pub history_ready_after: usize,
    pub history_record: Value,
    pub history_fails: bool,
    /// Delay applied to history, queue and cancel calls.
    pub stall: Option<Duration>,
    pub queue: Vec<String>,
    pub object_info: Value,
    pub view_bytes: Vec<u8>,

    pub history_calls: AtomicUsize,
    pub object_info_calls: AtomicUsize,
    pub submitted: Mutex<Vec<Value>>,
    pub uploads: Mutex<Vec<PathBuf>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            history_ready_after: 1,
            history_record: success_record(),
            history_fails: false,
            stall: None,
            queue: vec![PROMPT_ID.to_string()],
            object_info: json!({
                "LoadImage": {"input": {"required": {"image": [[]]}}},
                "SaveImage": {"input": {"required": {"images": [["IMAGE"]]}}}
            }),
            view_bytes: b"PNGDATA".to_vec(),
            history_calls: AtomicUsize::new(0),
            object_info_calls: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }
}

impl FakeBackend {
    /// Never reports completion.
    pub fn never_finishes() -> Self {
        Self {
            history_ready_after: usize::MAX,
            ..Self::default()
        }
    }

    /// Accepts every call, then answers nothing for a minute.
    pub fn stalled() -> Self {
        Self {
            stall: Some(Duration::from_secs(60)),
            ..Self::never_finishes()
        }
    }

    async fn maybe_stall(&self) {
        if let Some(delay) = self.stall {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn history_call_count(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }
}

fn server_error() -> ComfyUIApiError {
    ComfyUIApiError::Status {
        status: 500,
        body: "boom".to_string(),
    }
}

#[async_trait]
impl ComfyBackend for FakeBackend {
    async fn object_info(&self) -> Result<Value, ComfyUIApiError> {
        self.object_info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.object_info.clone())
    }

    async fn submit_workflow(
        &self,
        workflow: &Value,
        _client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.submitted.lock().unwrap().push(workflow.clone());
        Ok(SubmitResponse {
            prompt_id: PROMPT_ID.to_string(),
            number: 7,
        })
    }

    async fn get_history(&self, _prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        let calls = self.history_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.maybe_stall().await;
        if self.history_fails {
            return Err(server_error());
        }
        if calls >= self.history_ready_after {
            Ok(self.history_record.clone())
        } else {
            Ok(json!({}))
        }
    }

    async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        self.maybe_stall().await;
        Ok(QueueSnapshot {
            running: self.queue.clone(),
            pending: Vec::new(),
        })
    }

    async fn upload_image(&self, path: &Path) -> Result<UploadedImage, ComfyUIApiError> {
        self.uploads.lock().unwrap().push(path.to_path_buf());
        let name = path
            .file_name()
            .map(|n| format!("up_{}", n.to_string_lossy()))
            .unwrap_or_default();
        Ok(UploadedImage {
            name,
            subfolder: String::new(),
            folder_type: "input".to_string(),
        })
    }

    async fn view(
        &self,
        _filename: &str,
        _subfolder: &str,
        _folder_type: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        Ok(self.view_bytes.clone())
    }

    async fn free_memory(&self) -> Result<(), ComfyUIApiError> {
        Ok(())
    }

    async fn system_stats(&self) -> Result<Value, ComfyUIApiError> {
        Ok(json!({"system": {}}))
    }

    async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.cancelled.lock().unwrap().push(prompt_id.to_string());
        self.maybe_stall().await;
        Ok(())
    }
}

pub fn success_record() -> Value {
    json!({
        "p1": {
            "outputs": {"9": {"images": [{"filename": "out_00001_.png", "subfolder": "", "type": "output"}]}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    })
}

pub fn error_record() -> Value {
    json!({
        "p1": {
            "outputs": {},
            "status": {"status_str": "error", "completed": false, "messages": [
                ["execution_error", {
                    "prompt_id": PROMPT_ID,
                    "node_id": "5",
                    "node_type": "VAEDecode",
                    "exception_message": "tensor size mismatch",
                    "exception_type": "RuntimeError",
                    "traceback": []
                }]
            ]}
        }
    })
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// Replays scripted reads, then idles for the requested wait forever.
pub struct ScriptedStream {
    reads: VecDeque<StreamRead>,
}

#[async_trait]
impl EventSource for ScriptedStream {
    async fn next_message(&mut self, wait: Duration) -> StreamRead {
        match self.reads.pop_front() {
            Some(read) => read,
            None => {
                tokio::time::sleep(wait).await;
                StreamRead::Idle
            }
        }
    }
}

/// Hands out one scripted stream, or refuses to connect.
pub struct FakeConnector {
    script: Mutex<Option<VecDeque<StreamRead>>>,
    refuse: bool,
}

impl FakeConnector {
    pub fn scripted(reads: Vec<StreamRead>) -> Self {
        Self {
            script: Mutex::new(Some(reads.into())),
            refuse: false,
        }
    }

    pub fn silent() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn refusing() -> Self {
        Self {
            script: Mutex::new(None),
            refuse: true,
        }
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn open(&self, _client_id: &str) -> Result<Box<dyn EventSource>, ComfyUIClientError> {
        if self.refuse {
            return Err(ComfyUIClientError::Connect {
                url: "ws://fake/ws".to_string(),
                reason: "refused".to_string(),
            });
        }
        let reads = self.script.lock().unwrap().take().unwrap_or_default();
        Ok(Box::new(ScriptedStream { reads }))
    }
}

/// Parse a raw WebSocket frame into a stream read.
pub fn frame(json: &str) -> StreamRead {
    StreamRead::Message(parse_message(json).expect("test frame should parse"))
}

pub fn fast_settings() -> JobSettings {
    JobSettings {
        stream_wait: Duration::from_millis(10),
        history_interval: Duration::from_millis(30),
        poll_interval: Duration::from_millis(10),
        max_poll_failures: 3,
        cancel_wait: Duration::from_millis(50),
    }
}

pub fn job_client(backend: Arc<FakeBackend>, connector: FakeConnector) -> JobClient {
    JobClient::new(backend, Arc::new(connector)).with_settings(fast_settings())
}
