//! Event-stream messages.
//!
//! Every WebSocket text frame is `{"type": "<kind>", "data": {...}}`.
//! Only the kinds the job client reacts to are modelled; anything else
//! fails to parse and is skipped by the reader.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    /// Queue depth broadcast, not tied to a prompt.
    Status(StatusData),
    ExecutionStart(PromptRef),
    /// Nodes whose outputs came from cache.
    ExecutionCached(ExecutionCachedData),
    /// `node: None` marks the end of the prompt on older servers.
    Executing(ExecutingData),
    /// Sampler step progress.
    Progress(ProgressData),
    Executed(ExecutedData),
    ExecutionError(ErrorData),
    /// Sent by newer servers once the whole prompt is done.
    ExecutionSuccess(PromptRef),
    ExecutionInterrupted(InterruptedData),
}

impl ComfyUIMessage {
    /// Prompt the message belongs to. Status broadcasts, and progress from
    /// older servers, carry none.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::Progress(data) => data.prompt_id.as_deref(),
            Self::Executing(data) => data.prompt_id.as_deref(),
            Self::ExecutionStart(data) | Self::ExecutionSuccess(data) => Some(&data.prompt_id),
            Self::ExecutionCached(data) => Some(&data.prompt_id),
            Self::Executed(data) => Some(&data.prompt_id),
            Self::ExecutionError(data) => Some(&data.prompt_id),
            Self::ExecutionInterrupted(data) => Some(&data.prompt_id),
        }
    }

    /// The prompt finished successfully.
    pub fn is_success(&self) -> bool {
        match self {
            Self::ExecutionSuccess(_) => true,
            Self::Executing(data) => data.node.is_none(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    status: QueueState,
}

#[derive(Debug, Clone, Deserialize)]
struct QueueState {
    exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
struct ExecInfo {
    queue_remaining: i32,
}

impl StatusData {
    pub fn queue_remaining(&self) -> i32 {
        self.status.exec_info.queue_remaining
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i32,
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Whole-number percentage, clamped to 0..=100.
    pub fn percent(&self) -> u8 {
        if self.max <= 0 {
            return 0;
        }
        let ratio = f64::from(self.value.clamp(0, self.max)) / f64::from(self.max);
        (ratio * 100.0).round() as u8
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// `execution_error` payload; feeds [`crate::history::ExecutionFailure`].
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
    /// Traceback lines, outermost first.
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
}

/// Parse one text frame. Unknown kinds and malformed JSON are errors.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}
