//! Terminal history records and output extraction.
//!
//! ComfyUI writes a prompt into `/history` only once it stops running, so
//! the presence of a record is the authoritative "finished" signal. The
//! record's `status.status_str` tells success from failure.

use std::fmt;

use serde_json::{Map, Value};

use crate::messages::ErrorData;

/// Traceback lines kept in an [`ExecutionFailure`].
const TRACE_LINES: usize = 6;

/// Character cap on the kept traceback.
const TRACE_CHARS: usize = 1500;

/// Output category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image,
    Video,
}

/// One file produced by an output node, addressable through `/view`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    /// `output`, `temp` or `input`.
    pub folder_type: String,
    pub kind: ArtifactKind,
}

/// Structured context for a failure that happened while executing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub prompt_id: String,
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    /// Exception class reported by the server.
    pub error_kind: String,
    pub message: String,
    /// Innermost traceback lines, truncated.
    pub traceback: String,
}

impl ExecutionFailure {
    pub fn from_error_data(data: &ErrorData) -> Self {
        Self {
            prompt_id: data.prompt_id.clone(),
            node_id: data.node_id.clone(),
            node_type: data.node_type.clone(),
            error_kind: data.exception_type.clone(),
            message: data.exception_message.trim().to_string(),
            traceback: truncate_trace(&data.traceback),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.node_id, &self.node_type) {
            (Some(id), Some(ty)) => write!(f, "node {id} ({ty})")?,
            (Some(id), None) => write!(f, "node {id}")?,
            (None, Some(ty)) => write!(f, "{ty}")?,
            (None, None) => f.write_str("workflow")?,
        }
        if self.error_kind.is_empty() {
            write!(f, ": {}", self.message)
        } else {
            write!(f, ": {}: {}", self.error_kind, self.message)
        }
    }
}

fn truncate_trace(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(TRACE_LINES);
    let joined = lines[start..]
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    let count = joined.chars().count();
    if count <= TRACE_CHARS {
        joined
    } else {
        joined.chars().skip(count - TRACE_CHARS).collect()
    }
}

/// A finished prompt as reported by `GET /history/{prompt_id}`.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub prompt_id: String,
    pub outputs: Map<String, Value>,
    /// `success` or `error`; older servers omit it.
    pub status_str: Option<String>,
    /// `[type, data]` pairs recorded during execution.
    pub messages: Vec<(String, Value)>,
}

impl HistoryRecord {
    /// Pull the record for `prompt_id` out of a history response. `None`
    /// while the prompt is still queued or running.
    pub fn from_history(prompt_id: &str, history: &Value) -> Option<Self> {
        let entry = history.get(prompt_id)?.as_object()?;
        let status = entry.get("status");

        let messages = status
            .and_then(|s| s.get("messages"))
            .and_then(Value::as_array)
            .map(|msgs| {
                msgs.iter()
                    .filter_map(|m| {
                        let kind = m.get(0)?.as_str()?.to_string();
                        Some((kind, m.get(1).cloned().unwrap_or(Value::Null)))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            prompt_id: prompt_id.to_string(),
            outputs: entry
                .get("outputs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            status_str: status
                .and_then(|s| s.get("status_str"))
                .and_then(Value::as_str)
                .map(String::from),
            messages,
        })
    }

    pub fn is_error(&self) -> bool {
        self.status_str.as_deref() == Some("error")
    }

    /// Failure context when the record reports an error. Falls back to a
    /// bare failure if no `execution_error` message was kept.
    pub fn failure(&self) -> Option<ExecutionFailure> {
        if !self.is_error() {
            return None;
        }
        let from_message = self
            .messages
            .iter()
            .filter(|(kind, _)| kind == "execution_error")
            .find_map(|(_, data)| serde_json::from_value::<ErrorData>(data.clone()).ok())
            .map(|data| ExecutionFailure::from_error_data(&data));

        Some(from_message.unwrap_or_else(|| ExecutionFailure {
            prompt_id: self.prompt_id.clone(),
            message: "execution ended with status 'error'".to_string(),
            ..ExecutionFailure::default()
        }))
    }

    /// Images from every output node, in record order.
    pub fn images(&self) -> Vec<OutputArtifact> {
        self.collect(&["images"], ArtifactKind::Image)
    }

    /// Videos from every output node. Video-combine nodes report under
    /// `gifs`; others use `videos`.
    pub fn videos(&self) -> Vec<OutputArtifact> {
        self.collect(&["gifs", "videos"], ArtifactKind::Video)
    }

    fn collect(&self, keys: &[&str], kind: ArtifactKind) -> Vec<OutputArtifact> {
        let mut artifacts = Vec::new();
        for (node_id, output) in &self.outputs {
            for key in keys {
                let Some(files) = output.get(*key).and_then(Value::as_array) else {
                    continue;
                };
                for file in files {
                    let field = |name: &str| {
                        file.get(name)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    };
                    let filename = field("filename");
                    if filename.is_empty() {
                        continue;
                    }
                    let folder_type = Some(field("type"))
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| "output".to_string());
                    artifacts.push(OutputArtifact {
                        node_id: node_id.clone(),
                        filename,
                        subfolder: field("subfolder"),
                        folder_type,
                        kind,
                    });
                }
            }
        }
        artifacts
    }
}
