//! Progress events emitted while a job runs.
//!
//! The job client translates raw WebSocket messages and its own state
//! changes into [`JobEvent`]s and hands each one to the caller's progress
//! callback.

use std::fmt;

use serde::Serialize;

/// A job-level state change or progress report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The server accepted the workflow.
    Queued { prompt_id: String, number: i64 },

    /// The server started executing the prompt.
    Started { prompt_id: String },

    /// Some nodes were served from cache.
    Cached { prompt_id: String, nodes: Vec<String> },

    /// A node began executing.
    NodeExecuting { prompt_id: String, node: String },

    /// Step-level progress inside a node.
    Progress {
        prompt_id: String,
        /// Completion percentage (0-100).
        percent: u8,
        value: i32,
        max: i32,
    },

    /// The event stream failed; completion is now detected by polling.
    FallbackToPolling { prompt_id: String, reason: String },

    /// A terminal success record was found.
    Completed { prompt_id: String },

    /// The job ended in an error.
    Failed { prompt_id: String, message: String },
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued { prompt_id, number } => write!(f, "Job queued: {prompt_id} (#{number})"),
            Self::Started { .. } => f.write_str("Execution started"),
            Self::Cached { nodes, .. } => write!(f, "{} cached node(s)", nodes.len()),
            Self::NodeExecuting { node, .. } => write!(f, "Executing node: {node}"),
            Self::Progress { percent, .. } => write!(f, "Progress: {percent}%"),
            Self::FallbackToPolling { reason, .. } => {
                write!(f, "Event stream lost ({reason}), polling")
            }
            Self::Completed { .. } => f.write_str("Completed"),
            Self::Failed { message, .. } => write!(f, "Failed: {message}"),
        }
    }
}
