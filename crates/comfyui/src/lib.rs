//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, the HTTP API wrapper, node catalogue
//! validation, workflow templating and the job client that submits a
//! workflow and waits for it over the event stream with history polling
//! as the authoritative fallback.

pub mod api;
pub mod capabilities;
pub mod client;
pub mod events;
pub mod history;
pub mod job;
pub mod messages;
pub mod workflow;

pub use api::{ComfyBackend, ComfyUIApi, ComfyUIApiError};
pub use client::{ComfyUIClient, EventSource, StreamConnector, StreamRead};
pub use events::JobEvent;
pub use history::{ExecutionFailure, HistoryRecord, OutputArtifact};
pub use job::{JobClient, JobError, JobSettings};
pub use workflow::{ResolutionPreset, Workflow, WorkflowBuilder};
