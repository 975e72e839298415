//! Job submission and completion tracking.
//!
//! [`JobClient`] drives one unit of work through a backend: validate the
//! workflow against the node catalogue, upload its images, submit it and
//! wait for the result.
//!
//! Completion is detected over two channels. The WebSocket stream is read
//! with a bounded wait; on every idle tick, and at least every
//! [`JobSettings::history_interval`], the history endpoint is queried.
//! A terminal history record always wins, so a silent or lagging stream
//! never delays completion. If the stream breaks, the client polls queue
//! and history until the deadline instead. Every backend call made while
//! waiting is cut off at the deadline.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;

use crate::api::{ComfyBackend, ComfyUIApiError, PromptRejection, SubmitResponse};
use crate::capabilities::{NodeCatalog, WorkflowIssue};
use crate::client::{EventSource, StreamConnector, StreamRead};
use crate::events::JobEvent;
use crate::history::{ExecutionFailure, HistoryRecord, OutputArtifact};
use crate::messages::ComfyUIMessage;
use crate::workflow::{Workflow, WorkflowError};

/// Timing knobs for [`JobClient::await_completion`].
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Bound on a single stream read.
    pub stream_wait: Duration,
    /// Maximum gap between history checks while streaming.
    pub history_interval: Duration,
    /// Sleep between polls once the stream is gone.
    pub poll_interval: Duration,
    /// Consecutive failed polls tolerated before giving up.
    pub max_poll_failures: u32,
    /// Bound on the cancel request sent after a timeout.
    pub cancel_wait: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            stream_wait: Duration::from_secs(2),
            history_interval: Duration::from_secs(3),
            poll_interval: Duration::from_secs(2),
            max_poll_failures: 3,
            cancel_wait: Duration::from_secs(5),
        }
    }
}

/// Errors surfaced by the job client.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Local validation against the node catalogue failed.
    #[error("Workflow failed validation: {}", join_issues(.0))]
    Validation(Vec<WorkflowIssue>),

    /// The workflow template could not be turned into a graph.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// The server refused the workflow at submission time.
    #[error("Workflow rejected by server: {0}")]
    Rejected(PromptRejection),

    /// The workflow ran and failed.
    #[error("Execution failed at {0}")]
    Execution(ExecutionFailure),

    #[error("Execution of {prompt_id} was interrupted")]
    Interrupted { prompt_id: String },

    #[error(
        "Job {prompt_id} did not finish within {seconds}s; \
         try a lower resolution preset or fewer frames"
    )]
    Timeout { prompt_id: String, seconds: u64 },

    /// Both completion channels failed.
    #[error("Lost track of job {prompt_id}: {reason}")]
    Transport { prompt_id: String, reason: String },

    #[error("Failed to upload {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: ComfyUIApiError,
    },

    #[error("Job {prompt_id} produced no {kind} output")]
    NoOutput {
        prompt_id: String,
        kind: &'static str,
    },

    #[error(transparent)]
    Api(ComfyUIApiError),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<ComfyUIApiError> for JobError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Rejected(rejection) => Self::Rejected(rejection),
            other => Self::Api(other),
        }
    }
}

fn join_issues(issues: &[WorkflowIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// How the wait loop currently learns about progress.
enum Channel {
    Streaming(Box<dyn EventSource>),
    Polling,
}

/// Submits workflows to one backend and waits for their results.
pub struct JobClient {
    backend: Arc<dyn ComfyBackend>,
    connector: Arc<dyn StreamConnector>,
    client_id: String,
    settings: JobSettings,
    catalog: OnceCell<NodeCatalog>,
}

impl JobClient {
    pub fn new(backend: Arc<dyn ComfyBackend>, connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            backend,
            connector,
            client_id: uuid::Uuid::new_v4().to_string(),
            settings: JobSettings::default(),
            catalog: OnceCell::new(),
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `true` when the backend answers its stats endpoint.
    pub async fn is_available(&self) -> bool {
        self.backend.system_stats().await.is_ok()
    }

    /// Ask the backend to unload models before a model switch.
    pub async fn free_memory(&self) -> Result<(), JobError> {
        self.backend.free_memory().await?;
        tracing::info!("Requested backend memory release");
        Ok(())
    }

    /// Node catalogue, fetched once and cached for the client's lifetime.
    pub async fn capabilities(&self) -> Result<&NodeCatalog, JobError> {
        self.catalog
            .get_or_try_init(|| async {
                let info = self.backend.object_info().await?;
                let catalog = NodeCatalog::from_object_info(&info);
                tracing::debug!(node_types = catalog.len(), "Fetched node catalogue");
                Ok(catalog)
            })
            .await
    }

    /// Check the workflow's nodes against the catalogue.
    pub async fn validate(&self, workflow: &Workflow) -> Result<(), JobError> {
        let issues = self.capabilities().await?.validate_workflow(workflow.graph());
        if issues.is_empty() {
            Ok(())
        } else {
            Err(JobError::Validation(issues))
        }
    }

    /// Upload the workflow's images and queue it.
    pub async fn submit(&self, workflow: &Workflow) -> Result<SubmitResponse, JobError> {
        let mut uploaded = BTreeMap::new();
        for path in workflow.uploads() {
            let image = self
                .backend
                .upload_image(path)
                .await
                .map_err(|source| JobError::Upload {
                    path: path.display().to_string(),
                    source,
                })?;
            tracing::debug!(path = %path.display(), name = %image.name, "Uploaded input image");
            uploaded.insert(path.to_path_buf(), image.name);
        }

        let graph = workflow.bind_uploads(&uploaded)?;
        let response = self.backend.submit_workflow(&graph, &self.client_id).await?;
        tracing::info!(
            prompt_id = %response.prompt_id,
            number = response.number,
            "Workflow queued",
        );
        Ok(response)
    }

    /// Wait for `prompt_id` to reach a terminal state, opening a fresh
    /// event stream for it.
    pub async fn await_completion<F>(
        &self,
        prompt_id: &str,
        timeout: Duration,
        mut on_event: F,
    ) -> Result<HistoryRecord, JobError>
    where
        F: FnMut(JobEvent) + Send,
    {
        let deadline = Instant::now() + timeout;
        let channel = self.open_channel(prompt_id, deadline, &mut on_event).await;
        self.wait(prompt_id, channel, deadline, timeout, &mut on_event)
            .await
    }

    /// Validate, submit and wait. The event stream is opened before
    /// submission so no early message is missed.
    pub async fn execute<F>(
        &self,
        workflow: &Workflow,
        timeout: Duration,
        mut on_event: F,
    ) -> Result<HistoryRecord, JobError>
    where
        F: FnMut(JobEvent) + Send,
    {
        self.validate(workflow).await?;

        let deadline = Instant::now() + timeout;
        let channel = self.open_channel("", deadline, &mut on_event).await;
        let submitted = self.submit(workflow).await?;
        on_event(JobEvent::Queued {
            prompt_id: submitted.prompt_id.clone(),
            number: submitted.number,
        });

        if let Channel::Polling = channel {
            on_event(JobEvent::FallbackToPolling {
                prompt_id: submitted.prompt_id.clone(),
                reason: "event stream unavailable".to_string(),
            });
        }
        self.wait(&submitted.prompt_id, channel, deadline, timeout, &mut on_event)
            .await
    }

    /// Fetch an output artifact and write it to `dest`, creating parent
    /// directories.
    pub async fn download(&self, artifact: &OutputArtifact, dest: &Path) -> Result<(), JobError> {
        let bytes = self
            .backend
            .view(&artifact.filename, &artifact.subfolder, &artifact.folder_type)
            .await?;

        let io_err = |source| JobError::Io {
            path: dest.display().to_string(),
            source,
        };
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(dest, &bytes).await.map_err(io_err)?;

        tracing::info!(
            file = %artifact.filename,
            dest = %dest.display(),
            bytes = bytes.len(),
            "Downloaded output",
        );
        Ok(())
    }

    /// Download the first image (or video) of a finished job to `dest`.
    pub async fn download_first(
        &self,
        record: &HistoryRecord,
        videos: bool,
        dest: &Path,
    ) -> Result<PathBuf, JobError> {
        let (artifacts, kind) = if videos {
            (record.videos(), "video")
        } else {
            (record.images(), "image")
        };
        let artifact = artifacts.first().ok_or_else(|| JobError::NoOutput {
            prompt_id: record.prompt_id.clone(),
            kind,
        })?;
        self.download(artifact, dest).await?;
        Ok(dest.to_path_buf())
    }

    // ---- completion loop ----

    async fn open_channel<F>(&self, prompt_id: &str, deadline: Instant, on_event: &mut F) -> Channel
    where
        F: FnMut(JobEvent) + Send,
    {
        let reason = match before(deadline, self.connector.open(&self.client_id)).await {
            Some(Ok(source)) => return Channel::Streaming(source),
            Some(Err(e)) => e.to_string(),
            None => "event stream did not open before the deadline".to_string(),
        };
        tracing::warn!(reason = %reason, "Event stream unavailable, polling instead");
        if !prompt_id.is_empty() {
            on_event(JobEvent::FallbackToPolling {
                prompt_id: prompt_id.to_string(),
                reason,
            });
        }
        Channel::Polling
    }

    async fn wait<F>(
        &self,
        prompt_id: &str,
        mut channel: Channel,
        deadline: Instant,
        timeout: Duration,
        on_event: &mut F,
    ) -> Result<HistoryRecord, JobError>
    where
        F: FnMut(JobEvent) + Send,
    {
        // The job may already be done; a cached workflow finishes instantly.
        if let Some(Ok(Some(record))) = before(deadline, self.check_history(prompt_id)).await {
            return finish(record, on_event);
        }
        let mut last_history = Instant::now();
        let mut poll_failures = 0u32;
        let mut fallback = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(prompt_id, timeout, on_event).await);
            }
            let remaining = deadline - now;

            match &mut channel {
                Channel::Streaming(source) => {
                    let wait = self.settings.stream_wait.min(remaining);
                    let read = before(deadline, source.next_message(wait))
                        .await
                        .unwrap_or(StreamRead::Idle);
                    let mut check_now = false;
                    let lost = match read {
                        StreamRead::Message(msg) => {
                            check_now = handle_message(prompt_id, msg, on_event)?;
                            None
                        }
                        StreamRead::Idle => {
                            check_now = true;
                            None
                        }
                        StreamRead::Other => None,
                        StreamRead::Closed => Some("stream closed".to_string()),
                        StreamRead::Failed(reason) => Some(reason),
                    };

                    if let Some(reason) = lost {
                        tracing::warn!(
                            prompt_id = %prompt_id,
                            reason = %reason,
                            "Event stream lost, falling back to polling",
                        );
                        on_event(JobEvent::FallbackToPolling {
                            prompt_id: prompt_id.to_string(),
                            reason,
                        });
                        fallback = true;
                    } else if check_now
                        || last_history.elapsed() >= self.settings.history_interval
                    {
                        last_history = Instant::now();
                        match before(deadline, self.check_history(prompt_id)).await {
                            Some(Ok(Some(record))) => return finish(record, on_event),
                            Some(Ok(None)) | None => {}
                            Some(Err(e)) => {
                                tracing::debug!(
                                    prompt_id = %prompt_id,
                                    error = %e,
                                    "History check failed",
                                );
                            }
                        }
                    }
                }
                Channel::Polling => {
                    let Some(polled) = before(deadline, self.poll(prompt_id)).await else {
                        continue;
                    };
                    match polled {
                        Ok(Some(record)) => return finish(record, on_event),
                        Ok(None) => poll_failures = 0,
                        Err(reason) => {
                            poll_failures += 1;
                            tracing::warn!(
                                prompt_id = %prompt_id,
                                attempt = poll_failures,
                                reason = %reason,
                                "Poll failed",
                            );
                            if poll_failures >= self.settings.max_poll_failures {
                                return Err(JobError::Transport {
                                    prompt_id: prompt_id.to_string(),
                                    reason,
                                });
                            }
                        }
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;
                }
            }

            if fallback {
                channel = Channel::Polling;
                fallback = false;
            }
        }
    }

    async fn check_history(&self, prompt_id: &str) -> Result<Option<HistoryRecord>, JobError> {
        let history = self.backend.get_history(prompt_id).await?;
        Ok(HistoryRecord::from_history(prompt_id, &history))
    }

    /// One polling round: history first, then the queue to tell "still
    /// waiting" from "vanished".
    async fn poll(&self, prompt_id: &str) -> Result<Option<HistoryRecord>, String> {
        if let Some(record) = self.check_history(prompt_id).await.map_err(|e| e.to_string())? {
            return Ok(Some(record));
        }
        let queue = self.backend.get_queue().await.map_err(|e| e.to_string())?;
        if queue.contains(prompt_id) {
            Ok(None)
        } else {
            // It may have finished between the two calls; the next round's
            // history check settles it.
            Err("prompt is neither queued nor in history".to_string())
        }
    }

    async fn timed_out<F>(&self, prompt_id: &str, timeout: Duration, on_event: &mut F) -> JobError
    where
        F: FnMut(JobEvent) + Send,
    {
        let cancel = self.backend.cancel_execution(prompt_id);
        match tokio::time::timeout(self.settings.cancel_wait, cancel).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(prompt_id = %prompt_id, error = %e, "Cancel after timeout failed");
            }
            Err(_) => tracing::debug!(prompt_id = %prompt_id, "Cancel after timeout got no answer"),
        }
        let err = JobError::Timeout {
            prompt_id: prompt_id.to_string(),
            seconds: timeout.as_secs(),
        };
        on_event(JobEvent::Failed {
            prompt_id: prompt_id.to_string(),
            message: err.to_string(),
        });
        err
    }
}

/// Run `call` unless `deadline` passes first.
async fn before<T>(deadline: Instant, call: impl Future<Output = T>) -> Option<T> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    tokio::time::timeout(remaining, call).await.ok()
}

/// Turn a terminal record into the final result.
fn finish<F>(record: HistoryRecord, on_event: &mut F) -> Result<HistoryRecord, JobError>
where
    F: FnMut(JobEvent) + Send,
{
    if let Some(failure) = record.failure() {
        on_event(JobEvent::Failed {
            prompt_id: record.prompt_id.clone(),
            message: failure.to_string(),
        });
        return Err(JobError::Execution(failure));
    }
    tracing::info!(prompt_id = %record.prompt_id, "Job completed");
    on_event(JobEvent::Completed {
        prompt_id: record.prompt_id.clone(),
    });
    Ok(record)
}

/// React to one stream message. Returns `true` when the message hints
/// that the job finished and history should be checked right away.
fn handle_message<F>(prompt_id: &str, msg: ComfyUIMessage, on_event: &mut F) -> Result<bool, JobError>
where
    F: FnMut(JobEvent) + Send,
{
    // Messages without a prompt id (old-style progress) are attributed to
    // the job in flight.
    if msg.prompt_id().is_some_and(|id| id != prompt_id) {
        return Ok(false);
    }
    if msg.is_success() {
        return Ok(true);
    }
    let id = prompt_id.to_string();

    match msg {
        ComfyUIMessage::ExecutionStart(_) => on_event(JobEvent::Started { prompt_id: id }),
        ComfyUIMessage::ExecutionCached(data) => {
            if !data.nodes.is_empty() {
                on_event(JobEvent::Cached {
                    prompt_id: id,
                    nodes: data.nodes,
                });
            }
        }
        ComfyUIMessage::Executing(data) => {
            if let Some(node) = data.node {
                on_event(JobEvent::NodeExecuting { prompt_id: id, node });
            }
        }
        ComfyUIMessage::Progress(data) => on_event(JobEvent::Progress {
            prompt_id: id,
            percent: data.percent(),
            value: data.value,
            max: data.max,
        }),
        ComfyUIMessage::ExecutionError(data) => {
            let failure = ExecutionFailure::from_error_data(&data);
            tracing::warn!(prompt_id = %prompt_id, failure = %failure, "Execution error");
            on_event(JobEvent::Failed {
                prompt_id: id,
                message: failure.to_string(),
            });
            return Err(JobError::Execution(failure));
        }
        ComfyUIMessage::ExecutionInterrupted(_) => {
            on_event(JobEvent::Failed {
                prompt_id: id.clone(),
                message: "interrupted".to_string(),
            });
            return Err(JobError::Interrupted { prompt_id: id });
        }
        ComfyUIMessage::Status(_) | ComfyUIMessage::Executed(_) | ComfyUIMessage::ExecutionSuccess(_) => {}
    }
    Ok(false)
}
