//! ComfyUI over HTTP.
//!
//! [`ComfyUIApi`] covers the endpoints a generation job touches: node
//! catalogue, prompt submission, queue and history, upload and download,
//! and memory release. The job client talks to it through [`ComfyBackend`],
//! which tests replace with an in-memory backend.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

/// Whole-request limit, long enough for a video download.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Accepted `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position.
    #[serde(default)]
    pub number: i64,
}

/// Result of `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedImage {
    /// Name to reference from `LoadImage` nodes.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub folder_type: String,
}

/// Running and pending prompt ids from `GET /queue`.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    pub fn contains(&self, prompt_id: &str) -> bool {
        self.running.iter().chain(&self.pending).any(|id| id == prompt_id)
    }

    fn from_value(value: &Value) -> Self {
        // Each entry is `[number, prompt_id, prompt, extra_data, outputs]`.
        let ids = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|e| e.get(1).and_then(Value::as_str).map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            running: ids("queue_running"),
            pending: ids("queue_pending"),
        }
    }
}

/// One node's validation failures inside a rejected submission.
#[derive(Debug, Clone)]
pub struct NodeRejection {
    pub node_id: String,
    pub class_type: Option<String>,
    pub errors: Vec<String>,
}

/// Structured reason the server refused a workflow at submission time.
#[derive(Debug, Clone)]
pub struct PromptRejection {
    pub error_type: String,
    pub message: String,
    pub details: String,
    pub node_errors: Vec<NodeRejection>,
}

impl PromptRejection {
    /// Parse the `{"error": {...}, "node_errors": {...}}` body ComfyUI
    /// returns for an invalid prompt. Returns `None` for any other shape.
    pub fn from_body(body: &Value) -> Option<Self> {
        let error = body.get("error").filter(|e| !e.is_null())?;
        let text = |v: &Value, key: &str| {
            v.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let (error_type, message, details) = match error {
            Value::String(msg) => (String::new(), msg.clone(), String::new()),
            other => (
                text(other, "type"),
                text(other, "message"),
                text(other, "details"),
            ),
        };

        let node_errors = body
            .get("node_errors")
            .and_then(Value::as_object)
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|(node_id, node)| NodeRejection {
                        node_id: node_id.clone(),
                        class_type: node
                            .get("class_type")
                            .and_then(Value::as_str)
                            .map(String::from),
                        errors: node
                            .get("errors")
                            .and_then(Value::as_array)
                            .map(|errs| {
                                errs.iter()
                                    .map(|e| {
                                        let msg = text(e, "message");
                                        let details = text(e, "details");
                                        if details.is_empty() {
                                            msg
                                        } else {
                                            format!("{msg}: {details}")
                                        }
                                    })
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            error_type,
            message,
            details,
            node_errors,
        })
    }
}

impl std::fmt::Display for PromptRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.details.is_empty() {
            write!(f, " ({})", self.details)?;
        }
        for node in &self.node_errors {
            let class = node.class_type.as_deref().unwrap_or("?");
            write!(f, "; node {} [{class}]: {}", node.node_id, node.errors.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Connection, timeout or body decoding failure.
    #[error("request to ComfyUI failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI answered {status}: {body}")]
    Status { status: u16, body: String },

    /// The workflow was refused at submission time.
    #[error("workflow rejected: {0}")]
    Rejected(PromptRejection),

    /// A local file to upload could not be read.
    #[error("cannot read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Operations the job client needs from a compute backend.
#[async_trait]
pub trait ComfyBackend: Send + Sync {
    /// `GET /object_info`: every node class the server knows.
    async fn object_info(&self) -> Result<Value, ComfyUIApiError>;

    /// `POST /prompt`.
    async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// `GET /history/{prompt_id}`. An empty object means "not finished".
    async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError>;

    /// `GET /queue`.
    async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError>;

    /// `POST /upload/image`.
    async fn upload_image(&self, path: &Path) -> Result<UploadedImage, ComfyUIApiError>;

    /// `GET /view`.
    async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError>;

    /// `POST /free`: unload models and release cached memory.
    async fn free_memory(&self) -> Result<(), ComfyUIApiError>;

    /// `GET /system_stats`, used as an availability probe.
    async fn system_stats(&self) -> Result<Value, ComfyUIApiError>;

    /// `POST /queue` with a delete list.
    async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError>;
}

impl ComfyUIApi {
    /// `api_url` is the server root, e.g. `http://127.0.0.1:8188`.
    /// Requests give up after [`REQUEST_TIMEOUT`].
    pub fn new(api_url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "HTTP client setup failed, using defaults");
                reqwest::Client::new()
            });
        Self::with_client(client, api_url)
    }

    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(format!("{}{path}", self.api_url))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(format!("{}{path}", self.api_url))
    }
}

/// Send `request`; any non-2xx answer becomes [`ComfyUIApiError::Status`].
async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, ComfyUIApiError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ComfyUIApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, ComfyUIApiError> {
    Ok(send(request).await?.json::<T>().await?)
}

#[async_trait]
impl ComfyBackend for ComfyUIApi {
    async fn object_info(&self) -> Result<Value, ComfyUIApiError> {
        send_json(self.get("/object_info")).await
    }

    /// Rejections come back as `400` with a structured body; some servers
    /// answer `200` with an `error` key instead. Both become
    /// [`ComfyUIApiError::Rejected`].
    async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let request = self
            .post("/prompt")
            .json(&json!({"prompt": workflow, "client_id": client_id}));
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        let parsed = serde_json::from_str::<Value>(&body).ok();
        if let Some(rejection) = parsed.as_ref().and_then(PromptRejection::from_body) {
            return Err(ComfyUIApiError::Rejected(rejection));
        }
        match parsed.map(serde_json::from_value::<SubmitResponse>) {
            Some(Ok(submitted)) if (200..300).contains(&status) => Ok(submitted),
            _ => Err(ComfyUIApiError::Status { status, body }),
        }
    }

    async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        send_json(self.get(&format!("/history/{prompt_id}"))).await
    }

    async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let value: Value = send_json(self.get("/queue")).await?;
        Ok(QueueSnapshot::from_value(&value))
    }

    async fn upload_image(&self, path: &Path) -> Result<UploadedImage, ComfyUIApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ComfyUIApiError::File {
                path: path.display().to_string(),
                source,
            })?;
        let filename = path
            .file_name()
            .map_or_else(|| "upload.png".to_string(), |n| n.to_string_lossy().into_owned());

        let form = Form::new()
            .part("image", Part::bytes(bytes).file_name(filename))
            .text("overwrite", "true");
        send_json(self.post("/upload/image").multipart(form)).await
    }

    async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.get("/view").query(&[
            ("filename", filename),
            ("subfolder", subfolder),
            ("type", folder_type),
        ]);
        Ok(send(request).await?.bytes().await?.to_vec())
    }

    async fn free_memory(&self) -> Result<(), ComfyUIApiError> {
        let body = json!({"unload_models": true, "free_memory": true});
        send(self.post("/free").json(&body)).await.map(drop)
    }

    async fn system_stats(&self) -> Result<Value, ComfyUIApiError> {
        send_json(self.get("/system_stats")).await
    }

    async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        send(self.post("/queue").json(&json!({"delete": [prompt_id]})))
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_snapshot_reads_prompt_ids() {
        let snapshot = QueueSnapshot::from_value(&json!({
            "queue_running": [[3, "p-run", {}, {}, []]],
            "queue_pending": [[4, "p-wait", {}, {}, []], [5, "p-later", {}, {}, []]]
        }));
        assert_eq!(snapshot.running, ["p-run"]);
        assert!(snapshot.contains("p-later"));
        assert!(!snapshot.contains("p-gone"));
    }

    #[test]
    fn rejection_parses_node_errors() {
        let rejection = PromptRejection::from_body(&json!({
            "error": {
                "type": "prompt_outputs_failed_validation",
                "message": "Prompt outputs failed validation",
                "details": "",
                "extra_info": {}
            },
            "node_errors": {
                "4": {
                    "errors": [{
                        "type": "value_not_in_list",
                        "message": "Value not in list",
                        "details": "ckpt_name: 'missing.safetensors' not in []"
                    }],
                    "dependent_outputs": ["9"],
                    "class_type": "CheckpointLoaderSimple"
                }
            }
        }))
        .unwrap();

        assert_eq!(rejection.error_type, "prompt_outputs_failed_validation");
        assert_eq!(rejection.node_errors.len(), 1);
        assert_eq!(
            rejection.node_errors[0].class_type.as_deref(),
            Some("CheckpointLoaderSimple")
        );
        let text = rejection.to_string();
        assert!(text.contains("node 4 [CheckpointLoaderSimple]"));
        assert!(text.contains("missing.safetensors"));
    }

    #[test]
    fn plain_string_error_is_a_rejection() {
        let rejection = PromptRejection::from_body(&json!({"error": "no outputs"})).unwrap();
        assert_eq!(rejection.message, "no outputs");
        assert!(rejection.node_errors.is_empty());
    }

    #[test]
    fn success_body_is_not_a_rejection() {
        assert!(PromptRejection::from_body(&json!({"prompt_id": "p", "number": 1})).is_none());
    }
}
