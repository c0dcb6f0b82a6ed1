//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the pull-channel surface of the engine (workflow submission,
//! queue state, execution history, artifact retrieval) using
//! [`reqwest`]. Every request is bounded by the client timeout.
//!
//! The [`EngineApi`] trait is the seam the reconciler and artifact
//! fetcher depend on, so they can run against a fake engine in tests.

use std::time::Duration;

use async_trait::async_trait;
use atelier_core::job::{ResultRef, StoreKind};
use serde::Deserialize;
use serde_json::Value;

/// Default connect/response bound for every HTTP call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Response returned by the ComfyUI `/api/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Snapshot of the engine's execution queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueState {
    /// Whether anything is currently executing.
    pub running: bool,
    /// Number of prompts waiting behind the running one.
    pub pending: usize,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (connection refused, DNS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A success response whose body was not the expected JSON.
    #[error("Malformed ComfyUI response: {0}")]
    Decode(String),
}

/// The engine's HTTP surface as seen by the job pipeline.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Queue a workflow; `client_id` correlates push-channel frames.
    async fn submit(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// Current queue state.
    async fn queue_state(&self) -> Result<QueueState, ComfyUIApiError>;

    /// Result references recorded for `job_id`, or `None` when the engine
    /// has no history entry for it yet. An entry without image outputs
    /// yields an empty vector.
    async fn history(&self, job_id: &str) -> Result<Option<Vec<ResultRef>>, ComfyUIApiError>;

    /// Raw bytes of a generated artifact.
    async fn view(&self, result: &ResultRef) -> Result<Vec<u8>, ComfyUIApiError>;
}

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    /// * `timeout` - Connect and whole-response bound per request.
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling across concurrent jobs).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base HTTP API URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ComfyUIApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EngineApi for ComfyUIApi {
    /// Sends a `POST /api/prompt` request with the given workflow JSON and
    /// client ID.
    async fn submit(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/api/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn queue_state(&self) -> Result<QueueState, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/api/queue", self.api_url))
            .send()
            .await?;

        let body: Value = Self::parse_response(response).await?;
        Ok(parse_queue_state(&body))
    }

    /// Fetches the full `GET /api/history` mapping and looks up `job_id`.
    async fn history(&self, job_id: &str) -> Result<Option<Vec<ResultRef>>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/api/history", self.api_url))
            .send()
            .await?;

        let body: Value = Self::parse_response(response).await?;
        Ok(parse_history(&body, job_id))
    }

    async fn view(&self, result: &ResultRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", result.filename.as_str()),
                ("subfolder", result.subfolder.as_str()),
                ("type", result.store_kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Interpret a `/api/queue` body.
///
/// `queue_running` is a list of running entries on current engines and a
/// plain flag on some forks; both are accepted.
pub fn parse_queue_state(body: &Value) -> QueueState {
    let running = match body.get("queue_running") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    };
    let pending = body
        .get("queue_pending")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    QueueState { running, pending }
}

/// Collect the image outputs recorded for `job_id` in a `/api/history`
/// body. Every reference is reported as [`StoreKind::Output`].
pub fn parse_history(body: &Value, job_id: &str) -> Option<Vec<ResultRef>> {
    let entry = body.get(job_id)?;

    let refs = entry
        .get("outputs")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|outputs| outputs.values())
        .filter_map(|node_output| node_output.get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|image| {
            let filename = image.get("filename")?.as_str()?;
            let subfolder = image
                .get("subfolder")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(ResultRef {
                filename: filename.to_string(),
                subfolder: subfolder.to_string(),
                store_kind: StoreKind::Output,
            })
        })
        .collect();

    Some(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn queue_running_list_is_truthy_when_non_empty() {
        let state = parse_queue_state(&json!({
            "queue_running": [[0, "J1", {}, {}, []]],
            "queue_pending": [[1, "J2"], [2, "J3"]]
        }));
        assert_eq!(state, QueueState { running: true, pending: 2 });
    }

    #[test]
    fn queue_running_flag_and_empty_list() {
        assert!(parse_queue_state(&json!({"queue_running": true})).running);
        assert!(!parse_queue_state(&json!({"queue_running": []})).running);
        assert!(!parse_queue_state(&json!({})).running);
    }

    #[test]
    fn history_missing_job_is_none() {
        let body = json!({"OTHER": {"outputs": {}}});
        assert!(parse_history(&body, "J1").is_none());
    }

    #[test]
    fn history_without_images_is_empty() {
        let body = json!({"J1": {"outputs": {"9": {"text": ["hello"]}}}});
        assert_eq!(parse_history(&body, "J1"), Some(vec![]));
    }

    #[test]
    fn history_collects_images_as_output() {
        let body = json!({
            "J1": {
                "outputs": {
                    "9": {"images": [
                        {"filename": "a.png", "subfolder": "2024", "type": "temp"},
                        {"subfolder": "ignored-without-filename"}
                    ]},
                    "12": {"images": [{"filename": "b.png"}]}
                }
            }
        });
        let refs = parse_history(&body, "J1").unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.store_kind == StoreKind::Output));
        assert!(refs.contains(&ResultRef::output("a.png", "2024")));
        assert!(refs.contains(&ResultRef::output("b.png", "")));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = ComfyUIApi::with_client(reqwest::Client::new(), "http://host:8188/");
        assert_eq!(api.api_url(), "http://host:8188");
    }
}
