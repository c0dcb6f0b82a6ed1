//! ComfyUI WebSocket message types, parser and normalizer.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`, but some builds and extensions
//! place the payload fields top-level next to `type`. [`parse_message`]
//! accepts both and deserializes them into a strongly-typed
//! [`ComfyUIMessage`]; [`normalize`] then maps a message onto an
//! [`ExecutionEvent`] for one job, discarding frames of other jobs.

use atelier_core::job::ResultRef;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::events::ExecutionEvent;

/// All known ComfyUI WebSocket message types.
///
/// Deserialized via the adjacently-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Execution finished (older builds and some extensions).
    #[serde(rename = "execution_complete")]
    ExecutionComplete(PromptData),

    /// Execution finished successfully.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

/// Queue status information.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub status: Option<QueueStatus>,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i64,
}

/// Payload carrying only the prompt identity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptData {
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: u32,
    /// Total number of steps.
    pub max: u32,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

impl ComfyUIMessage {
    /// The prompt this message is about, if it says.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::ExecutionStart(d) | Self::ExecutionComplete(d) | Self::ExecutionSuccess(d) => {
                d.prompt_id.as_deref()
            }
            Self::ExecutionCached(d) => d.prompt_id.as_deref(),
            Self::Executing(d) => d.prompt_id.as_deref(),
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::Executed(d) => d.prompt_id.as_deref(),
            Self::ExecutionError(d) => d.prompt_id.as_deref(),
        }
    }
}

/// Errors from [`parse_message`].
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not a JSON object with a string `type`")]
    MissingType,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// The payload is taken from `data` when it is an object, otherwise from
/// the remaining top-level fields. Returns `Err` for malformed JSON or
/// unknown `type` values; callers should log and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, MessageError> {
    let mut frame: Map<String, Value> = serde_json::from_str(text)?;

    let kind = match frame.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(MessageError::MissingType),
    };
    let payload = match frame.remove("data") {
        Some(Value::Object(data)) => Value::Object(data),
        _ => Value::Object(frame),
    };

    let envelope = serde_json::json!({ "type": kind, "data": payload });
    Ok(serde_json::from_value(envelope)?)
}

/// Outcome of normalizing one message for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// The message concerns this job (or is a job-less broadcast).
    Event(ExecutionEvent),
    /// The message belongs to another job sharing the channel.
    Foreign { prompt_id: String },
}

/// Map a parsed message onto a normalized event for `job_id`.
///
/// Messages tagged with a different prompt are returned as
/// [`Normalized::Foreign`] and must not influence the job.
pub fn normalize(message: &ComfyUIMessage, job_id: &str) -> Normalized {
    if let Some(prompt_id) = message.prompt_id() {
        if prompt_id != job_id {
            return Normalized::Foreign {
                prompt_id: prompt_id.to_string(),
            };
        }
    }

    let event = match message {
        ComfyUIMessage::Status(data) => ExecutionEvent::QueueStatus {
            queue_remaining: data.status.as_ref().map(|s| s.exec_info.queue_remaining),
        },
        ComfyUIMessage::ExecutionStart(_) => ExecutionEvent::Started,
        ComfyUIMessage::ExecutionCached(data) => ExecutionEvent::Cached {
            nodes: data.nodes.clone(),
        },
        ComfyUIMessage::Executing(data) => match &data.node {
            Some(node) => ExecutionEvent::NodeExecuting {
                node_id: node.clone(),
            },
            None => ExecutionEvent::ExecutionComplete,
        },
        ComfyUIMessage::Progress(data) => ExecutionEvent::Progress {
            value: data.value,
            max: data.max,
        },
        ComfyUIMessage::Executed(data) => ExecutionEvent::NodeExecuted {
            node_id: data.node.clone(),
            result_refs: output_images(&data.output),
        },
        ComfyUIMessage::ExecutionComplete(_) | ComfyUIMessage::ExecutionSuccess(_) => {
            ExecutionEvent::ExecutionComplete
        }
        ComfyUIMessage::ExecutionError(data) => ExecutionEvent::ExecutionFailed {
            node_id: data.node_id.clone(),
            message: if data.exception_type.is_empty() {
                data.exception_message.clone()
            } else {
                format!("{}: {}", data.exception_type, data.exception_message)
            },
        },
    };

    Normalized::Event(event)
}

/// Extract `output.images[*]` entries that carry a filename.
fn output_images(output: &Value) -> Vec<ResultRef> {
    output
        .get("images")
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter(|img| img.get("filename").is_some_and(Value::is_string))
                .filter_map(|img| serde_json::from_value(img.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
