//! Job lifecycle types.
//!
//! A [`Job`] is created when a graph is submitted and is owned by exactly
//! one progress reconciler, which is the only code that mutates it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Result references
// ---------------------------------------------------------------------------

/// Storage area the engine serves an artifact from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Output,
    Temp,
    Input,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Temp => "temp",
            Self::Input => "input",
        }
    }
}

/// Opaque locator of a generated artifact; forwarded as-is to the
/// artifact fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub store_kind: StoreKind,
}

impl ResultRef {
    pub fn output(filename: impl Into<String>, subfolder: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            subfolder: subfolder.into(),
            store_kind: StoreKind::Output,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The caller requested cancellation.
    Cancelled,
    /// The job was rejected before submission (bad input image, etc.).
    Invalid(String),
    /// The engine rejected the graph.
    Submission { status: u16, body: String },
    /// The engine could not be reached.
    Transport(String),
    /// The engine reported an execution error.
    Engine { node_id: Option<String>, message: String },
    /// The sole result could not be downloaded or decoded.
    Artifact(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::Invalid(msg) => write!(f, "invalid job: {msg}"),
            Self::Submission { status, body } => {
                write!(f, "engine rejected the workflow ({status}): {body}")
            }
            Self::Transport(msg) => write!(f, "engine unreachable: {msg}"),
            Self::Engine {
                node_id: Some(node),
                message,
            } => write!(f, "execution failed at node {node}: {message}"),
            Self::Engine {
                node_id: None,
                message,
            } => write!(f, "execution failed: {message}"),
            Self::Artifact(msg) => write!(f, "could not retrieve result: {msg}"),
        }
    }
}

/// Lifecycle of a submitted job.
///
/// ```text
/// Created -> Submitted -> AwaitingConnection -> Executing -> Completed
///                                 \________________\______-> Failed | TimedOut
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Created,
    Submitted,
    AwaitingConnection,
    Executing,
    Completed,
    Failed(FailureReason),
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::TimedOut)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Terminal states never change, except that a completed job whose
    /// result cannot be retrieved becomes failed. `Failed` and `TimedOut`
    /// are reachable from any live state; the forward path only moves
    /// forward.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;

        if self.is_terminal() {
            return matches!(
                (self, next),
                (Completed, Failed(FailureReason::Artifact(_)))
            );
        }
        match next {
            Failed(_) | TimedOut => true,
            Created => false,
            Submitted => matches!(self, Created),
            AwaitingConnection => matches!(self, Created | Submitted),
            Executing => matches!(self, AwaitingConnection | Executing),
            Completed => matches!(self, AwaitingConnection | Executing),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::AwaitingConnection => "awaiting_connection",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A submitted job and everything observed about it so far.
#[derive(Debug, Clone)]
pub struct Job {
    /// Engine-assigned identifier (`prompt_id`).
    pub job_id: String,
    /// Caller-generated id correlating push-channel frames.
    pub client_id: String,
    pub submitted_at: Timestamp,
    pub state: JobState,
    /// Externally reported progress in `[0, 1]`.
    pub current_progress: f64,
    pub current_message: String,
    pub result_refs: Vec<ResultRef>,
}

impl Job {
    /// A job the engine has just accepted.
    pub fn submitted(job_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            client_id: client_id.into(),
            submitted_at: chrono::Utc::now(),
            state: JobState::Submitted,
            current_progress: 0.0,
            current_message: String::new(),
            result_refs: Vec::new(),
        }
    }

    /// Apply a state transition if it is legal. Returns whether it applied.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(&next) {
            tracing::debug!(
                job_id = %self.job_id,
                from = self.state.label(),
                to = next.label(),
                "Ignoring illegal job transition",
            );
            return false;
        }
        if self.state != next {
            tracing::info!(
                job_id = %self.job_id,
                from = self.state.label(),
                to = next.label(),
                "Job state changed",
            );
        }
        self.state = next;
        true
    }

    /// Append result references, skipping duplicates.
    pub fn add_results(&mut self, refs: impl IntoIterator<Item = ResultRef>) {
        for r in refs {
            if !self.result_refs.contains(&r) {
                self.result_refs.push(r);
            }
        }
    }
}
