//! Normalized events produced by the event listener.
//!
//! The engine's wire format is inconsistent (payload nested under `data`
//! or placed top-level, completion signalled several ways). Everything
//! downstream of the listener only ever sees these variants.

use atelier_core::job::ResultRef;

/// One normalized event for a single job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// The push channel is open (initially or after a reconnect).
    Connected,

    /// Queue status broadcast; carries no job identity.
    QueueStatus { queue_remaining: Option<i64> },

    /// The engine started executing the job.
    Started,

    /// Nodes whose outputs were served from cache.
    Cached { nodes: Vec<String> },

    /// A node began executing.
    NodeExecuting { node_id: String },

    /// Step-level progress within the running node.
    Progress { value: u32, max: u32 },

    /// A node finished; `result_refs` holds any images it produced.
    NodeExecuted {
        node_id: String,
        result_refs: Vec<ResultRef>,
    },

    /// The whole job finished.
    ExecutionComplete,

    /// The engine reported an execution error.
    ExecutionFailed {
        node_id: Option<String>,
        message: String,
    },

    /// The connection dropped mid-execution and a reconnect is underway.
    Reconnecting { attempt: u32, max_attempts: u32 },

    /// The listener has stopped; no further events will follow.
    EndOfStream,
}

impl ExecutionEvent {
    /// Whether this event ends the job from the push channel's point of view.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::ExecutionComplete | Self::ExecutionFailed { .. } => true,
            Self::NodeExecuted { result_refs, .. } => !result_refs.is_empty(),
            _ => false,
        }
    }

    /// Whether this event proves the job is executing.
    pub fn marks_started(&self) -> bool {
        matches!(
            self,
            Self::Started
                | Self::Cached { .. }
                | Self::NodeExecuting { .. }
                | Self::Progress { .. }
                | Self::NodeExecuted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executed_without_images_is_not_terminal() {
        let ev = ExecutionEvent::NodeExecuted {
            node_id: "9".into(),
            result_refs: vec![],
        };
        assert!(!ev.is_terminal());
        assert!(ev.marks_started());
    }

    #[test]
    fn executed_with_images_is_terminal() {
        let ev = ExecutionEvent::NodeExecuted {
            node_id: "9".into(),
            result_refs: vec![ResultRef::output("a.png", "")],
        };
        assert!(ev.is_terminal());
    }

    #[test]
    fn lifecycle_events_do_not_mark_start() {
        assert!(!ExecutionEvent::Connected.marks_started());
        assert!(!ExecutionEvent::EndOfStream.marks_started());
        assert!(!ExecutionEvent::QueueStatus { queue_remaining: Some(1) }.marks_started());
    }
}
