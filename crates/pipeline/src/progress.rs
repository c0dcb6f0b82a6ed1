//! Progress mapping and throttled reporting.
//!
//! Engine progress is mapped onto a fixed sub-range of the reported
//! value so that submission and connection overhead always occupy the
//! leading part of the bar and finalization the trailing part.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller-supplied progress sink.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

// ---- phase values ----

pub const PHASE_CONNECTING: f64 = 0.10;
pub const PHASE_SUBMITTED: f64 = 0.15;
pub const PHASE_STARTED: f64 = 0.20;
pub const PHASE_EXECUTING: f64 = 0.25;
pub const PHASE_IMAGE_READY: f64 = 0.90;
pub const PHASE_COMPLETE: f64 = 0.95;
pub const PHASE_DONE: f64 = 1.0;

/// Upper bound of the elapsed-time estimate used while polling.
const POLL_ESTIMATE_CEILING: f64 = 0.80;
/// Expected job duration the elapsed-time estimate is scaled against.
const POLL_ESTIMATE_HORIZON: Duration = Duration::from_secs(300);

/// One progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Value in `[0, 1]`.
    pub value: f64,
    pub message: String,
}

/// Completed fraction of an engine step counter, clamped to `[0, 1]`.
pub fn engine_ratio(value: u32, max: u32) -> f64 {
    if max == 0 {
        return 0.0;
    }
    (f64::from(value) / f64::from(max)).clamp(0.0, 1.0)
}

/// Map raw engine progress onto the executing sub-range (0.25..=0.90).
pub fn map_engine_progress(value: u32, max: u32) -> f64 {
    PHASE_EXECUTING + engine_ratio(value, max) * (PHASE_IMAGE_READY - PHASE_EXECUTING)
}

/// Estimate progress from elapsed time when only polling is available.
pub fn estimate_from_elapsed(elapsed: Duration) -> f64 {
    let fraction = elapsed.as_secs_f64() / POLL_ESTIMATE_HORIZON.as_secs_f64();
    (PHASE_EXECUTING + fraction * (POLL_ESTIMATE_CEILING - PHASE_EXECUTING))
        .min(POLL_ESTIMATE_CEILING)
}

/// Human-readable description of a well-known template node.
pub fn describe_node(node_id: &str) -> String {
    let known = match node_id {
        "2" => "decoding image",
        "3" => "saving image",
        "4" => "loading VAE model",
        "5" => "loading CLIP model",
        "6" => "loading UNET model",
        "7" => "sampling",
        "11" => "generating noise",
        "12" => "loading LoRA models",
        "14" => "encoding prompt",
        "20" => "processing text",
        other => return format!("node {other}"),
    };
    known.to_string()
}

/// Monotonic progress state with rate-limited emission.
///
/// Lower values are ignored together with their message, so stale
/// events can never move the reported progress backwards.
pub struct ProgressTracker {
    current: f64,
    message: String,
    interval: Duration,
    last_emit: Option<Instant>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(interval: Duration, callback: Option<ProgressCallback>) -> Self {
        Self {
            current: 0.0,
            message: String::new(),
            interval,
            last_emit: None,
            callback,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Raise progress to `value`. Returns `false` (and changes nothing)
    /// when `value` is below the current progress.
    pub fn advance(&mut self, value: f64, message: impl Into<String>) -> bool {
        let value = value.clamp(0.0, 1.0);
        if value < self.current {
            return false;
        }
        self.current = value;
        self.message = message.into();
        self.tick();
        true
    }

    /// Replace the message without moving the value.
    pub fn note(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.tick();
    }

    /// Emit the current state if the rate limit allows.
    ///
    /// Called on every loop turn, so an unchanged value is re-sent once
    /// per interval while the engine is quiet.
    pub fn tick(&mut self) {
        let due = self
            .last_emit
            .map_or(true, |at| at.elapsed() >= self.interval);
        if due {
            self.emit();
        }
    }

    /// Emit the current state regardless of the rate limit.
    pub fn flush(&mut self) {
        self.emit();
    }

    fn emit(&mut self) {
        self.last_emit = Some(Instant::now());
        if let Some(callback) = &self.callback {
            callback(&ProgressUpdate {
                value: self.current,
                message: self.message.clone(),
            });
        }
    }
}
