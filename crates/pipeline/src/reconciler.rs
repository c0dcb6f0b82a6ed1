//! Progress reconciliation for one submitted job.
//!
//! The reconciler owns the [`Job`] and merges two sources of truth into
//! one monotonic progress signal:
//!
//! * the push channel, via the event listener's normalized
//!   [`ExecutionEvent`] stream, and
//! * the pull channel (queue and history polls), used only while the
//!   push channel is stale or gone.
//!
//! It stops on the first terminal state, on cancellation, or at the
//! job's time ceiling, and always shuts the listener down on exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use atelier_comfyui::api::EngineApi;
use atelier_comfyui::events::ExecutionEvent;
use atelier_comfyui::listener::ListenerHandle;
use atelier_core::job::{FailureReason, Job, JobState, ResultRef};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::progress::{
    describe_node, engine_ratio, estimate_from_elapsed, map_engine_progress, ProgressTracker,
    PHASE_COMPLETE, PHASE_EXECUTING, PHASE_IMAGE_READY, PHASE_STARTED, PHASE_SUBMITTED,
};

/// Interval of the supervising loop's liveness check.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Timing knobs of the supervising loop.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub liveness_threshold: Duration,
    pub poll_interval: Duration,
    pub job_timeout: Option<Duration>,
    pub tick: Duration,
}

impl From<&EngineConfig> for ReconcileSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            liveness_threshold: config.liveness_threshold,
            poll_interval: config.poll_interval,
            job_timeout: config.job_timeout,
            tick: DEFAULT_TICK,
        }
    }
}

/// Supervises one job from submission to a terminal state.
pub struct ProgressReconciler<'a> {
    api: Arc<dyn EngineApi>,
    settings: ReconcileSettings,
    progress: &'a mut ProgressTracker,
    started_at: Instant,
    channel_open: bool,
    last_poll: Option<Instant>,
    current_node: Option<String>,
}

impl<'a> ProgressReconciler<'a> {
    pub fn new(
        api: Arc<dyn EngineApi>,
        settings: ReconcileSettings,
        progress: &'a mut ProgressTracker,
    ) -> Self {
        Self {
            api,
            settings,
            progress,
            started_at: Instant::now(),
            channel_open: true,
            last_poll: None,
            current_node: None,
        }
    }

    /// Drive `job` until it is terminal and return it.
    pub async fn run(
        mut self,
        mut job: Job,
        mut listener: ListenerHandle,
        cancel: &CancellationToken,
    ) -> Job {
        self.started_at = Instant::now();
        job.transition(JobState::AwaitingConnection);
        self.progress
            .advance(PHASE_SUBMITTED, "Workflow submitted, connecting to the event channel");

        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Every engine round-trip below races the cancellation token.
        while !job.state.is_terminal() {
            if self.ceiling_reached() {
                if cancel.run_until_cancelled(self.final_poll(&mut job)).await.is_none() {
                    cancelled(&mut job);
                }
                break;
            }

            let mut live = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                event = listener.recv(), if self.channel_open => match event {
                    Some(event) => cancel.run_until_cancelled(self.apply(&mut job, event)).await.is_some(),
                    None => {
                        self.channel_open = false;
                        true
                    }
                },
                _ = ticker.tick() => true,
            };

            if live && !job.state.is_terminal() && self.poll_due(listener.liveness().silence()) {
                live = cancel.run_until_cancelled(self.poll(&mut job)).await.is_some();
            }
            if !live {
                cancelled(&mut job);
                break;
            }
            self.progress.tick();
        }

        listener.shutdown().await;

        job.current_progress = self.progress.current();
        job.current_message = self.progress.message().to_string();
        job
    }

    // ---- push channel ----

    async fn apply(&mut self, job: &mut Job, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Connected => {
                tracing::debug!(job_id = %job.job_id, "Event channel connected");
                if job.state == JobState::AwaitingConnection {
                    self.progress
                        .advance(PHASE_SUBMITTED, "Connected, waiting for the engine to start");
                }
            }
            ExecutionEvent::QueueStatus { queue_remaining } => {
                tracing::debug!(job_id = %job.job_id, ?queue_remaining, "Engine queue status");
            }
            ExecutionEvent::Started => {
                job.transition(JobState::Executing);
                self.progress.advance(PHASE_STARTED, "Execution started");
            }
            ExecutionEvent::Cached { nodes } => {
                job.transition(JobState::Executing);
                tracing::debug!(job_id = %job.job_id, cached = nodes.len(), "Execution used cache");
            }
            ExecutionEvent::NodeExecuting { node_id } => {
                job.transition(JobState::Executing);
                tracing::debug!(job_id = %job.job_id, node = %node_id, "Executing node");
                self.progress
                    .advance(PHASE_EXECUTING, format!("Running: {}", describe_node(&node_id)));
                self.current_node = Some(node_id);
            }
            ExecutionEvent::Progress { value, max } => {
                job.transition(JobState::Executing);
                let percent = (engine_ratio(value, max) * 100.0).round();
                let step = self
                    .current_node
                    .as_deref()
                    .map(describe_node)
                    .unwrap_or_else(|| "working".to_string());
                self.progress
                    .advance(map_engine_progress(value, max), format!("{percent}% - {step}"));
            }
            ExecutionEvent::NodeExecuted {
                node_id,
                result_refs,
            } => {
                tracing::debug!(
                    job_id = %job.job_id,
                    node = %node_id,
                    images = result_refs.len(),
                    "Node executed",
                );
                if !result_refs.is_empty() {
                    self.complete(job, result_refs, "Image ready, downloading");
                }
            }
            ExecutionEvent::ExecutionComplete => {
                tracing::info!(job_id = %job.job_id, "Execution complete");
                self.progress.advance(PHASE_COMPLETE, "Execution complete");
                if job.result_refs.is_empty() {
                    if let Some(refs) = self.history(job).await {
                        job.add_results(refs);
                    }
                }
                job.transition(JobState::Completed);
            }
            ExecutionEvent::ExecutionFailed { node_id, message } => {
                tracing::error!(
                    job_id = %job.job_id,
                    node_id = ?node_id,
                    error = %message,
                    "Engine reported an execution error",
                );
                job.transition(JobState::Failed(FailureReason::Engine { node_id, message }));
            }
            ExecutionEvent::Reconnecting {
                attempt,
                max_attempts,
            } => {
                tracing::warn!(job_id = %job.job_id, attempt, max_attempts, "Event channel lost");
                self.progress.note(format!(
                    "Connection lost, reconnecting ({attempt}/{max_attempts})"
                ));
            }
            ExecutionEvent::EndOfStream => {
                tracing::info!(job_id = %job.job_id, "Event channel ended; polling for status");
                self.channel_open = false;
            }
        }
    }

    fn complete(&mut self, job: &mut Job, refs: Vec<ResultRef>, message: &str) {
        job.add_results(refs);
        self.progress.advance(PHASE_IMAGE_READY, message);
        job.transition(JobState::Completed);
    }

    // ---- pull channel ----

    /// Whether a fallback poll should run now.
    ///
    /// Polls happen while the push channel is gone, or has been silent
    /// for the liveness threshold (counting from the start when it never
    /// produced anything), and never more often than the poll interval.
    fn poll_due(&self, silence: Option<Duration>) -> bool {
        if self
            .last_poll
            .is_some_and(|at| at.elapsed() < self.settings.poll_interval)
        {
            return false;
        }
        if !self.channel_open {
            return true;
        }
        let silent_for = silence.unwrap_or_else(|| self.started_at.elapsed());
        silent_for >= self.settings.liveness_threshold
    }

    async fn poll(&mut self, job: &mut Job) {
        self.last_poll = Some(Instant::now());
        tracing::debug!(job_id = %job.job_id, "Push channel stale; polling engine");

        match self.api.queue_state().await {
            Ok(queue) => {
                tracing::debug!(
                    job_id = %job.job_id,
                    running = queue.running,
                    pending = queue.pending,
                    "Queue state",
                );
                if queue.running && job.state == JobState::AwaitingConnection {
                    job.transition(JobState::Executing);
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "Queue poll failed");
            }
        }

        match self.history(job).await {
            Some(refs) if !refs.is_empty() => {
                tracing::info!(job_id = %job.job_id, images = refs.len(), "Found outputs in history");
                self.complete(job, refs, "Image ready (from history), downloading");
            }
            _ if job.state == JobState::Executing => {
                self.progress.advance(
                    estimate_from_elapsed(self.started_at.elapsed()),
                    "Generating image (polling)",
                );
            }
            _ => {}
        }
    }

    /// History outputs for the job; absorbs transport errors.
    async fn history(&self, job: &Job) -> Option<Vec<ResultRef>> {
        match self.api.history(&job.job_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "History poll failed");
                None
            }
        }
    }

    fn ceiling_reached(&self) -> bool {
        self.settings
            .job_timeout
            .is_some_and(|limit| self.started_at.elapsed() >= limit)
    }

    /// Last chance at the ceiling: completed if history has outputs,
    /// timed out otherwise.
    async fn final_poll(&mut self, job: &mut Job) {
        tracing::warn!(job_id = %job.job_id, "Job reached its time ceiling; checking history once more");
        match self.history(job).await {
            Some(refs) if !refs.is_empty() => {
                self.complete(job, refs, "Image ready (from history), downloading");
            }
            _ => {
                job.transition(JobState::TimedOut);
                self.progress
                    .note("Timed out waiting for the engine, looking for a saved image");
            }
        }
    }
}

fn cancelled(job: &mut Job) {
    tracing::info!(job_id = %job.job_id, "Job cancelled by caller");
    job.transition(JobState::Failed(FailureReason::Cancelled));
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use atelier_comfyui::api::{ComfyUIApiError, QueueState, SubmitResponse};
    use atelier_comfyui::listener::Liveness;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use crate::progress::{ProgressCallback, ProgressUpdate};

    /// Engine whose history becomes available after a given number of
    /// lookups (never, when `None`).
    struct ScriptedEngine {
        running: bool,
        history_after: Option<usize>,
        outputs: Vec<ResultRef>,
        history_calls: AtomicUsize,
        history_delay: Duration,
    }

    impl ScriptedEngine {
        fn silent() -> Self {
            Self {
                running: false,
                history_after: None,
                outputs: vec![],
                history_calls: AtomicUsize::new(0),
                history_delay: Duration::ZERO,
            }
        }

        fn with_history(after: usize, outputs: Vec<ResultRef>) -> Self {
            Self {
                running: true,
                history_after: Some(after),
                outputs,
                history_calls: AtomicUsize::new(0),
                history_delay: Duration::ZERO,
            }
        }

        /// History that answers only after `delay`.
        fn slow_history(mut self, delay: Duration) -> Self {
            self.history_delay = delay;
            self
        }
    }

    #[async_trait]
    impl EngineApi for ScriptedEngine {
        async fn submit(&self, _: &Value, _: &str) -> Result<SubmitResponse, ComfyUIApiError> {
            unreachable!()
        }
        async fn queue_state(&self) -> Result<QueueState, ComfyUIApiError> {
            Ok(QueueState {
                running: self.running,
                pending: 0,
            })
        }
        async fn history(&self, _: &str) -> Result<Option<Vec<ResultRef>>, ComfyUIApiError> {
            let call = self.history_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.history_delay).await;
            match self.history_after {
                Some(after) if call >= after => Ok(Some(self.outputs.clone())),
                _ => Ok(None),
            }
        }
        async fn view(&self, _: &ResultRef) -> Result<Vec<u8>, ComfyUIApiError> {
            unreachable!()
        }
    }

    fn settings(liveness_ms: u64, poll_ms: u64, timeout_ms: Option<u64>) -> ReconcileSettings {
        ReconcileSettings {
            liveness_threshold: Duration::from_millis(liveness_ms),
            poll_interval: Duration::from_millis(poll_ms),
            job_timeout: timeout_ms.map(Duration::from_millis),
            tick: Duration::from_millis(10),
        }
    }

    fn recording_tracker() -> (ProgressTracker, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |u: &ProgressUpdate| {
            sink.lock().unwrap().push(u.value);
        });
        (ProgressTracker::new(Duration::ZERO, Some(callback)), seen)
    }

    /// A listener that replays `events` and then stays open (silent)
    /// for as long as the returned sender lives.
    fn scripted(events: Vec<ExecutionEvent>) -> (ListenerHandle, mpsc::Sender<ExecutionEvent>) {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(event).unwrap();
        }
        let liveness = Arc::new(Liveness::new());
        liveness.touch();
        (ListenerHandle::from_channel(rx, liveness), tx)
    }

    fn image(name: &str) -> ResultRef {
        ResultRef::output(name, "")
    }

    #[tokio::test]
    async fn happy_path_completes_on_executed_image() {
        let (mut tracker, seen) = recording_tracker();
        let api = Arc::new(ScriptedEngine::silent());
        let reconciler = ProgressReconciler::new(api, settings(60_000, 60_000, None), &mut tracker);

        let mut events = vec![ExecutionEvent::Connected, ExecutionEvent::Started];
        events.extend((5..=20).step_by(5).map(|v| ExecutionEvent::Progress { value: v, max: 20 }));
        events.push(ExecutionEvent::NodeExecuted {
            node_id: "9".into(),
            result_refs: vec![image("out.png")],
        });

        let (listener, _tx) = scripted(events);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result_refs, vec![image("out.png")]);
        assert!((job.current_progress - PHASE_IMAGE_READY).abs() < 1e-9);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {seen:?}");
    }

    #[tokio::test]
    async fn stale_events_never_regress_progress() {
        let (mut tracker, seen) = recording_tracker();
        let api = Arc::new(ScriptedEngine::silent());
        let reconciler = ProgressReconciler::new(api, settings(60_000, 60_000, None), &mut tracker);

        let events = vec![
            ExecutionEvent::Started,
            ExecutionEvent::Progress { value: 15, max: 20 },
            ExecutionEvent::Reconnecting { attempt: 1, max_attempts: 3 },
            ExecutionEvent::Connected,
            ExecutionEvent::NodeExecuting { node_id: "7".into() },
            ExecutionEvent::Progress { value: 2, max: 20 },
            ExecutionEvent::ExecutionComplete,
        ];

        let (listener, _tx) = scripted(events);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_eq!(job.state, JobState::Completed);
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {seen:?}");
        assert_eq!(*seen.last().unwrap(), PHASE_COMPLETE);
    }

    #[tokio::test]
    async fn completion_without_refs_consults_history_once() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(ScriptedEngine::with_history(0, vec![image("h.png")]));
        let reconciler =
            ProgressReconciler::new(api.clone(), settings(60_000, 60_000, None), &mut tracker);

        let (listener, _tx) =
            scripted(vec![ExecutionEvent::Started, ExecutionEvent::ExecutionComplete]);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result_refs, vec![image("h.png")]);
        assert_eq!(api.history_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn end_of_stream_falls_back_to_history() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(ScriptedEngine::with_history(1, vec![image("late.png")]));
        let reconciler = ProgressReconciler::new(api, settings(60_000, 20, Some(5_000)), &mut tracker);

        let (listener, _tx) = scripted(vec![ExecutionEvent::Started, ExecutionEvent::EndOfStream]);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result_refs, vec![image("late.png")]);
    }

    #[tokio::test]
    async fn silent_channel_triggers_polling_and_queue_confirms_start() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(ScriptedEngine::with_history(2, vec![image("p.png")]));
        let reconciler = ProgressReconciler::new(api, settings(30, 20, Some(5_000)), &mut tracker);

        // Channel stays open but never says anything.
        let (listener, _tx) = scripted(vec![]);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result_refs, vec![image("p.png")]);
    }

    #[tokio::test]
    async fn total_silence_times_out() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(ScriptedEngine::silent());
        let reconciler = ProgressReconciler::new(api, settings(20, 20, Some(150)), &mut tracker);

        let (listener, _tx) = scripted(vec![]);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_eq!(job.state, JobState::TimedOut);
        assert!(job.result_refs.is_empty());
    }

    #[tokio::test]
    async fn execution_error_fails_the_job() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(ScriptedEngine::silent());
        let reconciler = ProgressReconciler::new(api, settings(60_000, 60_000, None), &mut tracker);

        let (listener, _tx) = scripted(vec![
            ExecutionEvent::Started,
            ExecutionEvent::ExecutionFailed {
                node_id: Some("7".into()),
                message: "CUDA out of memory".into(),
            },
        ]);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_matches!(
            job.state,
            JobState::Failed(FailureReason::Engine { node_id: Some(ref n), .. }) if n == "7"
        );
    }

    #[tokio::test]
    async fn cancellation_marks_job_failed() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(ScriptedEngine::silent());
        let reconciler = ProgressReconciler::new(api, settings(60_000, 60_000, None), &mut tracker);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (listener, _tx) = scripted(vec![ExecutionEvent::Started]);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &cancel)
            .await;

        assert_eq!(job.state, JobState::Failed(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn quiet_engine_still_reports_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |u: &ProgressUpdate| {
            sink.lock().unwrap().push(u.value);
        });
        let mut tracker = ProgressTracker::new(Duration::from_millis(50), Some(callback));
        let api = Arc::new(ScriptedEngine::silent());
        let reconciler =
            ProgressReconciler::new(api, settings(60_000, 60_000, Some(500)), &mut tracker);

        let (listener, _tx) = scripted(vec![ExecutionEvent::Started]);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_eq!(job.state, JobState::TimedOut);
        let seen = seen.lock().unwrap();
        // One submitted/started report, then roughly one repeat per 50ms.
        assert!(seen.len() >= 5, "too few progress reports: {seen:?}");
        assert!(seen.iter().skip(1).all(|v| *v == PHASE_STARTED));
    }

    #[tokio::test]
    async fn cancel_interrupts_slow_history_after_completion() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(
            ScriptedEngine::with_history(0, vec![image("h.png")])
                .slow_history(Duration::from_secs(30)),
        );
        let reconciler = ProgressReconciler::new(api, settings(60_000, 60_000, None), &mut tracker);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let (listener, _tx) =
            scripted(vec![ExecutionEvent::Started, ExecutionEvent::ExecutionComplete]);
        let job = tokio::time::timeout(
            Duration::from_secs(5),
            reconciler.run(Job::submitted("J1", "c1"), listener, &cancel),
        )
        .await
        .expect("cancellation should not wait for the history lookup");

        assert_eq!(job.state, JobState::Failed(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn cancel_interrupts_slow_fallback_poll() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(ScriptedEngine::silent().slow_history(Duration::from_secs(30)));
        let reconciler = ProgressReconciler::new(api.clone(), settings(20, 20, None), &mut tracker);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let (listener, _tx) = scripted(vec![]);
        let job = tokio::time::timeout(
            Duration::from_secs(5),
            reconciler.run(Job::submitted("J1", "c1"), listener, &cancel),
        )
        .await
        .expect("cancellation should not wait for the poll");

        assert_eq!(job.state, JobState::Failed(FailureReason::Cancelled));
        assert_eq!(api.history_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn huge_step_counters_are_clamped() {
        let (mut tracker, _) = recording_tracker();
        let api = Arc::new(ScriptedEngine::silent());
        let reconciler = ProgressReconciler::new(api, settings(60_000, 60_000, None), &mut tracker);

        let (listener, _tx) = scripted(vec![
            ExecutionEvent::Started,
            ExecutionEvent::Progress {
                value: u32::MAX,
                max: u32::MAX,
            },
            ExecutionEvent::ExecutionFailed {
                node_id: None,
                message: "stopped".into(),
            },
        ]);
        let job = reconciler
            .run(Job::submitted("J1", "c1"), listener, &CancellationToken::new())
            .await;

        assert_matches!(job.state, JobState::Failed(FailureReason::Engine { .. }));
        assert!((job.current_progress - PHASE_IMAGE_READY).abs() < 1e-9);
        assert!(job.current_message.starts_with("100%"));
    }

    #[test]
    fn poll_is_not_due_while_channel_is_fresh() {
        let mut tracker = ProgressTracker::new(Duration::ZERO, None);
        let reconciler = ProgressReconciler::new(
            Arc::new(ScriptedEngine::silent()),
            settings(15_000, 5_000, None),
            &mut tracker,
        );
        assert!(!reconciler.poll_due(Some(Duration::from_secs(1))));
        assert!(reconciler.poll_due(Some(Duration::from_secs(16))));
    }
}
