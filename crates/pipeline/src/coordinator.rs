//! Single entry point for running one generation job end to end.
//!
//! bind -> pre-submission hook -> submit -> reconcile -> fetch, with the
//! fallback disk scan as the last resort. Every failure is folded into
//! the returned [`JobOutcome`]; nothing here returns an error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use atelier_comfyui::api::{ComfyUIApi, ComfyUIApiError, EngineApi};
use atelier_comfyui::client::ComfyUIClient;
use atelier_comfyui::listener::EventListener;
use atelier_core::job::{FailureReason, Job, JobState};
use atelier_core::params::{ParameterRecord, SEED_PARAM};
use atelier_core::variant::WorkflowVariant;
use atelier_core::workflow::WorkflowGraph;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactFetcher;
use crate::config::EngineConfig;
use crate::fallback::{scan_order, DiskScanner, OutputScanner};
use crate::progress::{ProgressCallback, ProgressTracker, PHASE_CONNECTING, PHASE_DONE};
use crate::reconciler::{ProgressReconciler, ReconcileSettings};

/// Everything needed to run one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub variant: WorkflowVariant,
    /// Canonical template; never mutated.
    pub graph: WorkflowGraph,
    pub params: ParameterRecord,
    pub input_image: Option<PathBuf>,
    /// Draw a fresh `noise_seed` instead of using the record's value.
    pub randomize_seed: bool,
}

impl JobRequest {
    pub fn new(variant: WorkflowVariant, graph: WorkflowGraph, params: ParameterRecord) -> Self {
        Self {
            variant,
            graph,
            params,
            input_image: None,
            randomize_seed: false,
        }
    }

    pub fn with_input_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_image = Some(path.into());
        self
    }

    pub fn with_random_seed(mut self) -> Self {
        self.randomize_seed = true;
        self
    }
}

/// Caller-facing result classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// The engine's own result was retrieved.
    Done,
    /// No result reference was usable; a recent file on disk was used.
    RecoveredViaFallback,
    /// The job ended without any retrievable image.
    NoImageFound,
    /// The job failed; carries a human-readable reason.
    Failed(String),
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str("done"),
            Self::RecoveredViaFallback => f.write_str("recovered via fallback scan"),
            Self::NoImageFound => f.write_str("no image found"),
            Self::Failed(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Final result of [`JobCoordinator::run`].
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Engine job id, when submission got that far.
    pub job_id: Option<String>,
    pub state: JobState,
    /// Local artifact paths, in result order.
    pub paths: Vec<PathBuf>,
    pub status: JobStatus,
    /// Seed actually submitted, if the record carried one.
    pub seed: Option<i64>,
}

impl JobOutcome {
    pub fn primary_path(&self) -> Option<&Path> {
        self.paths.first().map(PathBuf::as_path)
    }

    fn failed(job_id: Option<String>, reason: FailureReason, seed: Option<i64>) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed(reason.to_string()),
            state: JobState::Failed(reason),
            paths: Vec::new(),
            seed,
        }
    }
}

/// Runs jobs against one engine instance. Cheap to share; every call to
/// [`run`](Self::run) owns its own graph copy, client id and listener.
pub struct JobCoordinator {
    api: Arc<dyn EngineApi>,
    listener: EventListener,
    scanner: Arc<dyn OutputScanner>,
    config: EngineConfig,
}

impl JobCoordinator {
    /// Build a coordinator talking HTTP and WebSocket to `config.server`.
    pub fn new(config: EngineConfig) -> Result<Self, ComfyUIApiError> {
        let api = ComfyUIApi::new(config.api_url(), config.request_timeout)?;
        let listener = EventListener::new(ComfyUIClient::for_server(&config.server), config.reconnect());
        Ok(Self::with_parts(Arc::new(api), listener, config))
    }

    pub fn with_parts(api: Arc<dyn EngineApi>, listener: EventListener, config: EngineConfig) -> Self {
        Self {
            api,
            listener,
            scanner: Arc::new(DiskScanner),
            config,
        }
    }

    /// Replace the filesystem fallback scan.
    pub fn with_scanner(mut self, scanner: Arc<dyn OutputScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one job to completion. Never fails; see [`JobOutcome`].
    pub async fn run(
        &self,
        request: JobRequest,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let mut progress = ProgressTracker::new(self.config.progress_interval, on_progress);
        progress.advance(PHASE_CONNECTING, "Connecting to ComfyUI");

        let outcome = self.execute(request, &mut progress, cancel).await;

        let message = match &outcome.status {
            JobStatus::Done => "Done".to_string(),
            JobStatus::RecoveredViaFallback => "Recovered the latest saved image".to_string(),
            JobStatus::NoImageFound => "No image found".to_string(),
            JobStatus::Failed(msg) => format!("Error: {msg}"),
        };
        progress.advance(PHASE_DONE, message);
        progress.flush();

        tracing::info!(
            job_id = ?outcome.job_id,
            state = outcome.state.label(),
            status = %outcome.status,
            images = outcome.paths.len(),
            "Job finished",
        );
        outcome
    }

    async fn execute(
        &self,
        request: JobRequest,
        progress: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let JobRequest {
            variant,
            graph: template,
            mut params,
            input_image,
            randomize_seed,
        } = request;

        // ---- bind ----

        variant.normalize_params(&mut params);
        if randomize_seed {
            let seed = params.randomize_seed();
            tracing::info!(seed, "Using a fresh random seed");
        }
        let seed = params.get(SEED_PARAM).and_then(|v| v.as_i64());

        let mut graph = variant.bind(&template, &params);
        if let Err(e) = variant.prepare_input(&mut graph, input_image.as_deref()) {
            tracing::error!(variant = %variant, error = %e, "Job rejected before submission");
            return JobOutcome::failed(None, FailureReason::Invalid(e.to_string()), seed);
        }

        // ---- submit ----

        let client_id = uuid::Uuid::new_v4().to_string();
        let workflow = graph.to_value();
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return JobOutcome::failed(None, FailureReason::Cancelled, seed);
            }
            result = self.api.submit(&workflow, &client_id) => result,
        };

        let response = match submitted {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(variant = %variant, error = %e, "Workflow submission failed");
                let reason = match e {
                    ComfyUIApiError::ApiError { status, body } => {
                        FailureReason::Submission { status, body }
                    }
                    other => FailureReason::Transport(other.to_string()),
                };
                return JobOutcome::failed(None, reason, seed);
            }
        };

        tracing::info!(
            job_id = %response.prompt_id,
            client_id = %client_id,
            queue_position = response.number,
            variant = %variant,
            "Workflow submitted",
        );
        let job = Job::submitted(response.prompt_id, client_id);

        // ---- reconcile ----

        let listener = self.listener.spawn(job.client_id.clone(), job.job_id.clone(), cancel);
        let reconciler = ProgressReconciler::new(
            Arc::clone(&self.api),
            ReconcileSettings::from(&self.config),
            progress,
        );
        let job = reconciler.run(job, listener, cancel).await;

        // ---- retrieve ----

        self.retrieve(job, &graph, seed).await
    }

    /// Turn a terminal job into an outcome, fetching its artifacts or
    /// falling back to the disk scan.
    async fn retrieve(&self, mut job: Job, graph: &WorkflowGraph, seed: Option<i64>) -> JobOutcome {
        let job_id = Some(job.job_id.clone());

        match &job.state {
            JobState::Completed if !job.result_refs.is_empty() => {}
            JobState::Completed | JobState::TimedOut => {
                let (paths, status) = match self.fallback_scan(&job, graph).await {
                    Some(path) => (vec![path], JobStatus::RecoveredViaFallback),
                    None => (Vec::new(), JobStatus::NoImageFound),
                };
                return JobOutcome {
                    job_id,
                    state: job.state,
                    paths,
                    status,
                    seed,
                };
            }
            JobState::Failed(reason) => {
                return JobOutcome::failed(job_id, reason.clone(), seed);
            }
            other => {
                // The reconciler only returns terminal jobs.
                tracing::error!(job_id = %job.job_id, state = other.label(), "Job ended in a live state");
                return JobOutcome::failed(
                    job_id,
                    FailureReason::Transport(format!("job ended while {}", other.label())),
                    seed,
                );
            }
        }

        let fetcher = ArtifactFetcher::new(Arc::clone(&self.api), &self.config.output_dir);
        let mut paths = Vec::new();
        let mut last_error = None;
        for (index, result) in job.result_refs.iter().enumerate() {
            match fetcher.fetch(&job.job_id, index, result).await {
                Ok(path) => paths.push(path),
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.job_id,
                        filename = %result.filename,
                        error = %e,
                        "Failed to retrieve artifact",
                    );
                    last_error = Some(e);
                }
            }
        }

        if !paths.is_empty() {
            return JobOutcome {
                job_id,
                state: job.state,
                paths,
                status: JobStatus::Done,
                seed,
            };
        }

        if let Some(path) = self.fallback_scan(&job, graph).await {
            return JobOutcome {
                job_id,
                state: job.state,
                paths: vec![path],
                status: JobStatus::RecoveredViaFallback,
                seed,
            };
        }

        let message = last_error.map_or_else(|| "no artifact".to_string(), |e| e.to_string());
        job.transition(JobState::Failed(FailureReason::Artifact(message)));
        match job.state {
            JobState::Failed(reason) => JobOutcome::failed(job_id, reason, seed),
            state => JobOutcome {
                job_id,
                state,
                paths: Vec::new(),
                status: JobStatus::NoImageFound,
                seed,
            },
        }
    }

    /// Newest image written since submission in the known output folders.
    async fn fallback_scan(&self, job: &Job, graph: &WorkflowGraph) -> Option<PathBuf> {
        let dirs = scan_order(graph, &self.config.fallback_dirs);
        let since = SystemTime::from(job.submitted_at);
        tracing::warn!(
            job_id = %job.job_id,
            state = job.state.label(),
            dirs = dirs.len(),
            "No result retrieved from the engine; scanning output folders",
        );

        let scanner = Arc::clone(&self.scanner);
        match tokio::task::spawn_blocking(move || scanner.latest_image(&dirs, since)).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Fallback scan panicked");
                None
            }
        }
    }
}
