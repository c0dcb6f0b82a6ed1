use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use atelier_core::params::ParameterRecord;
use atelier_core::variant::WorkflowVariant;
use atelier_core::workflow::WorkflowGraph;
use atelier_pipeline::config::EngineConfig;
use atelier_pipeline::coordinator::{JobCoordinator, JobRequest, JobStatus};
use atelier_pipeline::progress::{ProgressCallback, ProgressUpdate};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Submit ComfyUI workflows and collect the generated images")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind parameters into a template, run it and download the result
    Run {
        /// Workflow variant (txt2img, img2img, three-views)
        #[arg(short, long)]
        variant: WorkflowVariant,

        /// Workflow template (API-format JSON)
        #[arg(short, long)]
        template: PathBuf,

        /// Parameter file (JSON object of name -> value)
        #[arg(short, long)]
        params: Option<PathBuf>,

        /// Input image for image-to-image workflows
        #[arg(long)]
        input_image: Option<PathBuf>,

        /// Draw a fresh noise seed instead of the one in the parameters
        #[arg(long)]
        random_seed: bool,
    },

    /// Print the parameters currently set in a template
    Params {
        #[arg(short, long)]
        variant: WorkflowVariant,

        #[arg(short, long)]
        template: PathBuf,
    },

    /// Write a template with parameters bound, without submitting it
    Bind {
        #[arg(short, long)]
        variant: WorkflowVariant,

        #[arg(short, long)]
        template: PathBuf,

        #[arg(short, long)]
        params: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match dispatch(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            variant,
            template,
            params,
            input_image,
            random_seed,
        } => {
            let graph = WorkflowGraph::load(&template)?;
            let params = match params {
                Some(path) => load_params(&path)?,
                None => variant.extract(&graph),
            };

            let mut request = JobRequest::new(variant, graph, params);
            if let Some(path) = input_image {
                request = request.with_input_image(path);
            }
            if random_seed {
                request = request.with_random_seed();
            }
            run(request).await
        }
        Commands::Params { variant, template } => {
            let graph = WorkflowGraph::load(&template)?;
            let record = variant.extract(&graph);
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Bind {
            variant,
            template,
            params,
            output,
        } => {
            let graph = WorkflowGraph::load(&template)?;
            let mut params = load_params(&params)?;
            variant.normalize_params(&mut params);
            variant.bind(&graph, &params).save(&output)?;
            tracing::info!(output = %output.display(), "Bound workflow written");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(request: JobRequest) -> Result<ExitCode> {
    let config = EngineConfig::from_env().context("loading engine configuration")?;
    tracing::info!(server = %config.server, variant = %request.variant, "Starting job");
    let coordinator = JobCoordinator::new(config).context("building engine client")?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling job");
            on_ctrl_c.cancel();
        }
    });

    let on_progress: ProgressCallback = Arc::new(|update: &ProgressUpdate| {
        tracing::info!(progress = format!("{:.0}%", update.value * 100.0), "{}", update.message);
    });

    let outcome = coordinator.run(request, Some(on_progress), &cancel).await;

    println!("status: {}", outcome.status);
    if let Some(job_id) = &outcome.job_id {
        println!("job: {job_id}");
    }
    if let Some(seed) = outcome.seed {
        println!("seed: {seed}");
    }
    for path in &outcome.paths {
        println!("image: {}", path.display());
    }

    Ok(match outcome.status {
        JobStatus::Done | JobStatus::RecoveredViaFallback => ExitCode::SUCCESS,
        JobStatus::NoImageFound | JobStatus::Failed(_) => ExitCode::FAILURE,
    })
}

fn load_params(path: &Path) -> Result<ParameterRecord> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading parameters from {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing parameters in {}", path.display()))
}
