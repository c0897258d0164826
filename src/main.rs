use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use catalog_sync::config::{AppConfig, ImportConfig};
use catalog_sync::error::JobError;
use catalog_sync::live::{LiveChannel, LiveState, job_snapshot, live_routes};
use catalog_sync::registry::{HttpRegistryClient, RegistryClient};
use catalog_sync::runner::JobService;
use catalog_sync::store::LibSqlBackend;

/// Capacity of the live-update broadcast channel.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "catalog-sync")]
#[command(version)]
#[command(about = "Import and synchronize the bibliographic catalog from the national registry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a pending import job and print its id.
    Start {
        /// JSON import configuration; defaults apply to omitted fields.
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "cli")]
        owner: String,

        /// Run the job right away instead of leaving it pending.
        #[arg(long, action)]
        run: bool,
    },
    /// Run pending jobs to completion, one task per job.
    Run {
        #[arg(required = true)]
        job_ids: Vec<Uuid>,

        /// Also serve the live dashboard routes while the jobs run.
        #[arg(long, action)]
        serve: bool,
    },
    Cancel {
        job_id: Uuid,
    },
    Pause {
        job_id: Uuid,
    },
    Resume {
        job_id: Uuid,
    },
    /// Show a job record, or the most recent jobs.
    Status {
        job_id: Option<Uuid>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print a job's log, oldest first.
    Logs {
        job_id: Uuid,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Serve the live dashboard routes.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("Failed to read configuration")?;

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Registry ─────────────────────────────────────────────────────────
    let client: Option<Arc<dyn RegistryClient>> = match config.registry.clone() {
        Some(registry) => {
            let base_url = registry.base_url.clone();
            let client = HttpRegistryClient::new(registry).context("Failed to build registry client")?;
            tracing::info!(url = %base_url, "Registry client configured");
            Some(Arc::new(client))
        }
        None => None,
    };

    let live = LiveChannel::new(LIVE_CHANNEL_CAPACITY);
    let service = JobService::with_backend(db, client, live, config.pipeline.clone());

    match cli.command {
        Command::Start { config: path, owner, run } => {
            let import = match path {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    ImportConfig::from_json(&raw)?
                }
                None => ImportConfig::default(),
            };
            let job = service.start(&owner, import).await?;
            println!("{}", job.id);
            if run {
                let outcome = service.run(job.id).await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
        }
        Command::Run { job_ids, serve } => {
            if serve {
                spawn_server(&service, config.ws_port).await?;
            }
            let handles = job_ids.iter().map(|id| service.spawn(*id));
            let mut failed = 0;
            for (job_id, joined) in job_ids.iter().zip(futures::future::join_all(handles).await) {
                match joined.context("Job task panicked")? {
                    Ok(outcome) => {
                        println!("{job_id}: {}", outcome.status.as_str());
                        if !outcome.is_success() {
                            failed += 1;
                        }
                    }
                    Err(e) => {
                        eprintln!("{job_id}: {e}");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} of {} jobs did not complete", job_ids.len());
            }
        }
        Command::Cancel { job_id } => {
            service.cancel(job_id).await?;
            println!("{job_id}: cancellation requested");
        }
        Command::Pause { job_id } => {
            service.pause(job_id).await?;
            println!("{job_id}: paused");
        }
        Command::Resume { job_id } => {
            service.resume(job_id).await?;
            println!("{job_id}: resumed");
        }
        Command::Status { job_id: Some(job_id), .. } => {
            let body = job_snapshot(service.store().as_ref(), job_id)
                .await?
                .ok_or(JobError::NotFound { id: job_id })?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Status { job_id: None, limit } => {
            for job in service.list(limit).await? {
                println!(
                    "{}  {:<9}  {:>3}%  {}  {}",
                    job.id,
                    job.status.as_str(),
                    job.overall_progress(),
                    job.started_at.format("%Y-%m-%d %H:%M"),
                    job.current_step
                );
            }
        }
        Command::Logs { job_id, limit } => {
            for entry in service.logs(job_id, limit).await? {
                println!(
                    "{} [{}] {}: {}",
                    entry.timestamp.format("%H:%M:%S"),
                    entry.level,
                    entry.step,
                    entry.message
                );
            }
        }
        Command::Serve => {
            let listener = bind(config.ws_port).await?;
            axum::serve(listener, router(&service)).await?;
        }
    }

    Ok(())
}

fn router(service: &JobService) -> axum::Router {
    live_routes(LiveState {
        store: Arc::clone(service.store()),
        live: service.live().clone(),
    })
    .layer(CorsLayer::permissive())
}

async fn bind(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind live server port {port}"))?;
    tracing::info!(port, "Live update server started");
    eprintln!("   Live WS: ws://0.0.0.0:{port}/ws/jobs/{{job_id}}");
    eprintln!("   Job API: http://0.0.0.0:{port}/api/jobs/{{job_id}}");
    Ok(listener)
}

async fn spawn_server(service: &JobService, port: u16) -> anyhow::Result<()> {
    let listener = bind(port).await?;
    let app = router(service);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Live update server stopped");
        }
    });
    Ok(())
}
