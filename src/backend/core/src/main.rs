//! Floodgate worker - main entry point.
//!
//! Runs the delayed promoter and a worker pool against one queue until
//! Ctrl-C or SIGTERM.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;

use floodgate_core::{
    config::Config,
    jobs::{Job, JobHandler, JobQueue, JobWorker},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "floodgate-worker", version, about = "Rate-limited job queue worker")]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment variables override it
    #[arg(short, long, env = "FLOODGATE_CONFIG")]
    config: Option<String>,

    /// Keep jobs in process memory instead of Redis
    #[arg(long)]
    in_memory: bool,
}

/// Handler that logs each job and completes it.
struct LoggingHandler;

#[async_trait]
impl JobHandler for LoggingHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        tracing::info!(
            job_id = %job.id,
            enqueued_at = %job.enqueued_at,
            payload = %job.payload,
            "Processing job"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %config.queue.name,
        rate_limited = config.limiter.is_some(),
        "Starting Floodgate worker"
    );

    let mut builder = JobQueue::builder(config.queue.clone());
    if !(args.in_memory || config.redis.in_memory) {
        let client = redis::Client::open(config.redis.url.as_str())
            .map_err(|e| anyhow::anyhow!("Failed to create Redis client: {}", e))?;
        tracing::info!(url = %config.redis.url, "Using Redis job store");
        builder = builder.redis(client);
    }
    if let Some(settings) = config.limiter.clone() {
        builder = builder.rate_limit(settings);
    }
    let queue = Arc::new(builder.build()?);

    let promoter = queue.promoter(config.promoter.clone()).start();
    let worker = JobWorker::new(config.worker.clone(), Arc::new(LoggingHandler)).start(queue.clone());

    shutdown_signal().await;

    worker.stop().await;
    promoter.stop().await;

    let counts = queue.counts().await?;
    tracing::info!(
        waiting = counts.waiting,
        active = counts.active,
        delayed = counts.delayed,
        completed = counts.completed,
        failed = counts.failed,
        "Worker shutdown complete"
    );
    telemetry.shutdown();

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
