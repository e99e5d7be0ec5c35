//! `cogs-server` binary: loads configuration, assembles the gateway's
//! subsystems, and serves the HTTP surface.
//!
//! Wiring (config -> adapters -> router -> orchestrators -> axum) follows
//! `querymt-service::main`'s shape: `clap::Parser` for CLI overrides,
//! `tracing_subscriber::EnvFilter` defaulted then overridable by
//! `RUST_LOG`, one shared state built once and cloned into every handler.

mod auth;
mod inventory;
mod respond;
mod routes;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cogs_gateway::backend::adapters_from_config;
use cogs_gateway::backend::router::BackendRouter;
use cogs_gateway::config::GatewayConfig;
use cogs_gateway::job::JobManager;
use cogs_gateway::pipeline::PipelineOrchestrator;
use cogs_gateway::telemetry::UsageLog;
use cogs_gateway::workflow::WorkflowEngine;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cognitive services gateway")]
struct Args {
    /// Path to the gateway's TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `listen_addr` from the config file.
    #[arg(long)]
    addr: Option<String>,
    /// Overrides `auth_key` from the config file (Bearer token).
    #[arg(long)]
    auth_key: Option<String>,
}

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// `0` normal, `2` config error, `3` bind failure, `4` backend init failure.
#[repr(u8)]
enum ExitReason {
    ConfigError = 2,
    BindFailure = 3,
    BackendInitFailure = 4,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cogs_server=info,tower_http=info")))
        .with(fmt::layer())
        .init();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err((reason, err)) => {
            tracing::error!(error = %err, "cogs-server exiting");
            std::process::ExitCode::from(reason as u8)
        }
    }
}

async fn run() -> Result<(), (ExitReason, anyhow::Error)> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_path(path).map_err(|e| (ExitReason::ConfigError, e.into()))?,
        None => GatewayConfig::default(),
    }
    .apply_env_overrides();

    if let Some(addr) = args.addr {
        config.listen_addr = addr;
    }
    if let Some(auth_key) = args.auth_key {
        config.auth_key = Some(auth_key);
    }
    let config = Arc::new(config);

    if config.backends.is_empty() {
        return Err((
            ExitReason::BackendInitFailure,
            anyhow::anyhow!("no backends configured: at least one [[backends]] entry is required"),
        ));
    }

    let adapters = adapters_from_config(&config.backends);
    let usage_log = Arc::new(UsageLog::new(config.log_dir.clone()));
    let router = Arc::new(BackendRouter::new(
        adapters,
        config.build_descriptors(),
        config.build_policies(),
        usage_log.clone(),
        Duration::from_secs(config.health_cooldown_secs),
        config.consecutive_failure_threshold,
    ));

    let health_router = router.clone();
    tokio::spawn(async move {
        health_router.run_health_checks(HEALTH_CHECK_INTERVAL).await;
    });

    let pipeline = Arc::new(PipelineOrchestrator::new(
        router.clone(),
        usage_log.clone(),
        config.history_len,
        config.default_model.clone(),
        config.default_voice.clone(),
        config.min_transcript_chars,
    ));
    let jobs = Arc::new(JobManager::new(config.job_retention_cap));
    let workflows = Arc::new(WorkflowEngine::new());

    let state = AppState {
        config: config.clone(),
        router,
        pipeline,
        jobs,
        workflows,
        usage_log,
        auth_key: config.auth_key.clone(),
    };

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| (ExitReason::BindFailure, e.into()))?;
    tracing::info!(addr = %config.listen_addr, "cogs-server listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| (ExitReason::BindFailure, e.into()))?;

    Ok(())
}
