//! Shared application state handed to every handler, grounded in
//! `querymt-service::main`'s `ServerState`: one `Clone`-able struct of
//! `Arc`s plus the optional auth key.

use std::sync::Arc;

use cogs_gateway::backend::BackendRouter;
use cogs_gateway::config::GatewayConfig;
use cogs_gateway::job::JobManager;
use cogs_gateway::pipeline::PipelineOrchestrator;
use cogs_gateway::telemetry::UsageLog;
use cogs_gateway::workflow::WorkflowEngine;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<BackendRouter>,
    pub pipeline: Arc<PipelineOrchestrator>,
    pub jobs: Arc<JobManager>,
    pub workflows: Arc<WorkflowEngine>,
    pub usage_log: Arc<UsageLog>,
    pub auth_key: Option<String>,
}
