//! Core orchestration library for the cognitive services gateway.
//!
//! Four tightly coupled subsystems sit at the center: the [`backend`]
//! router (primary/fallback selection across language, speech and
//! synthesis backends), the [`job`] manager (cancellable background
//! downloads and training jobs), the [`pipeline`] orchestrator (the
//! STT -> LLM -> TTS conversational turn), and the [`workflow`] engine
//! (a generic retryable step sequencer, instantiated concretely as the
//! [`workflow::research`] pipeline). [`telemetry`] and [`config`] are the
//! ambient plumbing the rest depend on.

pub mod backend;
pub mod capability;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod telemetry;
pub mod workflow;

pub use backend::adapter::BackendAdapter;
pub use backend::router::BackendRouter;
pub use capability::Capability;
pub use config::GatewayConfig;
pub use error::{ErrorBody, GatewayError};
pub use job::JobManager;
pub use pipeline::PipelineOrchestrator;
pub use telemetry::UsageLog;
pub use workflow::WorkflowEngine;
