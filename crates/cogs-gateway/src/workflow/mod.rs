//! Workflow Engine: a generic step sequencer with retry, skip, timeout,
//! an interactive pause/resume/modify/skip control surface, and a
//! `StepFeedback` broadcast for observers.
//!
//! Grounded in `querymt-service::handle_chat`'s SSE token-forwarding shape
//! for the feedback transport (`tokio::sync::broadcast` -> `axum::response::
//! sse`), generalized from "forward one provider's token stream" to
//! "forward one execution's step-feedback stream". The step-record/attempt
//! bookkeeping is new, built in the same idiom.

pub mod research;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayError;

pub type StepContext = HashMap<String, serde_json::Value>;
pub type StepResult = Result<serde_json::Value, GatewayError>;
type StepFuture = Pin<Box<dyn Future<Output = StepResult> + Send>>;

/// A step function: opaque input plus a read-only context snapshot in,
/// opaque output or error out. The engine never inspects the payload.
pub type StepFn = Arc<dyn Fn(serde_json::Value, StepContext) -> StepFuture + Send + Sync>;

/// Evaluated before a step is entered; `true` marks it skipped.
pub type SkipConditionFn = Arc<dyn Fn(&serde_json::Value, &StepContext) -> bool + Send + Sync>;

/// Wrap a plain `async fn(Value, StepContext) -> StepResult` closure into a
/// boxed `StepFn`, so step authors (e.g. `research.rs`) don't touch `Pin`/
/// `Box` themselves.
pub fn step_fn<F, Fut>(f: F) -> StepFn
where
    F: Fn(serde_json::Value, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    Arc::new(move |input, ctx| Box::pin(f(input, ctx)))
}

pub struct WorkflowStep {
    pub label: String,
    pub func: StepFn,
    pub retry_attempts: u32,
    pub timeout: Option<Duration>,
    pub skip_condition: Option<SkipConditionFn>,
}

impl WorkflowStep {
    pub fn new(label: impl Into<String>, func: StepFn) -> Self {
        WorkflowStep {
            label: label.into(),
            func,
            retry_attempts: 1,
            timeout: None,
            skip_condition: None,
        }
    }

    pub fn with_retries(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_skip_condition(mut self, cond: SkipConditionFn) -> Self {
        self.skip_condition = Some(cond);
        self
    }
}

pub struct Workflow {
    pub label: String,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn new(label: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Workflow {
            label: label.into(),
            steps,
        }
    }

    /// `steps` non-empty, labels unique.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.steps.is_empty() {
            return Err(GatewayError::InputInvalid("workflow must have at least one step".into()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.label.clone()) {
                return Err(GatewayError::InputInvalid(format!(
                    "duplicate step label '{}'",
                    step.label
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRecordStatus {
    Success,
    Failed,
    Skipped,
}

/// Bounded to <=200 stringified chars, so a record stays readable in logs.
fn summarize(value: &serde_json::Value) -> String {
    let s = value.to_string();
    if s.chars().count() > 200 {
        s.chars().take(200).collect()
    } else {
        s
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_id: usize,
    pub label: String,
    pub status: StepRecordStatus,
    pub duration_ms: u128,
    pub input_summary: String,
    pub output_summary: Option<String>,
    pub reason: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    /// Human-readable description of each `Modification` that was queued
    /// against this step label and applied before (or instead of) the step
    /// ran, e.g. `"parameters merged: {\"summary_target_length\":\"brief\"}"`.
    pub applied_modifications: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub workflow_label: String,
    pub status: ExecutionStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub records: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_output: Option<serde_json::Value>,
}

/// A pending modification queued against a step label, merged in when that
/// step is next entered.
#[derive(Debug, Clone)]
pub enum Modification {
    Parameters(serde_json::Value),
    Direction(String),
    Skip { reason: String },
    Retry,
}

/// Per-step estimated complexity / expected duration. Supplements
/// `StepFeedback.metrics` per a static label heuristic, grounded in
/// `interactive_workflow_controller.py::_estimate_step_complexity` /
/// `_calculate_step_metrics`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StepMetrics {
    pub estimated_complexity: f32,
    pub expected_duration_ms: u64,
}

fn estimate_step_metrics(label: &str) -> StepMetrics {
    let lower = label.to_lowercase();
    let (estimated_complexity, expected_duration_ms) = if lower.contains("search") {
        (0.8, 4_000)
    } else if lower.contains("write") || lower.contains("synthesize") {
        (0.9, 6_000)
    } else if lower.contains("structure") {
        (0.6, 3_000)
    } else if lower.contains("finalize") {
        (0.4, 1_500)
    } else if lower.contains("clarify") {
        (0.3, 1_200)
    } else {
        (0.5, 2_000)
    };
    StepMetrics {
        estimated_complexity,
        expected_duration_ms,
    }
}

/// `{step_id, label, status, progress_percent, current_action, metrics,
/// timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct StepFeedback {
    pub step_id: usize,
    pub label: String,
    pub status: String,
    pub progress_percent: Option<u8>,
    pub current_action: String,
    pub metrics: StepMetrics,
    pub timestamp: DateTime<Utc>,
}

const FEEDBACK_CHANNEL_CAPACITY: usize = 256;
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// One execution's state plus its control surface. The spawned execution
/// task is the sole mutator of `state`; `pause`/`resume`/`skip`/`modify`
/// only ever touch the flag or the modification queue.
pub struct ExecutionHandle {
    state: RwLock<Execution>,
    paused: AtomicBool,
    pending_mods: RwLock<HashMap<String, Vec<Modification>>>,
    context: RwLock<StepContext>,
    feedback_tx: broadcast::Sender<StepFeedback>,
}

impl ExecutionHandle {
    fn new(execution_id: Uuid, workflow_label: String, total_steps: usize) -> Self {
        let (feedback_tx, _rx) = broadcast::channel(FEEDBACK_CHANNEL_CAPACITY);
        ExecutionHandle {
            state: RwLock::new(Execution {
                execution_id,
                workflow_label,
                status: ExecutionStatus::Running,
                current_step: 0,
                total_steps,
                records: Vec::new(),
                started_at: Utc::now(),
                completed_at: None,
                final_output: None,
            }),
            paused: AtomicBool::new(false),
            pending_mods: RwLock::new(HashMap::new()),
            context: RwLock::new(HashMap::new()),
            feedback_tx,
        }
    }

    pub async fn snapshot(&self) -> Execution {
        self.state.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepFeedback> {
        self.feedback_tx.subscribe()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub async fn skip(&self, label: &str, reason: String) {
        self.queue(label, Modification::Skip { reason }).await;
    }

    pub async fn modify(&self, label: &str, modification: Modification) {
        self.queue(label, modification).await;
    }

    async fn queue(&self, label: &str, modification: Modification) {
        let mut q = self.pending_mods.write().await;
        q.entry(label.to_string()).or_default().push(modification);
    }

    fn emit(&self, feedback: StepFeedback) {
        // No subscribers yet is not an error: delivery to whoever *is*
        // listening, not a guarantee someone is.
        let _ = self.feedback_tx.send(feedback);
    }
}

pub struct WorkflowEngine {
    executions: RwLock<HashMap<Uuid, Arc<ExecutionHandle>>>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        WorkflowEngine {
            executions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn execution(&self, execution_id: Uuid) -> Option<Arc<ExecutionHandle>> {
        self.executions.read().await.get(&execution_id).cloned()
    }

    /// Validates and kicks off a `Workflow`, returning its handle
    /// immediately; the execution itself runs on a spawned task owned
    /// exclusively by that execution.
    pub async fn start(&self, workflow: Workflow) -> Result<Arc<ExecutionHandle>, GatewayError> {
        self.start_with_input(workflow, serde_json::Value::Null).await
    }

    pub async fn start_with_input(
        &self,
        workflow: Workflow,
        initial_input: serde_json::Value,
    ) -> Result<Arc<ExecutionHandle>, GatewayError> {
        workflow.validate()?;
        let execution_id = Uuid::new_v4();
        let handle = Arc::new(ExecutionHandle::new(
            execution_id,
            workflow.label.clone(),
            workflow.steps.len(),
        ));
        {
            let mut execs = self.executions.write().await;
            execs.insert(execution_id, handle.clone());
        }

        let task_handle = handle.clone();
        let steps = workflow.steps;
        tokio::spawn(async move {
            run_execution(task_handle, steps, initial_input).await;
        });

        Ok(handle)
    }

    /// Convenience for callers (e.g. `POST /workflow/research`) that need
    /// the final document rather than a fire-and-observe handle: starts the
    /// execution and polls until it reaches a terminal status.
    pub async fn run_to_completion(
        &self,
        workflow: Workflow,
        initial_input: serde_json::Value,
    ) -> Result<Execution, GatewayError> {
        let handle = self.start_with_input(workflow, initial_input).await?;
        loop {
            let exec = handle.snapshot().await;
            if matches!(exec.status, ExecutionStatus::Completed | ExecutionStatus::Failed) {
                return Ok(exec);
            }
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_execution(handle: Arc<ExecutionHandle>, steps: Vec<WorkflowStep>, initial_input: serde_json::Value) {
    let total = steps.len();
    handle.emit(StepFeedback {
        step_id: 0,
        label: "workflow".into(),
        status: "workflow_started".into(),
        progress_percent: Some(0),
        current_action: "starting".into(),
        metrics: StepMetrics::default(),
        timestamp: Utc::now(),
    });

    let mut input = initial_input;
    let mut remaining_retries: Vec<u32> = steps.iter().map(|s| s.retry_attempts).collect();

    for (idx, step) in steps.iter().enumerate() {
        wait_while_paused(&handle).await;

        {
            let mut exec = handle.state.write().await;
            exec.current_step = idx;
        }

        let queued_mods = {
            let mut q = handle.pending_mods.write().await;
            q.remove(&step.label).unwrap_or_default()
        };

        let mut forced_skip_reason = None;
        let mut applied_modifications = Vec::new();
        for modification in queued_mods {
            match modification {
                Modification::Parameters(value) => {
                    applied_modifications.push(format!("parameters merged: {value}"));
                    let mut ctx = handle.context.write().await;
                    ctx.insert("parameters".into(), value);
                }
                Modification::Direction(direction) => {
                    applied_modifications.push(format!("direction set: {direction}"));
                    let mut ctx = handle.context.write().await;
                    ctx.insert("direction".into(), serde_json::Value::String(direction));
                }
                Modification::Skip { reason } => {
                    applied_modifications.push(format!("forced skip: {reason}"));
                    forced_skip_reason = Some(reason);
                }
                Modification::Retry => {
                    applied_modifications.push("retry budget increased by 1".to_string());
                    remaining_retries[idx] += 1;
                }
            }
        }

        let ctx_snapshot = handle.context.read().await.clone();

        if forced_skip_reason.is_none() {
            if let Some(cond) = &step.skip_condition {
                if cond(&input, &ctx_snapshot) {
                    forced_skip_reason = Some("skip condition met".to_string());
                }
            }
        }

        if let Some(reason) = forced_skip_reason {
            info!(label = %step.label, %reason, "step skipped");
            handle.emit(StepFeedback {
                step_id: idx,
                label: step.label.clone(),
                status: "skipped".into(),
                progress_percent: None,
                current_action: reason.clone(),
                metrics: estimate_step_metrics(&step.label),
                timestamp: Utc::now(),
            });
            let mut exec = handle.state.write().await;
            exec.records.push(StepRecord {
                step_id: idx,
                label: step.label.clone(),
                status: StepRecordStatus::Skipped,
                duration_ms: 0,
                input_summary: summarize(&input),
                output_summary: None,
                reason: Some(reason),
                error: None,
                attempts: 0,
                applied_modifications,
            });
            continue;
        }

        handle.emit(StepFeedback {
            step_id: idx,
            label: step.label.clone(),
            status: "step_started".into(),
            progress_percent: Some(((idx as f32 / total as f32) * 100.0) as u8),
            current_action: "running".into(),
            metrics: estimate_step_metrics(&step.label),
            timestamp: Utc::now(),
        });

        let attempts_allowed = remaining_retries[idx].max(1);
        let started = std::time::Instant::now();
        let mut attempt = 0;
        let mut last_err = None;
        let mut output = None;

        while attempt < attempts_allowed {
            attempt += 1;
            let fut = (step.func)(input.clone(), ctx_snapshot.clone());
            let attempt_result = match step.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(GatewayError::Timeout(format!("step '{}' timed out", step.label))),
                },
                None => fut.await,
            };
            match attempt_result {
                Ok(v) => {
                    output = Some(v);
                    break;
                }
                Err(e) => {
                    warn!(label = %step.label, attempt, error = %e, "step attempt failed");
                    last_err = Some(e);
                    if attempt < attempts_allowed {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }

        let duration = started.elapsed();

        match output {
            Some(v) => {
                handle.emit(StepFeedback {
                    step_id: idx,
                    label: step.label.clone(),
                    status: "success".into(),
                    progress_percent: Some((((idx + 1) as f32 / total as f32) * 100.0) as u8),
                    current_action: "completed".into(),
                    metrics: estimate_step_metrics(&step.label),
                    timestamp: Utc::now(),
                });
                let mut exec = handle.state.write().await;
                exec.records.push(StepRecord {
                    step_id: idx,
                    label: step.label.clone(),
                    status: StepRecordStatus::Success,
                    duration_ms: duration.as_millis(),
                    input_summary: summarize(&input),
                    output_summary: Some(summarize(&v)),
                    reason: None,
                    error: None,
                    attempts: attempt,
                    applied_modifications,
                });
                drop(exec);
                input = v;
            }
            None => {
                let err = last_err.expect("attempt loop always sets last_err on failure");
                handle.emit(StepFeedback {
                    step_id: idx,
                    label: step.label.clone(),
                    status: "failed".into(),
                    progress_percent: None,
                    current_action: err.to_string(),
                    metrics: estimate_step_metrics(&step.label),
                    timestamp: Utc::now(),
                });
                let mut exec = handle.state.write().await;
                exec.records.push(StepRecord {
                    step_id: idx,
                    label: step.label.clone(),
                    status: StepRecordStatus::Failed,
                    duration_ms: duration.as_millis(),
                    input_summary: summarize(&input),
                    output_summary: None,
                    reason: None,
                    error: Some(err.to_string()),
                    attempts: attempt,
                    applied_modifications,
                });
                exec.status = ExecutionStatus::Failed;
                exec.completed_at = Some(Utc::now());
                drop(exec);
                handle.emit(StepFeedback {
                    step_id: total,
                    label: "workflow".into(),
                    status: "workflow_completed".into(),
                    progress_percent: Some(100),
                    current_action: "failed".into(),
                    metrics: StepMetrics::default(),
                    timestamp: Utc::now(),
                });
                return;
            }
        }
    }

    let mut exec = handle.state.write().await;
    exec.status = ExecutionStatus::Completed;
    exec.completed_at = Some(Utc::now());
    exec.final_output = Some(input);
    drop(exec);
    handle.emit(StepFeedback {
        step_id: total,
        label: "workflow".into(),
        status: "workflow_completed".into(),
        progress_percent: Some(100),
        current_action: "done".into(),
        metrics: StepMetrics::default(),
        timestamp: Utc::now(),
    });
}

async fn wait_while_paused(handle: &Arc<ExecutionHandle>) {
    if !handle.paused.load(Ordering::SeqCst) {
        return;
    }
    {
        let mut exec = handle.state.write().await;
        exec.status = ExecutionStatus::Paused;
    }
    while handle.paused.load(Ordering::SeqCst) {
        tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
    }
    let mut exec = handle.state.write().await;
    if exec.status == ExecutionStatus::Paused {
        exec.status = ExecutionStatus::Running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn ok_step(label: &str) -> WorkflowStep {
        WorkflowStep::new(label, step_fn(|input, _ctx| async move { Ok(input) }))
    }

    #[tokio::test]
    async fn rejects_empty_and_duplicate_labels() {
        assert!(Workflow::new("empty", vec![]).validate().is_err());
        let dup = Workflow::new(
            "dup",
            vec![ok_step("a"), ok_step("a")],
        );
        assert!(dup.validate().is_err());
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_records_success() {
        let engine = WorkflowEngine::new();
        let workflow = Workflow::new(
            "chain",
            vec![
                WorkflowStep::new(
                    "double",
                    step_fn(|input, _ctx| async move {
                        let n = input.as_i64().unwrap_or(0);
                        Ok(serde_json::json!(n * 2))
                    }),
                ),
                WorkflowStep::new(
                    "increment",
                    step_fn(|input, _ctx| async move {
                        let n = input.as_i64().unwrap_or(0);
                        Ok(serde_json::json!(n + 1))
                    }),
                ),
            ],
        );
        let exec = engine.run_to_completion(workflow, serde_json::json!(5)).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.final_output, Some(serde_json::json!(11)));
        assert_eq!(exec.records.len(), 2);
        assert!(exec.records.iter().all(|r| r.status == StepRecordStatus::Success));
    }

    #[tokio::test]
    async fn skip_condition_marks_step_skipped() {
        let engine = WorkflowEngine::new();
        let workflow = Workflow::new(
            "skippable",
            vec![WorkflowStep::new("maybe", step_fn(|input, _ctx| async move { Ok(input) }))
                .with_skip_condition(Arc::new(|_input, _ctx| true))],
        );
        let exec = engine.run_to_completion(workflow, serde_json::json!("x")).await.unwrap();
        assert_eq!(exec.records[0].status, StepRecordStatus::Skipped);
    }

    #[tokio::test]
    async fn retries_until_success_within_attempt_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let engine = WorkflowEngine::new();
        let workflow = Workflow::new(
            "flaky",
            vec![WorkflowStep::new(
                "unstable",
                step_fn(move |input, _ctx| {
                    let attempts = attempts_clone.clone();
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(GatewayError::StepFailed("not yet".into()))
                        } else {
                            Ok(input)
                        }
                    }
                }),
            )
            .with_retries(5)],
        );
        let exec = engine.run_to_completion(workflow, serde_json::json!(1)).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.records[0].attempts, 3);
    }

    #[tokio::test]
    async fn final_failure_after_retries_marks_execution_failed() {
        let engine = WorkflowEngine::new();
        let workflow = Workflow::new(
            "always-fails",
            vec![WorkflowStep::new(
                "doomed",
                step_fn(|_input, _ctx| async move { Err(GatewayError::StepFailed("nope".into())) }),
            )
            .with_retries(2)],
        );
        let exec = engine.run_to_completion(workflow, serde_json::json!(null)).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.records[0].attempts, 2);
        assert_eq!(exec.records[0].status, StepRecordStatus::Failed);
    }

    #[tokio::test]
    async fn modify_skip_forces_named_step_to_be_skipped() {
        let engine = WorkflowEngine::new();
        let workflow = Workflow::new("two-step", vec![ok_step("first"), ok_step("second")]);
        let handle = engine.start_with_input(workflow, serde_json::json!(1)).await.unwrap();
        handle.skip("second", "operator request".into()).await;
        for _ in 0..50 {
            let exec = handle.snapshot().await;
            if exec.status == ExecutionStatus::Completed {
                assert_eq!(exec.records[1].status, StepRecordStatus::Skipped);
                assert_eq!(exec.records[1].reason.as_deref(), Some("operator request"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution never completed");
    }

    #[tokio::test]
    async fn pause_blocks_progress_until_resumed() {
        let engine = WorkflowEngine::new();
        let workflow = Workflow::new("pausable", vec![ok_step("a"), ok_step("b")]);
        let handle = engine.start_with_input(workflow, serde_json::json!(1)).await.unwrap();
        handle.pause();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let exec = handle.snapshot().await;
        assert_ne!(exec.status, ExecutionStatus::Completed);
        handle.resume();
        for _ in 0..50 {
            if handle.snapshot().await.status == ExecutionStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution never completed after resume");
    }

    #[tokio::test]
    async fn feedback_is_published_for_workflow_lifecycle() {
        let engine = WorkflowEngine::new();
        let workflow = Workflow::new("observed", vec![ok_step("only")]);
        let handle = engine.start_with_input(workflow, serde_json::json!(1)).await.unwrap();
        let mut rx = handle.subscribe();
        let mut saw_started = false;
        let mut saw_completed = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Ok(feedback)) => {
                    if feedback.status == "workflow_started" {
                        saw_started = true;
                    }
                    if feedback.status == "workflow_completed" {
                        saw_completed = true;
                        break;
                    }
                }
                _ => break,
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
    }
}
