//! `/workflow/*`: start the research workflow and observe/steer its
//! execution while it runs.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cogs_gateway::workflow::Modification;
use cogs_gateway::GatewayError;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::auth;
use crate::respond::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Returned the moment the execution is registered, not when it finishes —
/// the run itself continues on its own spawned task. `status`/`document`
/// only firm up once a client polls `GET /workflow/{execution_id}/status`
/// (or subscribes to `/events`); until then a client that reads this
/// response alone sees a workflow that has just started.
#[derive(Serialize)]
struct ResearchResponse {
    execution_id: Uuid,
    status: cogs_gateway::workflow::ExecutionStatus,
}

/// Starts the research workflow and returns `execution_id` immediately,
/// before any step has run, so `/workflow/{execution_id}/{status,events,
/// pause,resume,modify,skip}` can observe and steer the run while it is
/// still in flight — a client can `pause`/`modify` after `search` without
/// having to wait for the whole run to finish first. Read the finished
/// document back off `GET /workflow/{execution_id}/status`'s
/// `execution_summary.final_output.document` once `status` is `completed`.
pub async fn run_research(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(req): Json<ResearchRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;

    if req.query.trim().is_empty() {
        return Err(ApiError(GatewayError::InputInvalid("query must not be empty".into())).into_response());
    }

    if let Some(model) = &req.model {
        crate::inventory::validate_model(&state, model)
            .await
            .map_err(|e| ApiError(e).into_response())?;
    }
    let model = req.model.unwrap_or_else(|| state.config.default_model.clone());
    let workflow = cogs_gateway::workflow::research::build_research_workflow(
        state.router.clone(),
        model,
        state.config.search_max_results,
    );
    let initial_input = cogs_gateway::workflow::research::initial_input(&req.query);

    let handle = state
        .workflows
        .start_with_input(workflow, initial_input)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    let exec = handle.snapshot().await;

    Ok(Json(ResearchResponse {
        execution_id: exec.execution_id,
        status: exec.status,
    })
    .into_response())
}

async fn find_execution(
    state: &AppState,
    execution_id: Uuid,
) -> Result<std::sync::Arc<cogs_gateway::workflow::ExecutionHandle>, Response> {
    state
        .workflows
        .execution(execution_id)
        .await
        .ok_or_else(|| ApiError(GatewayError::Internal(format!("no execution {execution_id}"))).into_response())
}

pub async fn status(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Path(execution_id): Path<Uuid>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let handle = find_execution(&state, execution_id).await?;
    Ok(Json(handle.snapshot().await).into_response())
}

/// `StepFeedback` events as they are published, one SSE event per update.
/// Mirrors `querymt-service`'s `chat_stream_with_tools` SSE forwarding, here
/// forwarding one execution's feedback broadcast instead of one provider's
/// token stream.
pub async fn events(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Path(execution_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    auth::check(&state, &headers)?;
    let handle = find_execution(&state, execution_id).await?;
    let rx = handle.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(feedback) => match serde_json::to_string(&feedback) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(_) => None,
        },
        // A slow subscriber that lagged behind the broadcast's ring buffer:
        // drop the gap rather than ending the stream, it still gets every
        // feedback event published after it catches up.
        Err(_lagged) => None,
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive")))
}

pub async fn pause(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Path(execution_id): Path<Uuid>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let handle = find_execution(&state, execution_id).await?;
    handle.pause();
    Ok(Json(serde_json::json!({"status": "paused"})).into_response())
}

pub async fn resume(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Path(execution_id): Path<Uuid>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let handle = find_execution(&state, execution_id).await?;
    handle.resume();
    Ok(Json(serde_json::json!({"status": "resumed"})).into_response())
}

#[derive(Deserialize)]
pub struct SkipRequest {
    pub step_label: String,
    #[serde(default = "default_skip_reason")]
    pub reason: String,
}

fn default_skip_reason() -> String {
    "operator request".to_string()
}

pub async fn skip(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Path(execution_id): Path<Uuid>,
    Json(req): Json<SkipRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let handle = find_execution(&state, execution_id).await?;
    handle.skip(&req.step_label, req.reason).await;
    Ok(Json(serde_json::json!({"status": "queued"})).into_response())
}

/// `kind` selects which `Modification` variant `value`/`direction` fill in.
#[derive(Deserialize)]
pub struct ModifyRequest {
    pub step_label: String,
    pub kind: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub direction: Option<String>,
}

pub async fn modify(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Path(execution_id): Path<Uuid>,
    Json(req): Json<ModifyRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let handle = find_execution(&state, execution_id).await?;

    let modification = match req.kind.as_str() {
        "parameters" => Modification::Parameters(req.value.unwrap_or(serde_json::Value::Null)),
        "direction" => Modification::Direction(req.direction.unwrap_or_default()),
        "retry" => Modification::Retry,
        "skip" => Modification::Skip {
            reason: req.direction.unwrap_or_else(default_skip_reason),
        },
        other => {
            return Err(ApiError(GatewayError::InputInvalid(format!("unknown modification kind '{other}'")))
                .into_response())
        }
    };

    handle.modify(&req.step_label, modification).await;
    Ok(Json(serde_json::json!({"status": "queued"})).into_response())
}
