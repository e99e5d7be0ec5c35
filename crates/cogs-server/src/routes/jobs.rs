//! `/jobs/*`: submit background jobs, poll/filter status, cancel (single
//! or all, requiring `confirm=true`), and cleanup terminal jobs.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cogs_gateway::job::{Job, JobFilter, JobKind, JobStatus};
use cogs_gateway::job::workers::{DownloadModelWorker, DownloadVoiceWorker, TrainVoiceWorker};
use cogs_gateway::GatewayError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth;
use crate::respond::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
struct JobIdResponse {
    job_id: Uuid,
}

#[derive(Deserialize)]
pub struct DownloadModelRequest {
    pub model_id: String,
    pub name: String,
}

pub async fn submit_download_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DownloadModelRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let worker = Arc::new(DownloadModelWorker {
        model_id: req.model_id,
        output_dir: state.config.model_dir.clone(),
        chunk_count: 10,
    });
    let job_id = state
        .jobs
        .submit(JobKind::DownloadModel, req.name, worker)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(JobIdResponse { job_id }).into_response())
}

#[derive(Deserialize)]
pub struct DownloadVoiceRequest {
    pub voice_name: String,
    pub model_url: String,
    pub config_url: String,
}

pub async fn submit_download_voice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DownloadVoiceRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let worker = Arc::new(DownloadVoiceWorker {
        voice_name: req.voice_name.clone(),
        model_url: req.model_url,
        config_url: req.config_url,
        output_dir: state.config.voice_dir.clone(),
    });
    let job_id = state
        .jobs
        .submit(JobKind::DownloadVoice, req.voice_name, worker)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(JobIdResponse { job_id }).into_response())
}

/// `multipart/form-data`: `voice_name`, `text`, `audio` (the training
/// sample), mirroring the shape `POST /chat`'s audio upload already uses.
pub async fn submit_train_voice(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;

    let mut voice_name: Option<String> = None;
    let mut text: Option<String> = None;
    let mut audio: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(GatewayError::InputInvalid(e.to_string())).into_response())?
    {
        match field.name().unwrap_or("") {
            "voice_name" => {
                voice_name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError(GatewayError::InputInvalid(e.to_string())).into_response())?,
                )
            }
            "text" => {
                text = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError(GatewayError::InputInvalid(e.to_string())).into_response())?,
                )
            }
            "audio" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(GatewayError::InputInvalid(e.to_string())).into_response())?;
                audio = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let voice_name = voice_name
        .ok_or_else(|| ApiError(GatewayError::InputInvalid("missing voice_name".into())).into_response())?;
    let training_text =
        text.ok_or_else(|| ApiError(GatewayError::InputInvalid("missing text".into())).into_response())?;
    let audio_bytes =
        audio.ok_or_else(|| ApiError(GatewayError::InputInvalid("missing audio".into())).into_response())?;

    let worker = Arc::new(TrainVoiceWorker {
        voice_name: voice_name.clone(),
        training_text,
        audio_bytes,
        output_dir: state.config.voice_dir.clone(),
    });
    let job_id = state
        .jobs
        .submit(JobKind::TrainVoice, voice_name, worker)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(JobIdResponse { job_id }).into_response())
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    kind: Option<JobKind>,
    status: Option<JobStatus>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ListJobsQuery>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let jobs: Vec<Job> = state
        .jobs
        .list(&JobFilter {
            kind: q.kind,
            status: q.status,
        })
        .await;
    let offset = q.offset.unwrap_or(0);
    let limit = q.limit.unwrap_or(jobs.len());
    let page: Vec<Job> = jobs.into_iter().skip(offset).take(limit).collect();
    Ok(Json(page).into_response())
}

#[derive(Deserialize)]
pub struct ConfirmQuery {
    #[serde(default)]
    confirm: bool,
}

pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
    Query(q): Query<ConfirmQuery>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    state
        .jobs
        .cancel(job_id, q.confirm)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(serde_json::json!({"status": "ok"})).into_response())
}

#[derive(Deserialize)]
pub struct CancelAllQuery {
    #[serde(default)]
    confirm: bool,
    kind: Option<JobKind>,
    status: Option<JobStatus>,
}

pub async fn cancel_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<CancelAllQuery>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let cancelled = state
        .jobs
        .cancel_all(
            &JobFilter {
                kind: q.kind,
                status: q.status,
            },
            q.confirm,
        )
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(serde_json::json!({"cancelled": cancelled})).into_response())
}

pub async fn cleanup(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let removed_count = state.jobs.cleanup().await;
    Ok(Json(serde_json::json!({"removed_count": removed_count})).into_response())
}

pub async fn job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let job = state.jobs.status(job_id).await.map_err(|e| ApiError(e).into_response())?;
    Ok(Json(job).into_response())
}
