//! `POST /stt`, `POST /tts`, `POST /llm` — single-stage variants of the
//! pipeline, calling the router directly rather than going through
//! `PipelineOrchestrator`.

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cogs_gateway::backend::{GenerateTextParams, SynthesizeParams};
use cogs_gateway::GatewayError;
use serde::{Deserialize, Serialize};

use crate::auth;
use crate::respond::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
struct SttResponse {
    transcript: String,
    backend_used: String,
    duration_ms: u128,
}

pub async fn handle_stt(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;

    let mut audio: Option<Vec<u8>> = None;
    let mut model: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(GatewayError::InputInvalid(e.to_string())).into_response())?
    {
        match field.name().unwrap_or("") {
            "audio" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(GatewayError::InputInvalid(e.to_string())).into_response())?;
                audio = Some(bytes.to_vec());
            }
            "model" => {
                model = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError(GatewayError::InputInvalid(e.to_string())).into_response())?,
                );
            }
            _ => {}
        }
    }

    let audio = audio.ok_or_else(|| {
        ApiError(GatewayError::InputInvalid("missing audio field".into())).into_response()
    })?;

    let started = std::time::Instant::now();
    let (transcript, backend_used) = state
        .router
        .transcribe_audio(&audio, None, model.as_deref())
        .await
        .map_err(|e| ApiError(e).into_response())?;

    if transcript.trim().chars().count() < state.config.min_transcript_chars {
        return Err(ApiError(GatewayError::InputEmpty("transcription produced no usable text".into()))
            .into_response());
    }

    Ok(Json(SttResponse {
        transcript,
        backend_used,
        duration_ms: started.elapsed().as_millis(),
    })
    .into_response())
}

#[derive(Deserialize)]
pub struct TtsRequest {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

pub async fn handle_tts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TtsRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;

    if req.text.trim().is_empty() {
        return Err(ApiError(GatewayError::InputInvalid("text must not be empty".into())).into_response());
    }
    if let Some(voice) = &req.voice {
        crate::inventory::validate_voice(&state, voice)
            .await
            .map_err(|e| ApiError(e).into_response())?;
    }

    let voice = req.voice.unwrap_or_else(|| state.config.default_voice.clone());
    let sanitized = cogs_gateway::pipeline::sanitize::sanitize(&req.text);
    let started = std::time::Instant::now();
    let (audio, backend_used) = state
        .router
        .synthesize_speech(
            &sanitized,
            &voice,
            &SynthesizeParams {
                speed: req.speed,
                format: None,
            },
        )
        .await
        .map_err(|e| ApiError(e).into_response())?;

    let mut resp = (StatusCode::OK, audio).into_response();
    let headers = resp.headers_mut();
    headers.insert("Content-Type", HeaderValue::from_static("audio/wav"));
    if let Ok(v) = HeaderValue::from_str(&backend_used) {
        headers.insert("X-Backend-Used", v);
    }
    if let Ok(v) = HeaderValue::from_str(&started.elapsed().as_millis().to_string()) {
        headers.insert("X-Duration", v);
    }
    Ok(resp)
}

#[derive(Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct LlmResponse {
    response: String,
    backend_used: String,
    duration_ms: u128,
}

pub async fn handle_llm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LlmRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;

    if req.prompt.trim().is_empty() {
        return Err(ApiError(GatewayError::InputInvalid("prompt must not be empty".into())).into_response());
    }
    if let Some(model) = &req.model {
        crate::inventory::validate_model(&state, model)
            .await
            .map_err(|e| ApiError(e).into_response())?;
    }

    let model = req.model.unwrap_or_else(|| state.config.default_model.clone());
    let started = std::time::Instant::now();
    let (output, backend_used) = state
        .router
        .generate_text(
            &model,
            &req.prompt,
            req.system.as_deref(),
            &GenerateTextParams {
                max_tokens: req.max_tokens,
                temperature: req.temperature,
            },
        )
        .await
        .map_err(|e| ApiError(e).into_response())?;
    let duration = started.elapsed();

    Ok(Json(LlmResponse {
        response: output.text,
        backend_used,
        duration_ms: duration.as_millis(),
    })
    .into_response())
}
