//! `POST /chat` — the pipeline entry point: STT -> LLM -> TTS, text or
//! audio in, text or audio out. Input arrives as `multipart/form-data`
//! so an audio upload and the surrounding text fields travel in one request,
//! the same shape `HttpAdapter::transcribe_audio` already expects on the
//! backend side.

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cogs_gateway::pipeline::{ChatRequest, OutputFormat};
use serde::Serialize;
use serde_json::json;

use crate::auth;
use crate::respond::ApiError;
use crate::state::AppState;

#[derive(Default)]
struct ChatForm {
    audio: Option<Vec<u8>>,
    text: Option<String>,
    model: Option<String>,
    voice: Option<String>,
    format: Option<String>,
    session_id: Option<String>,
    system_prompt: Option<String>,
}

async fn read_multipart(mut multipart: Multipart) -> Result<ChatForm, ApiError> {
    let mut form = ChatForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(cogs_gateway::GatewayError::InputInvalid(e.to_string())))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "audio" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(cogs_gateway::GatewayError::InputInvalid(e.to_string())))?;
                form.audio = Some(bytes.to_vec());
            }
            other => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError(cogs_gateway::GatewayError::InputInvalid(e.to_string())))?;
                match other {
                    "text" => form.text = Some(text),
                    "model" => form.model = Some(text),
                    "voice" => form.voice = Some(text),
                    "format" => form.format = Some(text),
                    "session_id" => form.session_id = Some(text),
                    "system_prompt" => form.system_prompt = Some(text),
                    _ => {}
                }
            }
        }
    }
    Ok(form)
}

#[derive(Serialize)]
struct ChatTextResponse {
    session_id: String,
    text: String,
    backend_used_per_stage: cogs_gateway::pipeline::StageBackendUsed,
    duration_ms: u128,
}

pub async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;

    let form = read_multipart(multipart).await.map_err(IntoResponse::into_response)?;
    let format = match form.format.as_deref() {
        Some("audio") => OutputFormat::Audio,
        Some("both") => OutputFormat::Both,
        _ => OutputFormat::Text,
    };

    if let Some(model) = &form.model {
        crate::inventory::validate_model(&state, model)
            .await
            .map_err(|e| ApiError(e).into_response())?;
    }
    if matches!(format, OutputFormat::Audio | OutputFormat::Both) {
        if let Some(voice) = &form.voice {
            crate::inventory::validate_voice(&state, voice)
                .await
                .map_err(|e| ApiError(e).into_response())?;
        }
    }

    let req = ChatRequest {
        audio: form.audio,
        text: form.text,
        model: form.model,
        voice: form.voice,
        system_prompt: form.system_prompt,
        session_id: form.session_id,
    };

    let started = std::time::Instant::now();
    let result = state
        .pipeline
        .run_chat(req, format)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    let duration = started.elapsed();

    match format {
        OutputFormat::Audio => {
            let audio = result.audio.ok_or_else(|| {
                ApiError(cogs_gateway::GatewayError::Internal("tts produced no audio".into())).into_response()
            })?;
            let mut resp = (StatusCode::OK, audio).into_response();
            let headers = resp.headers_mut();
            headers.insert("Content-Type", HeaderValue::from_static("audio/wav"));
            insert_header(headers, "X-Session-Id", &result.session_id);
            insert_header(
                headers,
                "X-Backend-Used",
                result.backend_used.tts.as_deref().unwrap_or(""),
            );
            insert_header(headers, "X-Duration", &duration.as_millis().to_string());
            Ok(resp)
        }
        OutputFormat::Both => Ok(Json(json!({
            "session_id": result.session_id,
            "text": result.text,
            "audio_base64": result.audio.map(|bytes| {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode(bytes)
            }),
            "backend_used_per_stage": result.backend_used,
            "duration_ms": duration.as_millis(),
        }))
        .into_response()),
        OutputFormat::Text => Ok(Json(ChatTextResponse {
            session_id: result.session_id,
            text: result.text.unwrap_or_default(),
            backend_used_per_stage: result.backend_used,
            duration_ms: duration.as_millis(),
        })
        .into_response()),
    }
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

/// `POST /chat/{session_id}/interrupt` — a new inbound action pre-empting an
/// in-flight `playing` stage.
pub async fn interrupt(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Path(session_id): axum::extract::Path<String>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    state
        .pipeline
        .interrupt(&session_id)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(json!({"status": "ok"})).into_response())
}
