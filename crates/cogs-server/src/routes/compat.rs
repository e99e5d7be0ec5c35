//! OpenAI/ElevenLabs-shaped compatibility shims: thin translation onto the
//! gateway's own `/chat`, `/tts`, and `/stt` pipelines, grounded in
//! `querymt-service::handle_chat`'s `ChatRequest`/`ChatResponse` shape but
//! without its streaming/tool-call machinery, which this gateway has no
//! equivalent of.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cogs_gateway::backend::{GenerateTextParams, SynthesizeParams};
use cogs_gateway::GatewayError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth;
use crate::respond::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CompatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct CompatChatRequest {
    pub messages: Vec<CompatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct CompatChoice {
    index: usize,
    message: CompatResponseMessage,
    finish_reason: String,
}

#[derive(Serialize)]
struct CompatResponseMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct CompatChatResponse {
    id: String,
    object: String,
    created: u64,
    model: String,
    choices: Vec<CompatChoice>,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// `/v1/chat/completions`: the last `user` message becomes the pipeline's
/// prompt; any `system` message becomes `system_prompt`. Streaming and
/// tool-calls are not translated — this gateway's pipeline doesn't support
/// either.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CompatChatRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;

    let system_prompt = req
        .messages
        .iter()
        .find(|m| m.role == "system")
        .and_then(|m| m.content.clone());
    let prompt = req
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .and_then(|m| m.content.clone())
        .ok_or_else(|| ApiError(GatewayError::InputInvalid("no user message in request".into())).into_response())?;

    if let Some(model) = &req.model {
        crate::inventory::validate_model(&state, model)
            .await
            .map_err(|e| ApiError(e).into_response())?;
    }
    let model = req.model.unwrap_or_else(|| state.config.default_model.clone());
    let (output, _backend_used) = state
        .router
        .generate_text(
            &model,
            &prompt,
            system_prompt.as_deref(),
            &GenerateTextParams {
                max_tokens: req.max_tokens,
                temperature: req.temperature,
            },
        )
        .await
        .map_err(|e| ApiError(e).into_response())?;

    Ok(Json(CompatChatResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".into(),
        created: now_unix(),
        model,
        choices: vec![CompatChoice {
            index: 0,
            message: CompatResponseMessage {
                role: "assistant".into(),
                content: output.text,
            },
            finish_reason: "stop".into(),
        }],
    })
    .into_response())
}

#[derive(Deserialize)]
pub struct CompatSpeechRequest {
    pub input: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

/// `/v1/audio/speech`: translates straight onto `/tts`.
pub async fn audio_speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CompatSpeechRequest>,
) -> Result<Response, Response> {
    auth::check(&state, &headers)?;

    if req.input.trim().is_empty() {
        return Err(ApiError(GatewayError::InputInvalid("input must not be empty".into())).into_response());
    }
    if let Some(voice) = &req.voice {
        crate::inventory::validate_voice(&state, voice)
            .await
            .map_err(|e| ApiError(e).into_response())?;
    }
    let voice = req.voice.unwrap_or_else(|| state.config.default_voice.clone());
    let sanitized = cogs_gateway::pipeline::sanitize::sanitize(&req.input);
    let (audio, _backend_used) = state
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

    let mut resp = (axum::http::StatusCode::OK, audio).into_response();
    resp.headers_mut()
        .insert("Content-Type", axum::http::HeaderValue::from_static("audio/wav"));
    Ok(resp)
}

#[derive(Serialize)]
struct CompatTranscriptionResponse {
    text: String,
}

/// `/v1/audio/transcriptions`: translates straight onto `/stt`. Only the
/// `multipart/form-data` `file` field is consumed; OpenAI's `response_format`
/// variants are not implemented.
pub async fn audio_transcriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: axum::extract::Multipart,
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
            "file" => {
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

    let audio = audio
        .ok_or_else(|| ApiError(GatewayError::InputInvalid("missing file field".into())).into_response())?;
    let (transcript, _backend_used) = state
        .router
        .transcribe_audio(&audio, None, model.as_deref())
        .await
        .map_err(|e| ApiError(e).into_response())?;

    Ok(Json(CompatTranscriptionResponse { text: transcript }).into_response())
}
