//! `GET /status`, `GET /models`, `GET /voices`: service health,
//! per-backend/per-model metrics, and model/voice inventory.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cogs_gateway::telemetry::{BackendMetrics, ModelStats};
use serde::Serialize;
use std::collections::HashMap;

use crate::auth;
use crate::state::AppState;

/// `BackendDescriptor` keeps its cooldown clock as a monotonic `Instant`,
/// which doesn't serialize; this DTO reports the same fields in wire form.
#[derive(Serialize)]
struct BackendStatusEntry {
    id: String,
    capability: cogs_gateway::Capability,
    is_primary: bool,
    is_available: bool,
    policy_weight: u32,
    last_health_check_secs_ago: Option<u64>,
}

#[derive(Serialize)]
struct StatusResponse {
    backends: Vec<BackendStatusEntry>,
    backend_metrics: HashMap<String, BackendMetrics>,
    model_stats: HashMap<String, ModelStats>,
    fastest_model_hint: Option<String>,
}

pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let backends = state
        .router
        .snapshot()
        .await
        .into_iter()
        .map(|d| BackendStatusEntry {
            id: d.id,
            capability: d.capability,
            is_primary: d.is_primary,
            is_available: d.is_available,
            policy_weight: d.policy_weight,
            last_health_check_secs_ago: d.last_health_check.map(|i| i.elapsed().as_secs()),
        })
        .collect();
    Ok(Json(StatusResponse {
        backends,
        backend_metrics: state.usage_log.backend_metrics().await,
        model_stats: state.usage_log.model_stats().await,
        fastest_model_hint: state.usage_log.fastest_model_hint().await,
    })
    .into_response())
}

pub async fn models(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    Ok(Json(state.router.list_models().await).into_response())
}

#[derive(Serialize)]
struct VoiceEntry {
    name: String,
}

/// A voice is a blob file (`<name>.bin`) plus a JSON sidecar
/// (`<name>.json`); only pairs with both present are listed.
pub async fn voices(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, Response> {
    auth::check(&state, &headers)?;
    let mut names: Vec<VoiceEntry> = crate::inventory::known_voice_names(&state.config.voice_dir)
        .await
        .into_iter()
        .map(|name| VoiceEntry { name })
        .collect();
    names.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(names).into_response())
}
