//! Route wiring: one `axum::Router` assembled from the endpoint families
//! below, CORS-permissive per `querymt-service`.

pub mod chat;
pub mod compat;
pub mod jobs;
pub mod single_stage;
pub mod status;
pub mod workflow;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat::handle_chat))
        .route("/chat/:session_id/interrupt", post(chat::interrupt))
        .route("/stt", post(single_stage::handle_stt))
        .route("/tts", post(single_stage::handle_tts))
        .route("/llm", post(single_stage::handle_llm))
        .route("/jobs/download_model", post(jobs::submit_download_model))
        .route("/jobs/download_voice", post(jobs::submit_download_voice))
        .route("/jobs/train_voice", post(jobs::submit_train_voice))
        .route("/jobs/status", get(jobs::list_jobs))
        .route("/jobs/cleanup", delete(jobs::cleanup))
        .route("/jobs", delete(jobs::cancel_all))
        .route("/jobs/:job_id", get(jobs::job_status))
        .route("/jobs/:job_id", delete(jobs::cancel_job))
        .route("/workflow/research", post(workflow::run_research))
        .route("/workflow/:execution_id/status", get(workflow::status))
        .route("/workflow/:execution_id/events", get(workflow::events))
        .route("/workflow/:execution_id/pause", post(workflow::pause))
        .route("/workflow/:execution_id/resume", post(workflow::resume))
        .route("/workflow/:execution_id/modify", post(workflow::modify))
        .route("/workflow/:execution_id/skip", post(workflow::skip))
        .route("/status", get(status::status))
        .route("/models", get(status::models))
        .route("/voices", get(status::voices))
        .route("/v1/chat/completions", post(compat::chat_completions))
        .route("/v1/audio/speech", post(compat::audio_speech))
        .route("/v1/audio/transcriptions", post(compat::audio_transcriptions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
