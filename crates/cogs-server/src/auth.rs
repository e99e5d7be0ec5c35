//! Bearer-token auth check, lifted straight from
//! `querymt-service::handle_chat`'s `Authorization: Bearer <key>` gate.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

pub fn check(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(key) = &state.auth_key else {
        return Ok(());
    };

    let Some(value) = headers.get("Authorization") else {
        return Err((StatusCode::UNAUTHORIZED, "missing authorization").into_response());
    };
    let Ok(value) = value.to_str() else {
        return Err((StatusCode::UNAUTHORIZED, "invalid authorization header").into_response());
    };
    if !value.starts_with("Bearer ") || &value[7..] != key {
        return Err((StatusCode::UNAUTHORIZED, "invalid api key").into_response());
    }
    Ok(())
}
