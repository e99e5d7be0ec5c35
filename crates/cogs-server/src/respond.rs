//! Maps a `GatewayError` onto an HTTP status code plus the JSON
//! `ErrorBody` shape. Wrapped in a local newtype since `IntoResponse` and
//! `GatewayError` are both foreign to this crate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cogs_gateway::error::{ErrorBody, GatewayError};

pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::InputInvalid(_) | GatewayError::InputEmpty(_) => StatusCode::BAD_REQUEST,
        GatewayError::VoiceNotFound(_) | GatewayError::ModelNotFound(_) | GatewayError::JobNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        GatewayError::JobAlreadyExists(_) => StatusCode::CONFLICT,
        GatewayError::JobCancelRefused => StatusCode::PRECONDITION_REQUIRED,
        GatewayError::BackendTimeout(_) | GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::BackendUnavailable(_) | GatewayError::BackendBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::BackendRejected(_) | GatewayError::BackendProtocol(_) => StatusCode::BAD_GATEWAY,
        GatewayError::StepFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::Cancelled => StatusCode::CONFLICT,
        GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body: ErrorBody = (&self.0).into();
        (status, Json(body)).into_response()
    }
}
