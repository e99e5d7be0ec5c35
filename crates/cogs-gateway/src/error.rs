use std::fmt;

/// Error taxonomy for the gateway, propagated as a typed kind plus a human
/// message. Every HTTP handler maps a `GatewayError` to a status code and
/// `error_kind` string; job workers stash the `Display` output in
/// `Job::error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InputInvalid(String),

    #[error("empty input: {0}")]
    InputEmpty(String),

    #[error("voice not found: {0}")]
    VoiceNotFound(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend timed out: {0}")]
    BackendTimeout(String),

    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    #[error("backend returned an unparseable response: {0}")]
    BackendProtocol(String),

    #[error("backend busy loading a different model: {0}")]
    BackendBusy(String),

    #[error("job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("cancel refused without confirmation")]
    JobCancelRefused,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("step failed: {0}")]
    StepFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable tag used as the HTTP `error_kind` field and
    /// in usage-log records.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InputInvalid(_) => "InputInvalid",
            GatewayError::InputEmpty(_) => "InputEmpty",
            GatewayError::VoiceNotFound(_) => "VoiceNotFound",
            GatewayError::ModelNotFound(_) => "ModelNotFound",
            GatewayError::BackendUnavailable(_) => "BackendUnavailable",
            GatewayError::BackendTimeout(_) => "BackendTimeout",
            GatewayError::BackendRejected(_) => "BackendRejected",
            GatewayError::BackendProtocol(_) => "BackendProtocol",
            GatewayError::BackendBusy(_) => "BackendBusy",
            GatewayError::JobAlreadyExists(_) => "JobAlreadyExists",
            GatewayError::JobCancelRefused => "JobCancelRefused",
            GatewayError::JobNotFound(_) => "JobNotFound",
            GatewayError::StepFailed(_) => "StepFailed",
            GatewayError::Timeout(_) => "Timeout",
            GatewayError::Cancelled => "Cancelled",
            GatewayError::Internal(_) => "Internal",
        }
    }

    /// Whether the router is allowed to try an alternate backend after this
    /// error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendUnavailable(_)
                | GatewayError::BackendTimeout(_)
                | GatewayError::BackendProtocol(_)
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("json error: {err}"))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(format!("io error: {err}"))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::BackendTimeout(err.to_string())
        } else {
            GatewayError::BackendUnavailable(err.to_string())
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.error_kind)
    }
}

/// JSON error body shape for synchronous endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error_kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        ErrorBody {
            status: "error",
            error_kind: err.kind().to_string(),
            message: err.to_string(),
            context: None,
        }
    }
}
