//! Gateway error taxonomy, upstream error classification, and HTTP mapping.
//!
//! Per-attempt upstream failures are classified into an [`ErrorKind`] which
//! drives blacklisting scope and cooldown; only a terminal [`RouterError`]
//! ever reaches the HTTP layer, where [`IntoResponse`] renders the
//! OpenAI-style error body plus the `X-Router-*` headers.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// Classification of a single upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Key-level failure: bad key, revoked key, exhausted quota. The whole
    /// channel is unusable until an operator or health check resets it.
    AuthFatal,
    RateLimit,
    ModelNotFound,
    ServerTransient,
    Network,
    Unknown,
}

impl ErrorKind {
    /// Severity ranking used to pick the "worst seen" kind across attempts.
    pub fn severity(&self) -> u8 {
        match self {
            Self::AuthFatal => 5,
            Self::ServerTransient => 4,
            Self::Network => 3,
            Self::RateLimit => 2,
            Self::ModelNotFound => 1,
            Self::Unknown => 0,
        }
    }

    /// Status surfaced to the client when every candidate failed with this kind.
    pub fn client_status(&self) -> StatusCode {
        match self {
            Self::AuthFatal | Self::ServerTransient => StatusCode::BAD_GATEWAY,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::ModelNotFound => StatusCode::NOT_FOUND,
            Self::Network => StatusCode::GATEWAY_TIMEOUT,
            Self::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this failure poisons the whole channel rather than one model.
    pub fn is_channel_wide(&self) -> bool {
        matches!(self, Self::AuthFatal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AuthFatal => "auth_fatal",
            Self::RateLimit => "rate_limit",
            Self::ModelNotFound => "model_not_found",
            Self::ServerTransient => "server_transient",
            Self::Network => "network",
            Self::Unknown => "unknown",
        })
    }
}

/// Classify an upstream failure from its HTTP status, body, and transport flag.
///
/// Quota exhaustion counts as auth-fatal because quota is a property of the
/// key, not of one model.
pub fn classify(status: Option<u16>, body: &str, network_error: bool) -> ErrorKind {
    if network_error {
        return ErrorKind::Network;
    }

    let lower = body.to_lowercase();

    if matches!(status, Some(401) | Some(403)) {
        return ErrorKind::AuthFatal;
    }
    if lower.contains("invalid api key") || lower.contains("quota exceeded") {
        return ErrorKind::AuthFatal;
    }

    match status {
        Some(429) | Some(402) => ErrorKind::RateLimit,
        Some(404) => ErrorKind::ModelNotFound,
        Some(s) if (500..600).contains(&s) => ErrorKind::ServerTransient,
        _ if lower.contains("model") && lower.contains("not found") => ErrorKind::ModelNotFound,
        _ => ErrorKind::Unknown,
    }
}

/// An error from one upstream attempt, with enough structure to classify.
#[derive(Debug)]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
    pub network: bool,
}

impl UpstreamError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), message: message.into(), network: false }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into(), network: true }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into(), network: false }
    }

    pub fn kind(&self) -> ErrorKind {
        classify(self.status, &self.message, self.network)
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream HTTP {status}: {}", self.message),
            None if self.network => write!(f, "upstream network error: {}", self.message),
            None => write!(f, "upstream protocol error: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest surfaces connect/DNS/TLS/timeout failures without a status.
        match e.status() {
            Some(status) => Self::http(status.as_u16(), e.to_string()),
            None => Self::network(e.to_string()),
        }
    }
}

/// Terminal gateway error — the only error type HTTP handlers return.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication required: {0}")]
    Unauthorized(String),

    #[error("no channels available for `{0}`")]
    NoChannelsFound(String),

    #[error("all {attempts} candidate(s) failed; last error: {last_error}")]
    AllChannelsFailed {
        worst: ErrorKind,
        attempts: u32,
        last_error: String,
    },

    #[error("stream aborted after first byte: {0}")]
    StreamAborted(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RouterError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NoChannelsFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AllChannelsFailed { worst, .. } => worst.client_status(),
            Self::StreamAborted(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "authentication_error",
            Self::NoChannelsFound(_) => "no_channels",
            Self::AllChannelsFailed { .. } => "all_channels_failed",
            Self::StreamAborted(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    fn code(&self) -> String {
        match self {
            Self::NoChannelsFound(_) => "no_channels".to_string(),
            Self::AllChannelsFailed { worst, .. } => worst.to_string(),
            other => other.error_type().to_string(),
        }
    }

    fn attempts(&self) -> Option<u32> {
        match self {
            Self::AllChannelsFailed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, kind = self.error_type(), "request failed");

        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        });

        let mut response = (self.status(), Json(body)).into_response();
        if let Ok(v) = HeaderValue::from_str(self.error_type()) {
            response.headers_mut().insert("x-router-error-type", v);
        }
        if let Some(attempts) = self.attempts() {
            if let Ok(v) = HeaderValue::from_str(&attempts.to_string()) {
                response.headers_mut().insert("x-router-attempts", v);
            }
        }
        response
    }
}
