//! Client authentication middleware for the data endpoints.
//!
//! When `[auth]` is enabled with an `api_token`, every data request must
//! present that token. Three header forms are accepted, matching the three
//! inbound dialects: `Authorization: Bearer <token>`, `x-api-key: <token>`
//! (Anthropic clients), and `x-goog-api-key: <token>` (Gemini clients).
//! `/health` is always open.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::RouterError, state::RouterState};

/// Axum middleware enforcing the client API token when auth is enabled.
pub async fn client_auth_middleware(
    State(state): State<Arc<RouterState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = state.config();
    let enabled = config.auth.enabled;
    let Some(expected) = config.auth.api_token.as_deref().filter(|t| !t.is_empty()) else {
        return next.run(req).await;
    };
    if !enabled || req.uri().path() == "/health" {
        return next.run(req).await;
    }

    if presented_token(&req).is_some_and(|token| token == expected) {
        next.run(req).await
    } else {
        RouterError::Unauthorized("valid API token required".into()).into_response()
    }
}

fn presented_token(req: &Request) -> Option<&str> {
    let headers = req.headers();
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .or_else(|| headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()))
}
