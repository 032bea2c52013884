//! Bearer-token authentication middleware for the admin routes.
//!
//! When `[auth.admin]` is enabled, all `/admin/*` routes require
//! `Authorization: Bearer <token>` with the admin token — the client API
//! token does not grant admin access. When admin auth is disabled the
//! middleware is a no-op, which is only acceptable when the gateway is
//! reachable from trusted hosts alone.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::RouterError, state::RouterState};

/// Axum middleware: requires a valid admin bearer token on every admin route
/// when `auth.admin.enabled` is set.
pub async fn admin_auth_middleware(
    State(state): State<Arc<RouterState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = state.config();
    if !config.auth.admin.enabled {
        return next.run(req).await;
    }
    let expected = config.auth.admin.token.as_str();

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => next.run(req).await,
        _ => RouterError::Unauthorized("admin token required".into()).into_response(),
    }
}
