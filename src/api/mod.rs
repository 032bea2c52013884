//! HTTP surface: data-plane routes, dialect translation, admin routes, and
//! the middleware stack (request ids, client auth, admin auth).

pub mod admin;
pub mod admin_auth;
pub mod auth;
pub mod client;
pub mod dialects;
pub mod request_id;

use std::sync::Arc;

use axum::Router;

use crate::state::RouterState;

/// Assemble the full application router.
///
/// Client auth guards the data endpoints only; `/admin` has its own token
/// middleware. The request-id layer wraps everything.
pub fn router(state: Arc<RouterState>) -> Router {
    let data = client::router(Arc::clone(&state)).layer(axum::middleware::from_fn_with_state(
        Arc::clone(&state),
        auth::client_auth_middleware,
    ));
    let admin = admin::router(Arc::clone(&state)).layer(axum::middleware::from_fn_with_state(
        Arc::clone(&state),
        admin_auth::admin_auth_middleware,
    ));

    data.merge(admin)
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
}
