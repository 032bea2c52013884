//! Operator-facing introspection and control endpoints under `/admin`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{cost, score::Strategy, state::RouterState};

/// Build the admin router.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/admin/routing/strategy", get(get_strategy).post(set_strategy))
        .route("/admin/stats", get(stats))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/blacklist", get(blacklist))
        .route("/admin/blacklist/clear/{channel_id}", post(clear_blacklist))
        .with_state(state)
}

/// `GET /admin/routing/strategy`
async fn get_strategy(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(json!({ "strategy": state.active_strategy().to_string() }))
}

/// `POST /admin/routing/strategy` — `{"strategy": "speed_optimized"}`
async fn set_strategy(
    State(state): State<Arc<RouterState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(requested) = body["strategy"].as_str() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": "`strategy` is required", "type": "invalid_request", "code": "invalid_request" } })),
        );
    };
    match Strategy::parse(requested) {
        Some(strategy) => {
            state.set_strategy(strategy);
            tracing::info!(%strategy, "routing strategy switched");
            (StatusCode::OK, Json(json!({ "strategy": strategy.to_string() })))
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": format!("unknown strategy `{requested}`"), "type": "invalid_request", "code": "invalid_request" } })),
        ),
    }
}

/// `GET /admin/stats` — session totals, channel health, index and catalog stats.
async fn stats(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let config = state.config();
    let index_stats = state.index().stats();
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "strategy": state.active_strategy().to_string(),
        "session": {
            "total_requests": state.session.total_requests(),
            "total_cost": cost::format_usd(state.session.total_cost_usd()),
        },
        "channels": {
            "configured": config.channels.len(),
            "enabled": config.channels.iter().filter(|c| c.enabled).count(),
            "health": state.stats.snapshot(),
        },
        "tag_index": {
            "total_tags": index_stats.total_tags,
            "total_models": index_stats.total_models,
        },
        "catalogs": state.catalog.key_summaries(),
    }))
}

/// `GET /admin/cache/stats`
async fn cache_stats(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(json!(state.cache.stats().await))
}

/// `GET /admin/blacklist` — currently active entries.
async fn blacklist(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let entries = state.blacklist.active_entries().await;
    Json(json!({ "count": entries.len(), "entries": entries }))
}

/// `POST /admin/blacklist/clear/{channel_id}` — operator reset. Also drops
/// cached selections naming the channel so the next request re-routes fresh.
async fn clear_blacklist(
    State(state): State<Arc<RouterState>>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    let removed = state.blacklist.clear_channel(&channel_id).await;
    let invalidated = state.cache.invalidate_channel(&channel_id).await;
    tracing::info!(channel = %channel_id, removed, invalidated, "blacklist cleared by operator");
    Json(json!({ "channel_id": channel_id, "removed": removed, "cache_invalidated": invalidated }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::test_support::{config, state};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<RouterState>) {
        let st = state(config(vec![], vec![]));
        (router(Arc::clone(&st)), st)
    }

    async fn get_json(app: Router, uri: &str) -> Value {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn strategy_round_trip() {
        let (app_router, st) = app();
        let body = get_json(app_router.clone(), "/admin/routing/strategy").await;
        assert_eq!(body["strategy"], "free_first");

        let resp = app_router
            .clone()
            .oneshot(
                Request::post("/admin/routing/strategy")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"strategy":"speed_optimized"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(st.active_strategy(), Strategy::SpeedOptimized);
    }

    #[tokio::test]
    async fn unknown_strategy_is_rejected() {
        let (app_router, st) = app();
        let resp = app_router
            .oneshot(
                Request::post("/admin/routing/strategy")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"strategy":"best_of_n"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(st.active_strategy(), Strategy::FreeFirst);
    }

    // S5 tail: the blacklist endpoint shows a channel-wide entry and the
    // operator reset removes it.
    #[tokio::test]
    async fn blacklist_listing_and_clear() {
        let (app_router, st) = app();
        st.blacklist
            .record_failure("ch-a", "some-model", ErrorKind::AuthFatal)
            .await;

        let body = get_json(app_router.clone(), "/admin/blacklist").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["model_id"], "*");
        assert_eq!(body["entries"][0]["last_error_kind"], "auth_fatal");

        let resp = app_router
            .clone()
            .oneshot(
                Request::post("/admin/blacklist/clear/ch-a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!st.blacklist.is_blocked("ch-a", "some-model").await);

        let body = get_json(app_router, "/admin/blacklist").await;
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn cache_stats_expose_counters() {
        let (app_router, st) = app();
        st.cache.get("missing").await;
        let body = get_json(app_router, "/admin/cache/stats").await;
        assert_eq!(body["misses"], 1);
        assert_eq!(body["size"], 0);
        assert_eq!(body["max_entries"], 1000);
    }

    #[tokio::test]
    async fn stats_report_session_and_index() {
        let (app_router, st) = app();
        st.session.record(0.25);
        let body = get_json(app_router, "/admin/stats").await;
        assert_eq!(body["session"]["total_requests"], 1);
        assert_eq!(body["session"]["total_cost"], "$0.250000");
        assert_eq!(body["strategy"], "free_first");
    }
}
