//! Data-plane API: chat completions (three dialects), model listing, health.
//!
//! Handlers are a thin layer: dialect translation at the edges, then the
//! common pipeline — parse routing request → find candidates → failover →
//! aggregate. All routing logic lives in [`crate::finder`] and
//! [`crate::failover`].

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{dialects, request_id::RequestId};
use crate::{
    aggregator::{self, ClientStream, RequestMeta},
    cost,
    error::RouterError,
    failover,
    finder::{self, Candidate, RouteRequest},
    pricing::ResolvedPricing,
    state::RouterState,
};

/// Build the data-plane router.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1beta/models/{model_call}", post(gemini_generate))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
    }))
}

/// One routed response, before dialect-specific re-shaping.
enum Routed {
    Buffered(Value, RequestMeta),
    Streaming(ClientStream, Vec<(&'static str, String)>),
}

/// The common pipeline: parse → find → failover → aggregate.
async fn route_openai(
    state: &Arc<RouterState>,
    request_id: String,
    body: &Value,
) -> Result<Routed, RouterError> {
    let config = state.config();
    let req = RouteRequest::from_body(body, &config, state.active_strategy())?;
    let candidates = finder::find_candidates(state, &req).await?;
    let est_prompt = cost::estimate_prompt_tokens(&req.messages, config.gateway.image_tokens);

    if req.stream {
        let (stream, outcome) = failover::execute_stream(state, &req, body, candidates).await?;
        let meta = RequestMeta::from_outcome(request_id, &req, &outcome);
        let headers = meta.headers();
        let (pricing, fx_rate) = resolve_pricing(state, &outcome.candidate);
        let client_stream = aggregator::finalize_stream(
            Arc::clone(state),
            stream,
            meta,
            est_prompt,
            pricing,
            fx_rate,
        );
        Ok(Routed::Streaming(client_stream, headers))
    } else {
        let (mut response, outcome) = failover::execute(state, &req, body, candidates).await?;
        let mut meta = RequestMeta::from_outcome(request_id, &req, &outcome);
        let (pricing, fx_rate) = resolve_pricing(state, &outcome.candidate);
        aggregator::finalize_buffered(state, &mut response, &mut meta, est_prompt, &pricing, fx_rate);
        Ok(Routed::Buffered(response, meta))
    }
}

/// Re-resolve the winning candidate's pricing for post-hoc cost accounting.
fn resolve_pricing(state: &RouterState, candidate: &Candidate) -> (ResolvedPricing, f64) {
    let config = state.config();
    match config.channel(&candidate.channel_id) {
        Some(channel) => {
            let discovered = state
                .catalog
                .discovered_pricing(&candidate.channel_id, &candidate.model_id);
            let resolved = state.pricing.resolve(
                &channel.provider,
                &candidate.model_id,
                channel.cost_override(),
                discovered.as_ref(),
                0,
                0,
            );
            (resolved, channel.fx_rate())
        }
        None => (
            state.pricing.resolve("", &candidate.model_id, None, None, 0, 0),
            1.0,
        ),
    }
}

fn request_id_of(ext: Option<&Extension<RequestId>>) -> String {
    ext.map(|Extension(RequestId(id))| id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn json_with_headers(
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Value,
) -> Response {
    let mut response = (status, Json(body)).into_response();
    for (name, value) in headers {
        if let Ok(v) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, v);
        }
    }
    response
}

fn sse_response(stream: ClientStream, headers: Vec<(&'static str, String)>) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    for (name, value) in headers {
        if let Ok(v) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, v);
        }
    }
    response
}

/// `POST /v1/chat/completions` — the canonical dialect.
async fn chat_completions(
    State(state): State<Arc<RouterState>>,
    request_id: Option<Extension<RequestId>>,
    Json(body): Json<Value>,
) -> Result<Response, RouterError> {
    let id = request_id_of(request_id.as_ref());
    match route_openai(&state, id, &body).await? {
        Routed::Buffered(response, meta) => {
            Ok(json_with_headers(StatusCode::OK, meta.headers(), response))
        }
        Routed::Streaming(stream, headers) => Ok(sse_response(stream, headers)),
    }
}

/// `POST /v1/messages` — Anthropic Messages dialect.
///
/// Streaming requests are answered as OpenAI-format SSE by the same pipeline;
/// buffered responses are translated back into the Anthropic shape.
async fn messages(
    State(state): State<Arc<RouterState>>,
    request_id: Option<Extension<RequestId>>,
    Json(body): Json<Value>,
) -> Result<Response, RouterError> {
    let id = request_id_of(request_id.as_ref());
    let openai_body = dialects::anthropic_request_to_openai(&body)?;
    match route_openai(&state, id, &openai_body).await? {
        Routed::Buffered(response, meta) => Ok(json_with_headers(
            StatusCode::OK,
            meta.headers(),
            dialects::openai_response_to_anthropic(&response),
        )),
        Routed::Streaming(stream, headers) => Ok(sse_response(stream, headers)),
    }
}

/// `POST /v1beta/models/{model}:generateContent` and `:streamGenerateContent`
/// — Gemini dialect. The model and action both come from the path segment.
async fn gemini_generate(
    State(state): State<Arc<RouterState>>,
    request_id: Option<Extension<RequestId>>,
    Path(model_call): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, RouterError> {
    let (model, action) = model_call.split_once(':').ok_or_else(|| {
        RouterError::InvalidRequest("expected {model}:generateContent".into())
    })?;
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(RouterError::InvalidRequest(format!("unknown action `{other}`")));
        }
    };

    let id = request_id_of(request_id.as_ref());
    let mut openai_body = dialects::gemini_request_to_openai(model, &body)?;
    openai_body["stream"] = json!(stream);

    match route_openai(&state, id, &openai_body).await? {
        Routed::Buffered(response, meta) => Ok(json_with_headers(
            StatusCode::OK,
            meta.headers(),
            dialects::openai_response_to_gemini(&response),
        )),
        Routed::Streaming(stream, headers) => Ok(sse_response(stream, headers)),
    }
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    /// Comma-separated tag list; every tag must be present.
    #[serde(default)]
    tags: Option<String>,
    /// Comma-separated capability list; every capability must be present.
    #[serde(default)]
    capabilities: Option<String>,
    #[serde(default)]
    sort_by: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    100
}

/// `GET /v1/models` — models aggregated across enabled channels, one row per
/// model id with the channels that serve it.
async fn list_models(
    State(state): State<Arc<RouterState>>,
    Query(q): Query<ModelsQuery>,
) -> impl IntoResponse {
    let config = state.config();
    let index = state.index();

    let mut by_model: std::collections::BTreeMap<String, Value> = std::collections::BTreeMap::new();
    for record in state.catalog.all_records() {
        let Some(channel) = config.channel(&record.channel_id) else { continue };
        if !channel.enabled {
            continue;
        }
        if let Some(provider) = &q.provider {
            if &channel.provider != provider {
                continue;
            }
        }
        if let Some(search) = &q.search {
            if !record.model_id.to_lowercase().contains(&search.to_lowercase()) {
                continue;
            }
        }

        let all_tags = index.tags_of(&record.channel_id, &record.model_id);
        if let Some(required) = &q.tags {
            let wanted: Vec<&str> = required.split(',').map(str::trim).collect();
            if !wanted.iter().all(|t| all_tags.iter().any(|have| have == t)) {
                continue;
            }
        }
        if let Some(required) = &q.capabilities {
            let wanted: Vec<_> = required
                .split(',')
                .filter_map(crate::catalog::Capability::parse)
                .collect();
            if !wanted.iter().all(|c| record.capabilities.contains(c)) {
                continue;
            }
        }

        let entry = by_model.entry(record.model_id.clone()).or_insert_with(|| {
            json!({
                "id": record.model_id,
                "object": "model",
                "owned_by": channel.provider,
                "context_length": record.context_length,
                "capabilities": record.capabilities,
                "tags": all_tags,
                "channels": [],
            })
        });
        if let Some(channels) = entry["channels"].as_array_mut() {
            channels.push(json!(record.channel_id));
        }
    }

    let mut rows: Vec<Value> = by_model.into_values().collect();
    if q.sort_by.as_deref() == Some("context_length") {
        rows.sort_by_key(|r| std::cmp::Reverse(r["context_length"].as_u64().unwrap_or(0)));
    }
    let total = rows.len();
    let rows: Vec<Value> = rows.into_iter().skip(q.offset).take(q.limit).collect();

    Json(json!({ "object": "list", "total": total, "data": rows }))
}
