//! Google Gemini `generateContent` adapter.
//!
//! Translates between the OpenAI chat completions schema and Gemini's
//! `/v1beta/models/{model}:generateContent` API.
//!
//! # Protocol differences handled here
//!
//! | Concern | OpenAI | Gemini |
//! |---|---|---|
//! | Roles | `user` / `assistant` | `user` / `model` |
//! | System prompt | `role: "system"` messages | top-level `systemInstruction` |
//! | Content | string or typed parts | `parts[]` (`text`, `inline_data`) |
//! | Tools | `tools[].function` | `tools[0].functionDeclarations` |
//! | Tool results | `role: "tool"` message | `functionResponse` part |
//! | Tuning | `max_tokens`, `temperature`, `stop` | `generationConfig` |
//! | Auth | `Authorization: Bearer …` | `x-goog-api-key: …` |

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use reqwest::{header, Client};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{sse_event, sse_lines, translate_sse, DiscoveredModel, SseStream};
use crate::error::UpstreamError;

/// Adapter for the Gemini generateContent API.
pub struct GeminiAdapter {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    base_url: String,
}

impl GeminiAdapter {
    /// Build a Gemini adapter with the given API key.
    pub fn new(base_url: String, timeout_ms: u64, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-goog-api-key",
            header::HeaderValue::from_str(&api_key)
                .expect("Gemini API key contains invalid header characters"),
        );

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self { client, stream_client, base_url }
    }

    /// Translate and forward to `:generateContent`, then translate back.
    pub async fn chat(&self, request: Value) -> Result<Value, UpstreamError> {
        let model = request_model(&request)?;
        let body = to_gemini(&request)?;
        let url = format!("{}/v1beta/models/{model}:generateContent", self.base_url);

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        let resp: Value = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::protocol(format!("invalid JSON from Gemini: {e}")))?;
        from_gemini(&resp, &model)
    }

    /// Start a streaming request against `:streamGenerateContent?alt=sse` and
    /// translate the chunks into OpenAI `chat.completion.chunk` events.
    pub async fn chat_stream(&self, request: Value) -> Result<SseStream, UpstreamError> {
        let model = request_model(&request)?;
        let body = to_gemini(&request)?;
        let url = format!(
            "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
            self.base_url
        );

        let response = self.stream_client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        let mut state = StreamState::new(model);
        Ok(translate_sse(sse_lines(response), move |line| {
            state.translate_line(line)
        }))
    }

    /// Fetch `GET /v1beta/models`, keeping only chat-capable entries.
    pub async fn list_models(&self) -> Result<Vec<DiscoveredModel>, UpstreamError> {
        let url = format!("{}/v1beta/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::protocol(format!("invalid JSON from /v1beta/models: {e}")))?;

        let models = body["models"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|m| {
                        m["supportedGenerationMethods"]
                            .as_array()
                            .is_some_and(|methods| {
                                methods.iter().any(|v| v == "generateContent")
                            })
                    })
                    .filter_map(|m| {
                        let name = m["name"].as_str()?;
                        Some(DiscoveredModel {
                            id: name.strip_prefix("models/").unwrap_or(name).to_string(),
                            context_length: m["inputTokenLimit"].as_u64(),
                            supports_tools: true,
                            supports_vision: true,
                            ..DiscoveredModel::default()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    /// Probe the catalog endpoint for liveness + auth.
    pub async fn health_check(&self) -> Result<(), UpstreamError> {
        let url = format!("{}/v1beta/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), "health check failed".to_string()));
        }
        Ok(())
    }
}

fn request_model(request: &Value) -> Result<String, UpstreamError> {
    request["model"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| UpstreamError::protocol("`model` field is required"))
}

// ──────────────────────────────────────────────────────────────────────────────
// Request translation — pub(crate) for unit testing and the inbound dialect
// ──────────────────────────────────────────────────────────────────────────────

/// Convert an OpenAI chat completions request to the Gemini body.
pub(crate) fn to_gemini(request: &Value) -> Result<Value, UpstreamError> {
    let raw_messages = request["messages"]
        .as_array()
        .ok_or_else(|| UpstreamError::protocol("`messages` array is required"))?;

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::with_capacity(raw_messages.len());
    // tool_call_id → function name, needed to shape functionResponse parts.
    let mut call_names: HashMap<String, String> = HashMap::new();

    for msg in raw_messages {
        match msg["role"].as_str() {
            Some("system") => {
                if let Some(text) = msg["content"].as_str() {
                    system_parts.push(json!({ "text": text }));
                }
            }
            Some("assistant") => {
                let mut parts = content_parts(&msg["content"]);
                for call in msg["tool_calls"].as_array().into_iter().flatten() {
                    let name = call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if let Some(id) = call["id"].as_str() {
                        call_names.insert(id.to_string(), name.clone());
                    }
                    let args: Value = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .and_then(|a| serde_json::from_str(a).ok())
                        .unwrap_or_else(|| json!({}));
                    parts.push(json!({ "functionCall": { "name": name, "args": args } }));
                }
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            Some("tool") => {
                let name = msg["tool_call_id"]
                    .as_str()
                    .and_then(|id| call_names.get(id).cloned())
                    .unwrap_or_default();
                let response = match &msg["content"] {
                    Value::String(s) => serde_json::from_str::<Value>(s)
                        .unwrap_or_else(|_| json!({ "result": s })),
                    other => other.clone(),
                };
                contents.push(json!({
                    "role": "user",
                    "parts": [{ "functionResponse": { "name": name, "response": response } }],
                }));
            }
            _ => {
                contents.push(json!({ "role": "user", "parts": content_parts(&msg["content"]) }));
            }
        }
    }

    let mut body = json!({ "contents": contents });

    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({ "parts": system_parts });
    }

    if let Some(tools) = request["tools"].as_array() {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|t| {
                let f = t.get("function")?;
                Some(json!({
                    "name": f["name"],
                    "description": f["description"],
                    "parameters": f["parameters"],
                }))
            })
            .collect();
        if !declarations.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
    }

    let mut generation = serde_json::Map::new();
    if let Some(max) = request["max_tokens"].as_u64() {
        generation.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(temp) = request["temperature"].as_f64() {
        generation.insert("temperature".into(), json!(temp));
    }
    if let Some(top_p) = request["top_p"].as_f64() {
        generation.insert("topP".into(), json!(top_p));
    }
    match &request["stop"] {
        Value::String(s) => {
            generation.insert("stopSequences".into(), json!([s]));
        }
        Value::Array(_) => {
            generation.insert("stopSequences".into(), request["stop"].clone());
        }
        _ => {}
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }

    Ok(body)
}

/// Map one OpenAI message `content` into Gemini `parts`.
fn content_parts(content: &Value) -> Vec<Value> {
    match content {
        Value::String(text) => vec![json!({ "text": text })],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part["type"].as_str() {
                Some("text") => Some(json!({ "text": part["text"] })),
                Some("image_url") => {
                    let url = part.pointer("/image_url/url")?.as_str()?;
                    let (mime, data) = super::parse_data_uri(url)?;
                    Some(json!({ "inline_data": { "mime_type": mime, "data": data } }))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Convert a Gemini response to the OpenAI schema.
pub(crate) fn from_gemini(resp: &Value, model: &str) -> Result<Value, UpstreamError> {
    let candidate = resp
        .pointer("/candidates/0")
        .ok_or_else(|| UpstreamError::protocol("Gemini response has no candidates"))?;

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let text: String = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    let tool_calls: Vec<Value> = parts
        .iter()
        .filter_map(|p| p.get("functionCall"))
        .enumerate()
        .map(|(i, call)| {
            json!({
                "id": format!("call_{i}"),
                "type": "function",
                "function": {
                    "name": call["name"],
                    "arguments": call["args"].to_string(),
                },
            })
        })
        .collect();

    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls"
    } else {
        map_finish_reason(candidate["finishReason"].as_str())
    };

    let mut message = json!({ "role": "assistant", "content": text });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
        if text.is_empty() {
            message["content"] = Value::Null;
        }
    }

    let prompt_tokens = resp
        .pointer("/usageMetadata/promptTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion_tokens = resp
        .pointer("/usageMetadata/candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    }))
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") | Some("RECITATION") => "content_filter",
        // STOP and anything unrecognised
        _ => "stop",
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Streaming translation
// ──────────────────────────────────────────────────────────────────────────────

/// State while translating one Gemini SSE stream. Gemini sends full JSON
/// documents per event; text accumulates across `candidates[0].content.parts`.
struct StreamState {
    id: String,
    model: String,
    sent_role: bool,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl StreamState {
    fn new(model: String) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            model,
            sent_role: false,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    fn translate_line(&mut self, line: &str) -> Vec<Bytes> {
        let Some(data) = line.strip_prefix("data: ") else {
            return Vec::new();
        };
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        let mut out = Vec::new();

        if !self.sent_role {
            self.sent_role = true;
            out.push(sse_event(&self.chunk(json!({ "role": "assistant", "content": "" }), None)));
        }

        if let Some(tokens) = event.pointer("/usageMetadata/promptTokenCount").and_then(Value::as_u64) {
            self.prompt_tokens = tokens;
        }
        if let Some(tokens) = event
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(Value::as_u64)
        {
            self.completion_tokens = tokens;
        }

        let text: String = event
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if !text.is_empty() {
            out.push(sse_event(&self.chunk(json!({ "content": text }), None)));
        }

        if let Some(reason) = event.pointer("/candidates/0/finishReason").and_then(Value::as_str) {
            let finish = map_finish_reason(Some(reason));
            let mut chunk = self.chunk(json!({}), Some(finish));
            chunk["usage"] = json!({
                "prompt_tokens": self.prompt_tokens,
                "completion_tokens": self.completion_tokens,
                "total_tokens": self.prompt_tokens + self.completion_tokens,
            });
            out.push(sse_event(&chunk));
        }

        out
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": Utc::now().timestamp(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
