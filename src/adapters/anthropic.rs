//! Anthropic Messages API adapter.
//!
//! Translates between the OpenAI chat completions schema (the gateway's
//! canonical shape) and Anthropic's `/v1/messages` API, in both directions
//! and for both buffered and streaming responses.
//!
//! # Protocol differences handled here
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | Messages with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional (`max_tokens`) | **Required** (`max_tokens`) |
//! | Images | `image_url` part with data URI | `image` block with base64 source |
//! | Tools | `tools[].function{parameters}` | `tools[]{input_schema}` |
//! | Tool results | `role: "tool"` message | `tool_result` block in a user turn |
//! | Finish reasons | `"stop"`, `"length"`, `"tool_calls"` | `"end_turn"`, `"max_tokens"`, `"tool_use"` |
//! | Streaming | uniform `chat.completion.chunk` | typed events (`message_start` … `message_stop`) |
//! | Auth header | `Authorization: Bearer …` | `x-api-key: …` |

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{sse_event, sse_lines, translate_sse, DiscoveredModel, SseStream};
use crate::error::UpstreamError;

/// Default max_tokens when the caller omits it. Required by Anthropic.
const DEFAULT_MAX_TOKENS: u64 = 4_096;

/// Anthropic API version header value, used unless the provider config
/// overrides it.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic Messages API.
pub struct AnthropicAdapter {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    /// Build an Anthropic adapter with the given API key.
    pub fn new(
        base_url: String,
        timeout_ms: u64,
        api_key: String,
        default_headers: &HashMap<String, String>,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(&api_key)
                .expect("Anthropic API key contains invalid header characters"),
        );
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        for (name, value) in default_headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .expect("configured header name is invalid");
            let value = header::HeaderValue::from_str(value)
                .expect("configured header value is invalid");
            headers.insert(name, value);
        }

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

    /// Translate and forward to `POST /v1/messages`, then translate back.
    pub async fn chat(&self, request: Value) -> Result<Value, UpstreamError> {
        let mut anthropic_req = to_anthropic(&request)?;
        anthropic_req["stream"] = Value::Bool(false);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self.client.post(&url).json(&anthropic_req).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::protocol(format!("invalid JSON from Anthropic: {e}")))?;
        from_anthropic(&body)
    }

    /// Start a streaming request and translate Anthropic's typed SSE events
    /// into OpenAI `chat.completion.chunk` events on the fly.
    pub async fn chat_stream(&self, request: Value) -> Result<SseStream, UpstreamError> {
        let mut anthropic_req = to_anthropic(&request)?;
        anthropic_req["stream"] = Value::Bool(true);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self.stream_client.post(&url).json(&anthropic_req).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        let mut state = StreamState::default();
        Ok(translate_sse(sse_lines(response), move |line| {
            state.translate_line(line)
        }))
    }

    /// Fetch `GET /v1/models`. Anthropic catalogs carry ids only.
    pub async fn list_models(&self) -> Result<Vec<DiscoveredModel>, UpstreamError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::protocol(format!("invalid JSON from /v1/models: {e}")))?;
        let models = body["data"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|m| m["id"].as_str())
                    .map(|id| DiscoveredModel {
                        id: id.to_string(),
                        supports_tools: true,
                        supports_vision: true,
                        ..DiscoveredModel::default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    /// Probe the catalog endpoint for liveness + auth.
    pub async fn health_check(&self) -> Result<(), UpstreamError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), "health check failed".to_string()));
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Request translation — pub(crate) for unit testing and the inbound dialect
// ──────────────────────────────────────────────────────────────────────────────

/// Convert an OpenAI chat completions request to the Anthropic Messages format.
pub(crate) fn to_anthropic(request: &Value) -> Result<Value, UpstreamError> {
    let model = request["model"]
        .as_str()
        .ok_or_else(|| UpstreamError::protocol("`model` field is required"))?
        .to_string();

    let max_tokens = request["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);

    let raw_messages = request["messages"]
        .as_array()
        .ok_or_else(|| UpstreamError::protocol("`messages` array is required"))?;

    // Anthropic treats system content as a top-level field, not a message role.
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());

    for msg in raw_messages {
        match msg["role"].as_str() {
            Some("system") => {
                if let Some(content) = msg["content"].as_str() {
                    system_parts.push(content.to_string());
                }
            }
            Some("tool") => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg["tool_call_id"],
                    "content": msg["content"],
                });
                // Parallel tool results share one user turn.
                match messages.last_mut() {
                    Some(last)
                        if last["role"] == "user"
                            && last["content"].as_array().is_some_and(|c| {
                                c.iter().all(|b| b["type"] == "tool_result")
                            }) =>
                    {
                        if let Some(content) = last["content"].as_array_mut() {
                            content.push(block);
                        }
                    }
                    _ => messages.push(json!({ "role": "user", "content": [block] })),
                }
            }
            Some("assistant") if msg.get("tool_calls").is_some() => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(text) = msg["content"].as_str() {
                    if !text.is_empty() {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                }
                for call in msg["tool_calls"].as_array().into_iter().flatten() {
                    let input: Value = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .and_then(|args| serde_json::from_str(args).ok())
                        .unwrap_or_else(|| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call["id"],
                        "name": call.pointer("/function/name"),
                        "input": input,
                    }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            _ => {
                let role = msg["role"].as_str().unwrap_or("user");
                let content = translate_content(&msg["content"]);
                messages.push(json!({ "role": role, "content": content }));
            }
        }
    }

    let mut req = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !system_parts.is_empty() {
        req["system"] = Value::String(system_parts.join("\n\n"));
    }

    if let Some(tools) = request["tools"].as_array() {
        let translated: Vec<Value> = tools
            .iter()
            .filter_map(|t| {
                let f = t.get("function")?;
                Some(json!({
                    "name": f["name"],
                    "description": f["description"],
                    "input_schema": f["parameters"],
                }))
            })
            .collect();
        if !translated.is_empty() {
            req["tools"] = Value::Array(translated);
        }
    }

    match &request["tool_choice"] {
        Value::String(s) if s == "auto" => req["tool_choice"] = json!({ "type": "auto" }),
        Value::String(s) if s == "required" => req["tool_choice"] = json!({ "type": "any" }),
        Value::Object(_) => {
            if let Some(name) = request.pointer("/tool_choice/function/name") {
                req["tool_choice"] = json!({ "type": "tool", "name": name });
            }
        }
        _ => {}
    }

    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(top_p) = request["top_p"].as_f64() {
        req["top_p"] = json!(top_p);
    }
    if let Some(stop) = request.get("stop") {
        match stop {
            Value::String(s) => req["stop_sequences"] = json!([s]),
            Value::Array(_) => req["stop_sequences"] = stop.clone(),
            _ => {}
        }
    }

    Ok(req)
}

/// Map one OpenAI message `content` into Anthropic content.
/// Strings pass through; multimodal arrays become typed blocks.
fn translate_content(content: &Value) -> Value {
    match content {
        Value::Array(parts) => {
            let blocks: Vec<Value> = parts
                .iter()
                .filter_map(|part| match part["type"].as_str() {
                    Some("text") => Some(json!({ "type": "text", "text": part["text"] })),
                    Some("image_url") => {
                        let url = part.pointer("/image_url/url")?.as_str()?;
                        match super::parse_data_uri(url) {
                            Some((mime, data)) => Some(json!({
                                "type": "image",
                                "source": { "type": "base64", "media_type": mime, "data": data },
                            })),
                            None => Some(json!({
                                "type": "image",
                                "source": { "type": "url", "url": url },
                            })),
                        }
                    }
                    _ => None,
                })
                .collect();
            Value::Array(blocks)
        }
        other => other.clone(),
    }
}

/// Convert an Anthropic Messages response to the OpenAI schema.
pub(crate) fn from_anthropic(resp: &Value) -> Result<Value, UpstreamError> {
    let blocks = resp["content"]
        .as_array()
        .ok_or_else(|| UpstreamError::protocol("Anthropic response has no `content` array"))?;

    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    let tool_calls: Vec<Value> = blocks
        .iter()
        .filter(|b| b["type"] == "tool_use")
        .map(|b| {
            json!({
                "id": b["id"],
                "type": "function",
                "function": {
                    "name": b["name"],
                    "arguments": b["input"].to_string(),
                },
            })
        })
        .collect();

    let finish_reason = map_stop_reason(resp["stop_reason"].as_str());

    let mut message = json!({ "role": "assistant", "content": text });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
        if text.is_empty() {
            message["content"] = Value::Null;
        }
    }

    let input_tokens = resp.pointer("/usage/input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output_tokens = resp.pointer("/usage/output_tokens").and_then(Value::as_u64).unwrap_or(0);

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": resp["model"],
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

fn map_stop_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        // end_turn, stop_sequence, and anything unrecognised
        _ => "stop",
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Streaming translation
// ──────────────────────────────────────────────────────────────────────────────

/// Accumulated state while translating one Anthropic SSE stream.
#[derive(Default)]
struct StreamState {
    message_id: String,
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: Option<String>,
    /// Anthropic content-block index → OpenAI tool_calls index.
    tool_indices: HashMap<u64, u64>,
}

impl StreamState {
    /// Translate one SSE line into zero or more OpenAI-format events.
    /// `event:` lines carry no payload and are skipped; the `data:` JSON
    /// carries its own `type`.
    fn translate_line(&mut self, line: &str) -> Vec<Bytes> {
        let Some(data) = line.strip_prefix("data: ") else {
            return Vec::new();
        };
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        match event["type"].as_str() {
            Some("message_start") => {
                self.message_id = event
                    .pointer("/message/id")
                    .and_then(Value::as_str)
                    .unwrap_or("msg")
                    .to_string();
                self.model = event
                    .pointer("/message/model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                vec![sse_event(&self.chunk(json!({ "role": "assistant", "content": "" }), None))]
            }
            Some("content_block_start") => {
                let block = &event["content_block"];
                if block["type"] == "tool_use" {
                    let anthropic_idx = event["index"].as_u64().unwrap_or(0);
                    let tool_idx = self.tool_indices.len() as u64;
                    self.tool_indices.insert(anthropic_idx, tool_idx);
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_idx,
                            "id": block["id"],
                            "type": "function",
                            "function": { "name": block["name"], "arguments": "" },
                        }]
                    });
                    vec![sse_event(&self.chunk(delta, None))]
                } else {
                    Vec::new()
                }
            }
            Some("content_block_delta") => match event.pointer("/delta/type").and_then(Value::as_str) {
                Some("text_delta") => {
                    let text = event.pointer("/delta/text").cloned().unwrap_or_default();
                    vec![sse_event(&self.chunk(json!({ "content": text }), None))]
                }
                Some("input_json_delta") => {
                    let anthropic_idx = event["index"].as_u64().unwrap_or(0);
                    let tool_idx = self.tool_indices.get(&anthropic_idx).copied().unwrap_or(0);
                    let partial = event.pointer("/delta/partial_json").cloned().unwrap_or_default();
                    let delta = json!({
                        "tool_calls": [{
                            "index": tool_idx,
                            "function": { "arguments": partial },
                        }]
                    });
                    vec![sse_event(&self.chunk(delta, None))]
                }
                _ => Vec::new(),
            },
            Some("message_delta") => {
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(out) = event.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    self.output_tokens = out;
                }
                Vec::new()
            }
            Some("message_stop") => {
                let finish = map_stop_reason(self.stop_reason.as_deref());
                let mut chunk = self.chunk(json!({}), Some(finish));
                chunk["usage"] = json!({
                    "prompt_tokens": self.input_tokens,
                    "completion_tokens": self.output_tokens,
                    "total_tokens": self.input_tokens + self.output_tokens,
                });
                vec![sse_event(&chunk)]
            }
            _ => Vec::new(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.message_id,
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── to_anthropic ──────────────────────────────────────────────────────────

    #[test]
    fn system_messages_are_hoisted_to_top_level() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [
                { "role": "system", "content": "You are a helpful assistant." },
                { "role": "user",   "content": "Hello" },
            ],
        });
        let out = to_anthropic(&req).unwrap();

        assert_eq!(out["system"], "You are a helpful assistant.");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1, "system message must leave the messages array");
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn multiple_system_messages_are_concatenated() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [
                { "role": "system", "content": "Part one." },
                { "role": "system", "content": "Part two." },
                { "role": "user",   "content": "Hello" },
            ],
        });
        let out = to_anthropic(&req).unwrap();
        assert_eq!(out["system"], "Part one.\n\nPart two.");
    }

    #[test]
    fn max_tokens_defaults_when_absent() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{ "role": "user", "content": "Hi" }],
        });
        let out = to_anthropic(&req).unwrap();
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn caller_max_tokens_is_respected() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 256,
            "messages": [{ "role": "user", "content": "Hi" }],
        });
        let out = to_anthropic(&req).unwrap();
        assert_eq!(out["max_tokens"], 256);
    }

    #[test]
    fn data_uri_image_becomes_base64_source() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "What is this?" },
                    { "type": "image_url",
                      "image_url": { "url": "data:image/png;base64,iVBORw0KGgo=" } },
                ],
            }],
        });
        let out = to_anthropic(&req).unwrap();
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "image");
        assert_eq!(blocks[1]["source"]["type"], "base64");
        assert_eq!(blocks[1]["source"]["media_type"], "image/png");
        assert_eq!(blocks[1]["source"]["data"], "iVBORw0KGgo=");
    }

    #[test]
    fn tools_are_translated_to_input_schema() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{ "role": "user", "content": "weather?" }],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Get the weather",
                    "parameters": { "type": "object", "properties": { "city": { "type": "string" } } },
                },
            }],
        });
        let out = to_anthropic(&req).unwrap();
        let tool = &out["tools"][0];
        assert_eq!(tool["name"], "get_weather");
        assert_eq!(tool["input_schema"]["properties"]["city"]["type"], "string");
    }

    #[test]
    fn tool_result_message_becomes_tool_result_block() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [
                { "role": "user", "content": "weather?" },
                { "role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "get_weather", "arguments": "{\"city\":\"Oslo\"}" },
                }]},
                { "role": "tool", "tool_call_id": "call_1", "content": "cloudy, 4C" },
            ],
        });
        let out = to_anthropic(&req).unwrap();
        let messages = out["messages"].as_array().unwrap();

        let assistant = &messages[1];
        assert_eq!(assistant["content"][0]["type"], "tool_use");
        assert_eq!(assistant["content"][0]["name"], "get_weather");
        assert_eq!(assistant["content"][0]["input"]["city"], "Oslo");

        let result = &messages[2];
        assert_eq!(result["role"], "user");
        assert_eq!(result["content"][0]["type"], "tool_result");
        assert_eq!(result["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn parallel_tool_results_share_one_user_turn() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [
                { "role": "tool", "tool_call_id": "call_1", "content": "a" },
                { "role": "tool", "tool_call_id": "call_2", "content": "b" },
            ],
        });
        let out = to_anthropic(&req).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn string_stop_becomes_stop_sequences() {
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{ "role": "user", "content": "Hi" }],
            "stop": "END",
        });
        let out = to_anthropic(&req).unwrap();
        assert_eq!(out["stop_sequences"], json!(["END"]));
    }

    #[test]
    fn missing_model_or_messages_is_rejected() {
        assert!(to_anthropic(&json!({ "messages": [] })).is_err());
        assert!(to_anthropic(&json!({ "model": "claude-sonnet-4-20250514" })).is_err());
    }

    // ── from_anthropic ────────────────────────────────────────────────────────

    #[test]
    fn end_turn_maps_to_stop() {
        let resp = json!({
            "id": "msg_123",
            "model": "claude-sonnet-4-20250514",
            "content": [{ "type": "text", "text": "Hello!" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        let out = from_anthropic(&resp).unwrap();

        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(out["usage"]["prompt_tokens"], 10);
        assert_eq!(out["usage"]["completion_tokens"], 5);
        assert_eq!(out["usage"]["total_tokens"], 15);
    }

    #[test]
    fn max_tokens_stop_reason_maps_to_length() {
        let resp = json!({
            "id": "msg_456",
            "model": "claude-sonnet-4-20250514",
            "content": [{ "type": "text", "text": "…" }],
            "stop_reason": "max_tokens",
            "usage": { "input_tokens": 100, "output_tokens": 1024 },
        });
        let out = from_anthropic(&resp).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn tool_use_blocks_become_tool_calls() {
        let resp = json!({
            "id": "msg_789",
            "model": "claude-sonnet-4-20250514",
            "content": [{
                "type": "tool_use",
                "id": "toolu_1",
                "name": "get_weather",
                "input": { "city": "Oslo" },
            }],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        let out = from_anthropic(&resp).unwrap();

        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        let call = &out["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["id"], "toolu_1");
        assert_eq!(call["function"]["name"], "get_weather");
        let args: Value =
            serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["city"], "Oslo");
    }

    #[test]
    fn openai_to_anthropic_round_trip_preserves_tools_and_image() {
        // Request-side: tools + base64 image survive the translation there and
        // back in the places the upstream echoes them.
        let req = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "look" },
                    { "type": "image_url",
                      "image_url": { "url": "data:image/jpeg;base64,/9j/4AAQ" } },
                ],
            }],
            "tools": [{
                "type": "function",
                "function": { "name": "lookup", "description": "d", "parameters": { "type": "object" } },
            }],
        });
        let anthropic = to_anthropic(&req).unwrap();
        assert_eq!(anthropic["messages"][0]["content"][1]["source"]["data"], "/9j/4AAQ");
        assert_eq!(anthropic["tools"][0]["name"], "lookup");
        assert_eq!(anthropic["tools"][0]["input_schema"]["type"], "object");
    }

    // ── streaming ─────────────────────────────────────────────────────────────

    fn collect_chunks(state: &mut StreamState, lines: &[&str]) -> Vec<Value> {
        lines
            .iter()
            .flat_map(|l| state.translate_line(l))
            .map(|b| {
                let text = std::str::from_utf8(&b).unwrap();
                let payload = text.strip_prefix("data: ").unwrap().trim_end();
                serde_json::from_str(payload).unwrap()
            })
            .collect()
    }

    #[test]
    fn stream_translates_text_deltas() {
        let mut state = StreamState::default();
        let chunks = collect_chunks(
            &mut state,
            &[
                r#"data: {"type":"message_start","message":{"id":"msg_1","model":"claude-sonnet-4-20250514","usage":{"input_tokens":12}}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
                r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
                r#"data: {"type":"message_stop"}"#,
            ],
        );

        assert_eq!(chunks[0]["object"], "chat.completion.chunk");
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(chunks[2]["choices"][0]["delta"]["content"], "lo");

        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["usage"]["prompt_tokens"], 12);
        assert_eq!(last["usage"]["completion_tokens"], 7);
    }

    #[test]
    fn stream_translates_tool_use_blocks() {
        let mut state = StreamState::default();
        let chunks = collect_chunks(
            &mut state,
            &[
                r#"data: {"type":"message_start","message":{"id":"msg_2","model":"claude-sonnet-4-20250514","usage":{"input_tokens":5}}}"#,
                r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_9","name":"lookup"}}"#,
                r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
                r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
                r#"data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":3}}"#,
                r#"data: {"type":"message_stop"}"#,
            ],
        );

        let start = &chunks[1]["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(start["id"], "toolu_9");
        assert_eq!(start["function"]["name"], "lookup");

        let args: String = chunks[2..4]
            .iter()
            .filter_map(|c| {
                c["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"]
                    .as_str()
                    .map(String::from)
            })
            .collect();
        assert_eq!(args, "{\"q\":\"rust\"}");

        assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn stream_ignores_event_lines_and_blanks() {
        let mut state = StreamState::default();
        assert!(state.translate_line("event: message_start").is_empty());
        assert!(state.translate_line("").is_empty());
        assert!(state.translate_line(": keepalive").is_empty());
    }
}
