//! OpenAI-compatible chat completions adapter.
//!
//! Handles any upstream that speaks the OpenAI `/v1/chat/completions`
//! protocol — OpenRouter, SiliconFlow, vLLM, LM Studio, LocalAI, and others.
//! Request bodies are forwarded verbatim; streaming chunks are proxied
//! line-by-line with only the terminal `[DONE]` sentinel stripped (stream
//! termination belongs to the response aggregator).

use std::{collections::HashMap, time::Duration};

use reqwest::{header, Client};
use serde_json::Value;

use super::{sse_lines, translate_sse, DiscoveredModel, SseStream};
use crate::error::UpstreamError;

/// Adapter for any OpenAI-compatible upstream.
///
/// [`Client`] wraps an `Arc` internally, so per-request construction is cheap.
pub struct OpenAIAdapter {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
}

impl OpenAIAdapter {
    /// Build an adapter for the given base URL and optional bearer token.
    pub fn new(
        base_url: String,
        timeout_ms: u64,
        api_key: Option<String>,
        default_headers: &HashMap<String, String>,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = format!("Bearer {key}");
            // Panics on invalid header bytes — surfaces misconfiguration at startup, not at request time.
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("API key contains invalid Authorization header characters"),
            );
        }
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

        // No request-level timeout for streaming — the response body arrives
        // incrementally. TCP connect timeout still applies.
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self { client, stream_client, base_url }
    }

    /// Forward a chat completions request to `POST /v1/chat/completions`.
    pub async fn chat(&self, body: Value) -> Result<Value, UpstreamError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        serde_json::from_str(&text)
            .map_err(|e| UpstreamError::protocol(format!("invalid JSON from upstream: {e}")))
    }

    /// Send a streaming request and return the proxied [`SseStream`].
    ///
    /// Chunks already carry the OpenAI wire format; only the `data: [DONE]`
    /// line is dropped. Uses the no-timeout `stream_client`.
    pub async fn chat_stream(&self, body: Value) -> Result<SseStream, UpstreamError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self.stream_client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::http(status.as_u16(), text));
        }

        Ok(translate_sse(sse_lines(response), |line| {
            if line.trim() == "data: [DONE]" || line.trim().is_empty() {
                Vec::new()
            } else {
                vec![bytes::Bytes::from(format!("{line}\n\n"))]
            }
        }))
    }

    /// Fetch `GET /v1/models` and parse the catalog.
    ///
    /// OpenRouter-style extras (`context_length`, per-token `pricing`,
    /// `supported_parameters`) are picked up when present; a bare OpenAI
    /// catalog yields ids only.
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
            .map(|entries| entries.iter().filter_map(parse_model_entry).collect())
            .unwrap_or_default();
        Ok(models)
    }

    /// Probe the upstream with `GET /v1/models`.
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

fn parse_model_entry(entry: &Value) -> Option<DiscoveredModel> {
    let id = entry["id"].as_str()?.to_string();

    let context_length = entry["context_length"]
        .as_u64()
        .or_else(|| entry.pointer("/top_provider/context_length").and_then(Value::as_u64));

    // OpenRouter quotes per-token prices as decimal strings.
    let price = |field: &str| -> Option<f64> {
        let v = entry.pointer(&format!("/pricing/{field}"))?;
        v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    };

    let supported: Vec<&str> = entry["supported_parameters"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let modalities: Vec<&str> = entry
        .pointer("/architecture/input_modalities")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    Some(DiscoveredModel {
        id,
        context_length,
        prompt_price_per_token: price("prompt"),
        completion_price_per_token: price("completion"),
        supports_tools: supported.contains(&"tools"),
        supports_vision: modalities.contains(&"image"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> OpenAIAdapter {
        OpenAIAdapter::new(server.uri(), 5_000, Some("sk-test".into()), &HashMap::new())
    }

    #[tokio::test]
    async fn chat_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let result = adapter(&server).chat(json!({"model": "m", "messages": []})).await;
        assert!(result.is_ok(), "bearer header missing: {result:?}");
    }

    #[tokio::test]
    async fn chat_stream_strips_done_sentinel() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let mut stream = adapter(&server)
            .chat_stream(json!({"model": "m", "messages": [], "stream": true}))
            .await
            .expect("stream starts");

        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(std::str::from_utf8(&chunk.expect("chunk ok")).unwrap());
        }

        assert!(collected.contains("Hel"));
        assert!(collected.contains("lo"));
        assert!(!collected.contains("[DONE]"), "sentinel must be stripped: {collected}");
    }

    #[tokio::test]
    async fn list_models_parses_openrouter_extras() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    {
                        "id": "qwen/qwen3-30b-a3b:free",
                        "context_length": 131072,
                        "pricing": { "prompt": "0", "completion": "0" },
                        "supported_parameters": ["tools", "temperature"],
                        "architecture": { "input_modalities": ["text", "image"] }
                    },
                    { "id": "plain-model" }
                ]
            })))
            .mount(&server)
            .await;

        let models = adapter(&server).list_models().await.expect("catalog fetch");
        assert_eq!(models.len(), 2);

        let rich = &models[0];
        assert_eq!(rich.id, "qwen/qwen3-30b-a3b:free");
        assert_eq!(rich.context_length, Some(131072));
        assert_eq!(rich.prompt_price_per_token, Some(0.0));
        assert!(rich.supports_tools);
        assert!(rich.supports_vision);

        let plain = &models[1];
        assert_eq!(plain.id, "plain-model");
        assert_eq!(plain.context_length, None);
        assert!(!plain.supports_tools);
    }

    #[tokio::test]
    async fn list_models_propagates_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let err = adapter(&server).list_models().await.unwrap_err();
        assert_eq!(err.status, Some(401));
    }
}
