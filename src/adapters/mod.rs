//! Adapter factory and unified dispatch interface.
//!
//! [`AdapterClient`] is an enum that wraps a concrete provider adapter chosen
//! at construction time from [`AdapterKind`]. All routing code interacts with
//! the same narrow API (`chat`, `chat_stream`, `list_models`, `validate_key`,
//! `health_check`); adapter-specific protocol differences — schema
//! translation, auth headers, endpoint paths, SSE dialects — are fully
//! encapsulated in the adapter modules.
//!
//! Every adapter speaks OpenAI's chat-completions schema to the rest of the
//! gateway, both for buffered responses and for SSE chunks.

mod anthropic;
mod gemini;
mod local;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use local::LocalAdapter;
pub use openai::OpenAIAdapter;

use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::{
    config::{AdapterKind, ChannelConfig, ProviderConfig},
    error::UpstreamError,
};

/// A `Send`-able, heap-allocated SSE byte stream.
///
/// Each item is a chunk of SSE data already translated to the OpenAI wire
/// format, or an upstream error. Adapters never emit the `data: [DONE]`
/// sentinel — termination is owned by the response aggregator.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// A model advertised by an upstream's catalog endpoint.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredModel {
    pub id: String,
    pub context_length: Option<u64>,
    /// Per-token USD prices when the catalog advertises them (OpenRouter does).
    pub prompt_price_per_token: Option<f64>,
    pub completion_price_per_token: Option<f64>,
    pub supports_tools: bool,
    pub supports_vision: bool,
}

/// Result of probing a key against its provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeyInfo {
    pub valid: bool,
    pub model_count: usize,
}

/// Unified upstream client — enum dispatch over concrete provider adapters.
pub enum AdapterClient {
    OpenAI(OpenAIAdapter),
    Anthropic(AnthropicAdapter),
    Gemini(GeminiAdapter),
    Local(LocalAdapter),
}

impl AdapterClient {
    /// Build a client for a channel from its provider config.
    ///
    /// # Errors
    /// Returns an error when the provider requires a key and the channel has
    /// none (Anthropic and Gemini always authenticate).
    pub fn new(provider: &ProviderConfig, channel: &ChannelConfig) -> anyhow::Result<Self> {
        Self::with_key(provider, channel, &channel.api_key)
    }

    /// Build a client bound to a specific key — discovery polls each key of a
    /// channel separately and must not mix their credentials.
    pub fn with_key(
        provider: &ProviderConfig,
        channel: &ChannelConfig,
        api_key: &str,
    ) -> anyhow::Result<Self> {
        let base_url = provider.base_url.trim_end_matches('/').to_string();
        let timeout_ms = channel.timeout_ms;
        let key = (!api_key.is_empty()).then(|| api_key.to_string());

        Ok(match provider.adapter {
            AdapterKind::OpenAI => Self::OpenAI(OpenAIAdapter::new(
                base_url,
                timeout_ms,
                key,
                &provider.default_headers,
            )),
            AdapterKind::Local => Self::Local(LocalAdapter::new(base_url, timeout_ms)),
            AdapterKind::Anthropic => {
                let key = key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "channel `{}`: the Anthropic adapter requires an api_key",
                        channel.id
                    )
                })?;
                Self::Anthropic(AnthropicAdapter::new(
                    base_url,
                    timeout_ms,
                    key,
                    &provider.default_headers,
                ))
            }
            AdapterKind::Gemini => {
                let key = key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "channel `{}`: the Gemini adapter requires an api_key",
                        channel.id
                    )
                })?;
                Self::Gemini(GeminiAdapter::new(base_url, timeout_ms, key))
            }
        })
    }

    /// Forward a chat-completions request (OpenAI shape in, OpenAI shape out).
    ///
    /// The request body should have `model` and `stream` already rewritten by
    /// the failover executor before this is called.
    pub async fn chat(&self, request: Value) -> Result<Value, UpstreamError> {
        match self {
            Self::OpenAI(a) => a.chat(request).await,
            Self::Anthropic(a) => a.chat(request).await,
            Self::Gemini(a) => a.chat(request).await,
            Self::Local(a) => a.chat(request).await,
        }
    }

    /// Forward a streaming request and return an [`SseStream`] of
    /// OpenAI-format chunks. The first byte reaches the caller as soon as the
    /// upstream produces it — nothing is buffered.
    pub async fn chat_stream(&self, request: Value) -> Result<SseStream, UpstreamError> {
        match self {
            Self::OpenAI(a) => a.chat_stream(request).await,
            Self::Anthropic(a) => a.chat_stream(request).await,
            Self::Gemini(a) => a.chat_stream(request).await,
            Self::Local(a) => a.chat_stream(request).await,
        }
    }

    /// Fetch the model catalog this client's key can see.
    pub async fn list_models(&self) -> Result<Vec<DiscoveredModel>, UpstreamError> {
        match self {
            Self::OpenAI(a) => a.list_models().await,
            Self::Anthropic(a) => a.list_models().await,
            Self::Gemini(a) => a.list_models().await,
            Self::Local(a) => a.list_models().await,
        }
    }

    /// Probe the key: valid iff the catalog endpoint accepts it.
    pub async fn validate_key(&self) -> Result<KeyInfo, UpstreamError> {
        match self.list_models().await {
            Ok(models) => Ok(KeyInfo { valid: true, model_count: models.len() }),
            Err(e) if matches!(e.status, Some(401) | Some(403)) => {
                Ok(KeyInfo { valid: false, model_count: 0 })
            }
            Err(e) => Err(e),
        }
    }

    /// Probe the upstream for liveness. Implementation varies by provider.
    pub async fn health_check(&self) -> Result<(), UpstreamError> {
        match self {
            Self::OpenAI(a) => a.health_check().await,
            Self::Anthropic(a) => a.health_check().await,
            Self::Gemini(a) => a.health_check().await,
            Self::Local(a) => a.health_check().await,
        }
    }
}

/// Split a `data:<mime>;base64,<payload>` URI into (mime, payload).
/// Shared by the Anthropic and Gemini request translators.
pub(crate) fn parse_data_uri(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    Some((mime, payload))
}

use futures_util::StreamExt as _;
use tokio_util::{codec::{FramedRead, LinesCodec}, io::StreamReader};

/// Frame an upstream SSE response body into lines.
pub(crate) fn sse_lines(
    response: reqwest::Response,
) -> impl Stream<Item = Result<String, UpstreamError>> + Send {
    let bytes = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    FramedRead::new(StreamReader::new(bytes), LinesCodec::new())
        .map(|r| r.map_err(|e| UpstreamError::protocol(e.to_string())))
}

/// Run a per-line translator over an upstream SSE line stream and expose the
/// translated chunks as an [`SseStream`].
///
/// The translator runs in its own task; dropping the returned stream drops
/// the channel, which stops the task and cancels the upstream request.
pub(crate) fn translate_sse<St, F>(lines: St, mut translate: F) -> SseStream
where
    St: Stream<Item = Result<String, UpstreamError>> + Send + 'static,
    F: FnMut(&str) -> Vec<Bytes> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, UpstreamError>>(16);
    tokio::spawn(async move {
        let mut lines = std::pin::pin!(lines);
        while let Some(item) = lines.next().await {
            match item {
                Ok(line) => {
                    for chunk in translate(&line) {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return; // receiver gone — client disconnected
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Format a single OpenAI-style SSE event.
pub(crate) fn sse_event(payload: &Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn provider(adapter: AdapterKind, base_url: &str) -> ProviderConfig {
        ProviderConfig {
            adapter,
            base_url: base_url.to_string(),
            default_headers: HashMap::new(),
        }
    }

    fn channel(api_key: &str) -> ChannelConfig {
        ChannelConfig {
            id: "test".into(),
            name: "Test".into(),
            provider: "p".into(),
            api_key: api_key.into(),
            api_keys: vec![],
            model: "*".into(),
            tags: vec![],
            priority: None,
            daily_request_limit: None,
            timeout_ms: 5_000,
            retry_budget: None,
            cost_per_1k_input: None,
            cost_per_1k_output: None,
            currency_exchange: None,
            enabled: true,
        }
    }

    fn ok_completion_body() -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "Hello from upstream." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 4, "total_tokens": 9 }
        })
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn openai_adapter_builds_without_key() {
        let p = provider(AdapterKind::OpenAI, "http://localhost:11434");
        assert!(AdapterClient::new(&p, &channel("")).is_ok());
    }

    #[test]
    fn anthropic_adapter_requires_a_key() {
        let p = provider(AdapterKind::Anthropic, "https://api.anthropic.com");
        assert!(AdapterClient::new(&p, &channel("")).is_err());
        assert!(AdapterClient::new(&p, &channel("sk-ant")).is_ok());
    }

    #[test]
    fn gemini_adapter_requires_a_key() {
        let p = provider(AdapterKind::Gemini, "https://generativelanguage.googleapis.com");
        assert!(AdapterClient::new(&p, &channel("")).is_err());
        assert!(AdapterClient::new(&p, &channel("g-key")).is_ok());
    }

    // -----------------------------------------------------------------------
    // Dispatch against a mock upstream
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn chat_returns_parsed_json_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion_body()))
            .mount(&server)
            .await;

        let p = provider(AdapterKind::OpenAI, &server.uri());
        let client = AdapterClient::new(&p, &channel("sk-test")).unwrap();
        let result = client
            .chat(json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
            .await;

        assert!(result.is_ok(), "expected Ok, got: {result:?}");
        assert!(result.unwrap().pointer("/choices/0/message/content").is_some());
    }

    #[tokio::test]
    async fn chat_surfaces_status_and_body_on_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let p = provider(AdapterKind::OpenAI, &server.uri());
        let err = AdapterClient::new(&p, &channel("sk-test"))
            .unwrap()
            .chat(json!({"model": "m", "messages": []}))
            .await
            .unwrap_err();

        assert_eq!(err.status, Some(429));
        assert!(err.message.contains("rate limited"));
    }

    #[tokio::test]
    async fn validate_key_reports_invalid_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let p = provider(AdapterKind::OpenAI, &server.uri());
        let info = AdapterClient::new(&p, &channel("bad-key"))
            .unwrap()
            .validate_key()
            .await
            .unwrap();
        assert!(!info.valid);
        assert_eq!(info.model_count, 0);
    }

    #[tokio::test]
    async fn validate_key_counts_models_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{"id": "a"}, {"id": "b"}]
            })))
            .mount(&server)
            .await;

        let p = provider(AdapterKind::OpenAI, &server.uri());
        let info = AdapterClient::new(&p, &channel("sk-test"))
            .unwrap()
            .validate_key()
            .await
            .unwrap();
        assert!(info.valid);
        assert_eq!(info.model_count, 2);
    }

    // -----------------------------------------------------------------------
    // parse_data_uri
    // -----------------------------------------------------------------------

    #[test]
    fn data_uri_splits_mime_and_payload() {
        let (mime, payload) = parse_data_uri("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(payload, "iVBORw0KGgo=");
    }

    #[test]
    fn non_data_uris_are_rejected() {
        assert!(parse_data_uri("https://example.com/cat.png").is_none());
        assert!(parse_data_uri("data:image/png,notbase64").is_none());
    }
}
