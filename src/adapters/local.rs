//! Local inference adapter (Ollama, LM Studio).
//!
//! Both ship an OpenAI-compatible `/v1/chat/completions` endpoint, so this
//! adapter is intentionally thin — it delegates to the same passthrough path
//! but skips auth entirely and probes the server root for liveness (Ollama's
//! `/` answers `"Ollama is running"`, which `/v1/models` does not guarantee
//! across local servers).

use std::{collections::HashMap, time::Duration};

use reqwest::Client;
use serde_json::Value;

use super::{DiscoveredModel, OpenAIAdapter, SseStream};
use crate::error::UpstreamError;

/// Adapter for a locally-running OpenAI-compatible server.
pub struct LocalAdapter {
    inner: OpenAIAdapter,
    probe_client: Client,
    base_url: String,
}

impl LocalAdapter {
    /// Build a local adapter. No API key is used.
    pub fn new(base_url: String, timeout_ms: u64) -> Self {
        let probe_client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        let inner = OpenAIAdapter::new(base_url.clone(), timeout_ms, None, &HashMap::new());
        Self { inner, probe_client, base_url }
    }

    pub async fn chat(&self, body: Value) -> Result<Value, UpstreamError> {
        self.inner.chat(body).await
    }

    pub async fn chat_stream(&self, body: Value) -> Result<SseStream, UpstreamError> {
        self.inner.chat_stream(body).await
    }

    pub async fn list_models(&self) -> Result<Vec<DiscoveredModel>, UpstreamError> {
        self.inner.list_models().await
    }

    /// Probe the server root (`GET /`).
    pub async fn health_check(&self) -> Result<(), UpstreamError> {
        let url = format!("{}/", self.base_url);
        let response = self.probe_client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::http(status.as_u16(), "health check failed".to_string()));
        }
        Ok(())
    }
}
