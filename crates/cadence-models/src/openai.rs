//! OpenAI-compatible provider implementation.
//!
//! Works against any endpoint that speaks the OpenAI chat completions wire
//! format (OpenAI, vLLM, LocalAI, LM Studio, Ollama's `/v1` shim).

use async_trait::async_trait;
use bytes::Bytes;
use cadence_abstraction::{
    ChunkStream, CompletionRequest, CompletionResponse, HealthStatus, ProviderAdapter,
    ProviderError, StreamChunk, TokenUsage,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, error};

/// Default base URL for the hosted OpenAI API.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    /// Name this provider is registered under.
    name: String,
    /// The model ID (e.g., "gpt-4o-mini").
    model: String,
    /// The base URL, without a trailing slash.
    base_url: String,
    /// Optional bearer token.
    api_key: Option<String>,
    /// HTTP client for making requests.
    client: Client,
}

impl OpenAiCompatibleProvider {
    /// Creates a new provider.
    ///
    /// # Arguments
    /// * `name` - Registry name
    /// * `model` - Default model ID
    /// * `base_url` - API base URL (e.g., "http://localhost:8000/v1")
    pub fn new(name: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            client: Client::new(),
        }
    }

    /// Sets the API key sent as a bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(format!("{}/{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn chat_body(&self, request: &CompletionRequest, stream: bool) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage { role: "system".to_string(), content: system.clone() });
        }
        messages.push(ChatMessage { role: "user".to_string(), content: request.prompt.clone() });

        ChatRequest {
            model: request.model_hint.clone().unwrap_or_else(|| self.model.clone()),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        }
    }

    fn network_error(&self, e: &reqwest::Error) -> ProviderError {
        error!(provider = %self.name, error = %e, "Failed to reach OpenAI-compatible API");
        ProviderError::Network { provider: self.name.clone(), message: e.to_string() }
    }

    async fn status_error(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = response.text().await.unwrap_or_default();
        error!(provider = %self.name, status, body = %body, "OpenAI-compatible API returned error status");

        match ProviderError::from_status(&self.name, status, &body) {
            ProviderError::RateLimited { provider, .. } => {
                ProviderError::RateLimited { provider, retry_after_ms }
            }
            other => other,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        debug!(provider = %self.name, prompt_len = request.prompt.len(), "Sending chat completion");

        let started = Instant::now();
        let response = self
            .post("chat/completions")
            .json(&self.chat_body(request, false))
            .send()
            .await
            .map_err(|e| self.network_error(&e))?;

        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                provider: self.name.clone(),
                message: format!("Failed to parse response: {e}"),
            }
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: self.name.clone(),
                message: "No content in API response".to_string(),
            })?;

        Ok(CompletionResponse {
            text,
            usage: parsed.usage.map(Into::into),
            provider: self.name.clone(),
            model: parsed.model.or_else(|| Some(self.model.clone())),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        debug!(provider = %self.name, "Opening streaming chat completion");

        let response = self
            .post("chat/completions")
            .json(&self.chat_body(request, true))
            .send()
            .await
            .map_err(|e| self.network_error(&e))?;

        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }

        Ok(sse_chunks(self.name.clone(), response.bytes_stream().boxed()))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .post("embeddings")
            .json(&EmbeddingRequest { model: self.model.clone(), input: text.to_string() })
            .send()
            .await
            .map_err(|e| self.network_error(&e))?;

        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                provider: self.name.clone(),
                message: format!("Failed to parse embedding response: {e}"),
            }
        })?;

        parsed.data.into_iter().next().map(|d| d.embedding).ok_or_else(|| {
            ProviderError::InvalidResponse {
                provider: self.name.clone(),
                message: "No embedding in API response".to_string(),
            }
        })
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let mut builder = self.client.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => {
                HealthStatus::healthy(started.elapsed().as_millis() as u64)
            }
            Ok(response) => HealthStatus::unhealthy(
                started.elapsed().as_millis() as u64,
                format!("HTTP {}", response.status().as_u16()),
            ),
            Err(e) => HealthStatus::unhealthy(started.elapsed().as_millis() as u64, e.to_string()),
        }
    }
}

/// Incremental parser state for a server-sent event body.
struct SseState {
    provider: String,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: String,
    pending: VecDeque<Result<StreamChunk, ProviderError>>,
    finished: bool,
    saw_done: bool,
}

impl SseState {
    /// Moves every complete event in the buffer into `pending`.
    fn drain_events(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..pos + 2).collect();
            self.parse_event(&event);
        }
    }

    fn parse_event(&mut self, event: &str) {
        for line in event.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.pending.push_back(Ok(StreamChunk {
                    delta: String::new(),
                    done: true,
                    usage: None,
                }));
                self.saw_done = true;
                self.finished = true;
                return;
            }

            match serde_json::from_str::<StreamingChunk>(data) {
                Ok(chunk) => {
                    let delta = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .unwrap_or_default();
                    let usage = chunk.usage.map(Into::into);
                    if !delta.is_empty() || usage.is_some() {
                        self.pending.push_back(Ok(StreamChunk { delta, done: false, usage }));
                    }
                }
                Err(e) => {
                    debug!(provider = %self.provider, error = %e, "Skipping unparseable SSE chunk");
                }
            }
        }
    }
}

fn sse_chunks(
    provider: String,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
) -> ChunkStream {
    let state = SseState {
        provider,
        body,
        buffer: String::new(),
        pending: VecDeque::new(),
        finished: false,
        saw_done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&bytes).replace("\r\n", "\n"));
                    st.drain_events();
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.pending.push_back(Err(ProviderError::Network {
                        provider: st.provider.clone(),
                        message: format!("Stream interrupted: {e}"),
                    }));
                }
                None => {
                    st.finished = true;
                    if !st.buffer.trim().is_empty() {
                        let rest = std::mem::take(&mut st.buffer);
                        st.parse_event(&rest);
                    }
                    if !st.saw_done {
                        st.pending.push_back(Ok(StreamChunk {
                            delta: String::new(),
                            done: true,
                            usage: None,
                        }));
                    }
                }
            }
        }
    })
    .boxed()
}

// OpenAI API request/response structures

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamingChunk {
    #[serde(default)]
    choices: Vec<StreamingChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamingChoice {
    delta: StreamingDelta,
}

#[derive(Debug, Deserialize)]
struct StreamingDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[allow(clippy::struct_field_names)] // Matches API naming
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for TokenUsage {
    fn from(u: ApiUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let provider = OpenAiCompatibleProvider::new("local", "llama3", "http://localhost:8000/v1/");
        assert_eq!(provider.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn test_chat_body_includes_system_message() {
        let provider = OpenAiCompatibleProvider::new("local", "llama3", DEFAULT_BASE_URL);
        let request = CompletionRequest::new("hi").with_system("be brief");
        let body = provider.chat_body(&request, false);
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.model, "llama3");
    }

    #[test]
    fn test_chat_body_prefers_model_hint() {
        let provider = OpenAiCompatibleProvider::new("local", "llama3", DEFAULT_BASE_URL);
        let request = CompletionRequest::new("hi").with_model_hint("qwen2");
        assert_eq!(provider.chat_body(&request, true).model, "qwen2");
    }

    #[tokio::test]
    async fn test_sse_parser_handles_split_events() {
        let parts: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n")),
            Ok(Bytes::from("\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n")),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ];
        let chunks: Vec<_> =
            sse_chunks("local".to_string(), futures::stream::iter(parts).boxed()).collect().await;

        let deltas: Vec<String> =
            chunks.iter().map(|c| c.as_ref().unwrap().delta.clone()).collect();
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string(), String::new()]);
        assert!(chunks.last().unwrap().as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_sse_parser_terminates_without_done_marker() {
        let parts: Vec<reqwest::Result<Bytes>> =
            vec![Ok(Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}"))];
        let chunks: Vec<_> =
            sse_chunks("local".to_string(), futures::stream::iter(parts).boxed()).collect().await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().delta, "x");
        assert!(chunks[1].as_ref().unwrap().done);
    }
}
