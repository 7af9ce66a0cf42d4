//! OpenRouter HTTP client
//!
//! Provides an async client for the OpenRouter API with:
//! - Chat completions (streaming and non-streaming)
//! - Model fallback chains with automatic retry
//! - Rate limit handling with exponential backoff
//! - Embeddings

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use rand::Rng;
use reqwest::Client as HttpClient;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::streaming::{StreamEvent, drain_lines, parse_sse_line};
use super::types::{
    CompletionOptions, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, LlmResponse, Message,
};

/// OpenRouter API base URL
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Maximum number of attempts for rate-limited requests
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (in milliseconds)
const BACKOFF_BASE_MS: u64 = 1000;

const REFERER: &str = "https://github.com/swarm-router/swarm";
const TITLE: &str = "Swarm";

/// OpenRouter client bound to one API key
#[derive(Clone)]
pub struct LlmClient {
    http_client: HttpClient,
    api_key: String,
    base_url: String,
    defaults: CompletionOptions,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            .field("defaults", &self.defaults)
            .finish()
    }
}

/// Builder for creating an LlmClient
#[derive(Default)]
pub struct LlmClientBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    defaults: CompletionOptions,
}

impl LlmClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the base URL (defaults to OpenRouter)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Sampling defaults for calls that leave an option unset
    pub fn defaults(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.defaults = CompletionOptions::new(temperature, max_tokens);
        self
    }

    pub fn build(self) -> Result<LlmClient> {
        let api_key = self
            .api_key
            .ok_or_else(|| Error::LLMError("API key is required".to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(self.timeout_secs.unwrap_or(120)))
            .build()
            .map_err(Error::NetworkError)?;

        Ok(LlmClient {
            http_client,
            api_key,
            base_url: self
                .base_url
                .unwrap_or_else(|| OPENROUTER_BASE_URL.to_string()),
            defaults: self.defaults,
        })
    }
}

impl LlmClient {
    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(
        &self,
        model: &str,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> CompletionRequest {
        let mut request = CompletionRequest::new(model, messages);
        if let Some(t) = options.temperature.or(self.defaults.temperature) {
            request = request.with_temperature(t);
        }
        if let Some(m) = options.max_tokens.or(self.defaults.max_tokens) {
            request = request.with_max_tokens(m);
        }
        request
    }

    /// Make a chat completion request against a single model
    pub async fn complete(
        &self,
        model: &str,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<LlmResponse> {
        let request = self.build_request(model, messages, options);
        self.execute_request(&request).await
    }

    /// Try each model in order, moving on after rate limits and model errors
    pub async fn complete_with_fallback(
        &self,
        models: &[String],
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<LlmResponse> {
        let mut last_error = None;

        for model in models {
            debug!(model = %model, "Attempting chat completion");

            match self.complete(model, messages.clone(), options).await {
                Ok(response) => {
                    info!(model = %model, tokens = response.tokens_used, "Chat completion successful");
                    return Ok(response);
                }
                Err(Error::RateLimited(secs)) => {
                    warn!(model = %model, wait_secs = secs, "Rate limited, trying next model");
                    last_error = Some(Error::RateLimited(secs));
                }
                Err(Error::LLMError(msg)) if is_model_error(&msg) => {
                    warn!(model = %model, error = %msg, "Model error, trying next model");
                    last_error = Some(Error::LLMError(msg));
                }
                Err(e) => {
                    error!(model = %model, error = %e, "Non-recoverable error");
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::LLMError("No model configured".to_string())))
    }

    /// Stream content fragments from the first model in `models` that accepts the request
    pub async fn complete_streaming(
        &self,
        models: &[String],
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let mut last_error = None;

        for model in models {
            let request = self
                .build_request(model, messages.clone(), options)
                .with_streaming(true);
            match self.open_stream(request).await {
                Ok(stream) => return Ok(stream),
                Err(Error::RateLimited(secs)) => {
                    warn!(model = %model, wait_secs = secs, "Rate limited, trying next model");
                    last_error = Some(Error::RateLimited(secs));
                }
                Err(Error::LLMError(msg)) if is_model_error(&msg) => {
                    warn!(model = %model, error = %msg, "Model error, trying next model");
                    last_error = Some(Error::LLMError(msg));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::LLMError("No model configured".to_string())))
    }

    async fn execute_request(&self, request: &CompletionRequest) -> Result<LlmResponse> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.send_request(request).await {
                Ok(response) => return Ok(response),
                Err(Error::RateLimited(wait_secs)) if attempts < MAX_RETRY_ATTEMPTS => {
                    let backoff = calculate_backoff(attempts, wait_secs);
                    warn!(
                        attempt = attempts,
                        wait_ms = backoff,
                        "Rate limited, retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE)
            .json(body)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();
        if !status.is_success() {
            return handle_error_response(status, response).await;
        }
        Ok(response)
    }

    async fn send_request(&self, request: &CompletionRequest) -> Result<LlmResponse> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self.post("chat/completions", request).await?;
        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::LLMError(format!("Failed to parse response: {}", e)))?;

        LlmResponse::from_completion(completion)
            .ok_or_else(|| Error::LLMError("Empty response from API".to_string()))
    }

    async fn open_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending streaming chat completion request"
        );

        let response = self.post("chat/completions", &request).await?;

        let stream = async_stream::stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            'outer: while let Some(chunk_result) = bytes_stream.next().await {
                match chunk_result {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for line in drain_lines(&mut buffer) {
                            match parse_sse_line(&line) {
                                Some(StreamEvent::Chunk(chunk)) => {
                                    if let Some(content) = chunk.content() {
                                        yield Ok(content.to_string());
                                    }
                                }
                                Some(StreamEvent::Done) => break 'outer,
                                Some(StreamEvent::Error(e)) => {
                                    debug!(error = %e, "Skipping malformed stream chunk");
                                }
                                None => {}
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(Error::NetworkError(e));
                        break;
                    }
                }
            }

            if let Some(StreamEvent::Chunk(chunk)) = parse_sse_line(&buffer)
                && let Some(content) = chunk.content()
            {
                yield Ok(content.to_string());
            }
        };

        Ok(stream.boxed())
    }

    /// Generate an embedding vector for one text
    pub async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>> {
        debug!(model = %model, chars = text.len(), "Sending embedding request");

        let request = EmbeddingRequest::new(model, text);
        let response = self.post("embeddings", &request).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("Failed to parse response: {}", e)))?;

        let data = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingFailed("Empty embedding response".to_string()))?;

        if data.embedding.is_empty() {
            return Err(Error::EmbeddingFailed("Empty embedding vector".to_string()));
        }
        Ok(data.embedding)
    }
}

async fn handle_error_response<T>(
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> Result<T> {
    let body = response.text().await.unwrap_or_default();

    match status.as_u16() {
        401 => Err(Error::LLMError(
            "Unauthorized: Invalid API key. Check OPENROUTER_API_KEY.".to_string(),
        )),
        429 => {
            let wait_secs = extract_retry_after(&body).unwrap_or(60);
            Err(Error::RateLimited(wait_secs))
        }
        400 => Err(Error::LLMError(format!("Bad request: {}", body))),
        402 => Err(Error::LLMError(
            "Payment required: Insufficient credits on OpenRouter account".to_string(),
        )),
        403 => Err(Error::LLMError(format!("Forbidden: {}", body))),
        404 => Err(Error::LLMError(format!(
            "Model not found or endpoint unavailable: {}",
            body
        ))),
        500..=599 => Err(Error::LLMError(format!(
            "Server error ({}): {} - provider unavailable",
            status, body
        ))),
        _ => Err(Error::LLMError(format!("HTTP error {}: {}", status, body))),
    }
}

/// Check if an error message indicates a model-specific error
fn is_model_error(msg: &str) -> bool {
    let model_error_patterns = [
        "model not found",
        "unavailable",
        "not available",
        "no available provider",
        "no endpoints found",
        "overloaded",
        "capacity",
    ];

    let msg_lower = msg.to_lowercase();
    model_error_patterns
        .iter()
        .any(|pattern| msg_lower.contains(pattern))
}

/// Calculate backoff delay with up to 10% random jitter
fn calculate_backoff(attempt: u32, suggested_wait: u64) -> u64 {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
    let delay = base.max(suggested_wait * 1000);

    let jitter = (delay / 10).max(1);
    delay + rand::thread_rng().gen_range(0..jitter)
}

/// Extract retry-after value from error response
fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            json.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|v| v.as_u64())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builder() {
        let client = LlmClient::builder()
            .api_key("test-key")
            .base_url("https://example.com")
            .timeout_secs(60)
            .defaults(0.3, 512)
            .build()
            .unwrap();

        assert_eq!(client.base_url(), "https://example.com");
        let request = client.build_request("m", vec![], CompletionOptions::default());
        assert_eq!(request.temperature, Some(0.3));
        assert_eq!(request.max_tokens, Some(512));
    }

    #[test]
    fn test_call_options_override_defaults() {
        let client = LlmClient::builder()
            .api_key("k")
            .defaults(0.7, 2048)
            .build()
            .unwrap();
        let request = client.build_request("m", vec![], CompletionOptions::new(0.1, 20));
        assert_eq!(request.temperature, Some(0.1));
        assert_eq!(request.max_tokens, Some(20));
    }

    #[test]
    fn test_client_builder_requires_api_key() {
        assert!(LlmClient::builder().build().is_err());
    }

    #[test]
    fn test_client_debug_hides_key() {
        let client = LlmClient::builder().api_key("secret-key").build().unwrap();
        let debug = format!("{:?}", client);
        assert!(debug.contains("LlmClient"));
        assert!(!debug.contains("secret-key"));
    }

    #[test]
    fn test_is_model_error() {
        assert!(is_model_error("Model not found"));
        assert!(is_model_error("No endpoints found for qwen/qwen3"));
        assert!(is_model_error("Server error (503): - provider unavailable"));
        assert!(!is_model_error("Invalid API key"));
    }

    #[test]
    fn test_calculate_backoff() {
        let backoff1 = calculate_backoff(1, 0);
        assert!(backoff1 >= BACKOFF_BASE_MS);
        assert!(backoff1 < BACKOFF_BASE_MS + BACKOFF_BASE_MS / 10);

        assert!(calculate_backoff(2, 0) >= BACKOFF_BASE_MS * 2);
        assert!(calculate_backoff(1, 5) >= 5000);
    }

    #[test]
    fn test_extract_retry_after() {
        assert_eq!(extract_retry_after(r#"{"retry_after": 30}"#), Some(30));
        assert_eq!(extract_retry_after(r#"{"error": {"retry_after": 60}}"#), Some(60));
        assert_eq!(extract_retry_after(r#"{"message": "slow down"}"#), None);
        assert_eq!(extract_retry_after("not json"), None);
    }
}
