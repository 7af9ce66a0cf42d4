//! Capability seams between the engine and the model provider
//!
//! The engine never talks HTTP directly: it calls agents through
//! [`ModelBackend`] and embeds text through [`Embedder`]. The OpenRouter
//! implementations resolve one API key per agent from the environment.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::routing::AgentSpec;

use super::client::LlmClient;
use super::types::{CompletionOptions, Message};

/// Agent id under which the judge model's credentials are resolved
pub const EVALUATOR_ID: &str = "evaluator";

/// Text-completion capability for registered agents
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Whether credentials exist for this agent
    fn is_available(&self, agent: &AgentSpec) -> bool;

    async fn complete(
        &self,
        agent: &AgentSpec,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<String>;

    /// Streamed completion; the default buffers a full completion into one piece
    async fn complete_streaming(
        &self,
        agent: &AgentSpec,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let text = self.complete(agent, messages, options).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

/// Fixed embedding function
#[async_trait]
pub trait Embedder: Send + Sync {
    fn is_available(&self) -> bool;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// OpenRouter backend with one client per credentialed agent
#[derive(Debug, Default)]
pub struct OpenRouterBackend {
    clients: HashMap<String, LlmClient>,
}

impl OpenRouterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build clients for every configured agent plus the evaluator
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut backend = Self::new();

        for agent in &config.agents {
            let key = config
                .llm
                .agent_api_key(&agent.id)
                .map_err(|e| Error::ConfigError(e.to_string()))?;
            match key {
                Some(key) => backend.insert(&agent.id, build_client(config, key)?),
                None => debug!(agent_id = %agent.id, "No API key, agent unavailable"),
            }
        }

        let judge_key = config
            .llm
            .service_api_key(EVALUATOR_ID, &config.routing.default_agent)
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        if let Some(key) = judge_key {
            backend.insert(EVALUATOR_ID, build_client(config, key)?);
        }

        Ok(backend)
    }

    pub fn insert(&mut self, agent_id: &str, client: LlmClient) {
        self.clients.insert(agent_id.to_string(), client);
    }

    fn client(&self, agent: &AgentSpec) -> Result<&LlmClient> {
        self.clients
            .get(&agent.id)
            .ok_or_else(|| Error::AgentUnavailable(agent.id.clone()))
    }
}

fn build_client(config: &Config, key: String) -> Result<LlmClient> {
    LlmClient::builder()
        .api_key(key)
        .base_url(config.llm.base_url.clone())
        .timeout_secs(config.llm.timeout_secs)
        .defaults(config.llm.temperature, config.llm.max_tokens)
        .build()
}

#[async_trait]
impl ModelBackend for OpenRouterBackend {
    fn is_available(&self, agent: &AgentSpec) -> bool {
        self.clients.contains_key(&agent.id)
    }

    async fn complete(
        &self,
        agent: &AgentSpec,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<String> {
        let client = self.client(agent)?;
        let response = client
            .complete_with_fallback(&agent.model_chain(), messages, options)
            .await?;
        Ok(response.content)
    }

    async fn complete_streaming(
        &self,
        agent: &AgentSpec,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let client = self.client(agent)?;
        client
            .complete_streaming(&agent.model_chain(), messages, options)
            .await
    }
}

/// Maximum characters sent to the embedding endpoint
pub const EMBED_MAX_CHARS: usize = 4000;

/// OpenRouter embeddings with their own key chain
#[derive(Debug)]
pub struct OpenRouterEmbedder {
    client: Option<LlmClient>,
    model: String,
}

impl OpenRouterEmbedder {
    pub fn from_config(config: &Config) -> Result<Self> {
        let key = config
            .llm
            .service_api_key("embeddings", &config.routing.default_agent)
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        let client = match key {
            Some(key) => Some(build_client(config, key)?),
            None => {
                warn!("No embeddings API key; similarity routing and chunk relevance degrade");
                None
            }
        };
        Ok(Self {
            client,
            model: config.llm.embedding_model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for OpenRouterEmbedder {
    fn is_available(&self) -> bool {
        self.client.is_some()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::EmbeddingFailed("no embeddings API key".to_string()))?;
        let input = truncate_chars(text, EMBED_MAX_CHARS);
        client.embed(input, &self.model).await
    }
}

/// Longest prefix of `text` with at most `max` characters
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 2), "he");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[tokio::test]
    async fn test_backend_without_client_is_unavailable() {
        let backend = OpenRouterBackend::new();
        let agent = AgentSpec::new("solar", "upstage/solar-pro-3:free");
        assert!(!backend.is_available(&agent));

        let err = backend
            .complete(&agent, vec![Message::user("hi")], CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentUnavailable(id) if id == "solar"));
    }

    #[test]
    fn test_backend_insert_marks_available() {
        let mut backend = OpenRouterBackend::new();
        let client = LlmClient::builder().api_key("k").build().unwrap();
        backend.insert("qwen", client);
        assert!(backend.is_available(&AgentSpec::new("qwen", "qwen/qwen3")));
    }
}
