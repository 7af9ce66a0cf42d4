//! Request and response types for the OpenAI-compatible OpenRouter API

use serde::{Deserialize, Serialize};

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Content of the last user message, or empty when there is none
pub fn last_user_content(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// Per-call sampling options; `None` falls back to the client defaults
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
}

impl CompletionOptions {
    pub fn new(temperature: f32, max_tokens: usize) -> Self {
        Self {
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
        }
    }
}

/// Request body for chat completions
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            stream: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// Token usage information from the API response
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Reason for completion finishing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    #[serde(other)]
    Unknown,
}

/// Assistant message inside a choice; reasoning models may return null content
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    pub role: Option<MessageRole>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ResponseMessage,
    pub finish_reason: Option<FinishReason>,
}

/// Response from the chat completions API
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

/// Simplified response returned by the LLM client
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: u32,
    pub finish_reason: FinishReason,
}

impl LlmResponse {
    pub fn from_completion(response: CompletionResponse) -> Option<Self> {
        let choice = response.choices.first()?;

        Some(Self {
            content: choice.message.content.clone().unwrap_or_default(),
            model: response.model,
            tokens_used: response.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
            finish_reason: choice
                .finish_reason
                .clone()
                .unwrap_or(FinishReason::Unknown),
        })
    }
}

/// Request body for embeddings
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: String,
}

impl EmbeddingRequest {
    pub fn new(model: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            input: input.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingData {
    #[serde(default)]
    pub index: usize,
    pub embedding: Vec<f32>,
}

/// Response from the embeddings API
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingData>,
    #[serde(default)]
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_user_content() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("first"),
            Message::assistant("ok"),
            Message::user("second"),
        ];
        assert_eq!(last_user_content(&messages), "second");
        assert_eq!(last_user_content(&[Message::system("x")]), "");
    }

    #[test]
    fn test_completion_request_serialization() {
        let request = CompletionRequest::new("test-model", vec![Message::user("Hello")])
            .with_temperature(0.5)
            .with_max_tokens(20);

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"model\":\"test-model\""));
        assert!(json.contains("\"temperature\":0.5"));
        assert!(json.contains("\"max_tokens\":20"));
        assert!(!json.contains("stream"));
    }

    #[test]
    fn test_null_content_becomes_empty() {
        let json = r#"{
            "id": "gen-1",
            "model": "liquid/lfm",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null},
                "finish_reason": "length"
            }]
        }"#;

        let response: CompletionResponse = serde_json::from_str(json).unwrap();
        let llm = LlmResponse::from_completion(response).unwrap();
        assert_eq!(llm.content, "");
        assert_eq!(llm.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_completion_response_deserialization() {
        let json = r#"{
            "id": "gen-123",
            "object": "chat.completion",
            "created": 1234567890,
            "model": "upstage/solar-pro-3:free",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 8, "total_tokens": 18}
        }"#;

        let response: CompletionResponse = serde_json::from_str(json).unwrap();
        let llm = LlmResponse::from_completion(response).unwrap();
        assert_eq!(llm.content, "Hi");
        assert_eq!(llm.tokens_used, 18);
    }

    #[test]
    fn test_embedding_response_deserialization() {
        let json = r#"{
            "object": "list",
            "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3], "object": "embedding"}],
            "model": "text-embedding-3-small"
        }"#;

        let response: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.data[0].embedding, vec![0.1, 0.2, 0.3]);
    }
}
