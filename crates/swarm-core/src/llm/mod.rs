//! LLM integration - OpenRouter API
//!
//! This module provides:
//! - The [`ModelBackend`] and [`Embedder`] capability traits used by the engine
//! - OpenRouter HTTP client for chat completions and embeddings
//! - Request/response types matching the OpenAI-compatible API
//! - Model fallback with automatic retry
//! - Streaming response support

mod backend;
mod client;
mod streaming;
mod types;

pub use backend::{
    EMBED_MAX_CHARS, EVALUATOR_ID, Embedder, ModelBackend, OpenRouterBackend, OpenRouterEmbedder,
    truncate_chars,
};
pub use client::{LlmClient, LlmClientBuilder, OPENROUTER_BASE_URL};
pub use streaming::{StreamChunk, StreamEvent, parse_sse_line};
pub use types::{
    CompletionOptions, CompletionRequest, FinishReason, LlmResponse, Message, MessageRole,
    last_user_content,
};
