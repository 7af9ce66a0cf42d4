//! Swarm Core Library
//!
//! This crate provides the core functionality for Swarm, including:
//! - Agent registry and OpenRouter model backends
//! - Reward store (SQLite) for agent statistics, interactions and feedback
//! - UCB bandit scoring and embedding-similarity routing
//! - Parallel collaboration across agents
//! - Chunk-level synthesis of ensemble answers
//! - LLM-as-judge evaluation
//! - Feedback attribution and periodic self-reflection

pub mod collab;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod feedback;
pub mod format;
pub mod llm;
pub mod routing;
pub mod storage;
pub mod synthesis;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{AnswerEnvelope, ChatRequest, Engine, ResponseEvent};
    pub use crate::error::{Error, Result};
    pub use crate::routing::{AgentRegistry, AgentSpec, RouteDecision, RouteReason, RouteTarget};
}
