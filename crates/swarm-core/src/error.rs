//! Error types for Swarm

use thiserror::Error;

/// Result type alias using Swarm's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Swarm error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Agent errors (E001-E099)
    #[error("Agent '{0}' not found. Run `swarm agents` to see configured agents.")]
    AgentNotFound(String),

    #[error("Agent '{0}' is unavailable: no API key configured.")]
    AgentUnavailable(String),

    #[error("No agent available. Set OPENROUTER_API_KEY or a per-agent OPENROUTER_API_KEY_<ID>.")]
    NoAgentAvailable,

    // Network errors (E100-E199)
    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    #[error("LLM API error: {0}")]
    LLMError(String),

    #[error("Rate limited. Waiting {0} seconds before retry.")]
    RateLimited(u64),

    #[error("Agent call timed out after {0} seconds")]
    Timeout(u64),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // User errors (E700-E799)
    #[error("Operation cancelled")]
    Cancelled,

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Routing errors (E1100-E1199)
    #[error("Routing failed: {0}")]
    RoutingFailed(String),

    // Embedding and judge errors (E1200-E1299)
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Judge returned invalid output: {0}")]
    JudgeOutputInvalid(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentNotFound(_) => "E001",
            Self::AgentUnavailable(_) => "E002",
            Self::NoAgentAvailable => "E003",
            Self::NetworkError(_) => "E100",
            Self::LLMError(_) => "E101",
            Self::RateLimited(_) => "E102",
            Self::Timeout(_) => "E103",
            Self::DatabaseError(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::ConfigError(_) => "E600",
            Self::Cancelled => "E700",
            Self::InvalidInput(_) => "E800",
            Self::RoutingFailed(_) => "E1100",
            Self::EmbeddingFailed(_) => "E1200",
            Self::JudgeOutputInvalid(_) => "E1201",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::AgentNotFound(_) => Some("swarm agents".to_string()),
            Self::AgentUnavailable(id) => Some(format!(
                "export OPENROUTER_API_KEY_{}=<key>",
                id.to_uppercase()
            )),
            Self::NoAgentAvailable => Some("export OPENROUTER_API_KEY=<key>".to_string()),
            Self::NetworkError(_) => Some("Check internet connection".to_string()),
            Self::ConfigError(_) => Some("swarm config list".to_string()),
            _ => None,
        }
    }

    /// Whether the error marks a failed backend call that another model could satisfy
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_) | Self::LLMError(_) | Self::RateLimited(_) | Self::Timeout(_)
        )
    }
}
