//! Configuration management with file persistence
//!
//! `config.toml` holds the application settings. The bandit exploration
//! parameters live in a separate, hot-reloadable `bandit.toml` (see [`bandit`]).

pub mod bandit;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::routing::{AgentSpec, default_agents};

pub use bandit::{BanditConfig, BanditParams, BanditParamsPatch};

/// Placeholder value shipped in sample `.env` files; treated as missing
const PLACEHOLDER_KEY: &str = "YOUR_SECRET_KEY";

/// Swarm configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    pub routing: RoutingConfig,
    pub collab: CollabConfig,
    pub synthesis: SynthesisConfig,
    pub evaluator: EvaluatorConfig,
    pub learning: LearningConfig,
    pub storage: StorageConfig,
    pub agents: Vec<AgentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub default_agent: String,
    pub router_agent: String,
    pub confidence_margin: f64,
    pub ensemble_size: usize,
    pub forced_exploration_every: u64,
    pub similarity_threshold: f64,
    pub similarity_top_k: usize,
    pub similarity_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabConfig {
    pub agent_timeout_secs: u64,
    pub diversity_penalty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub top_chunks: usize,
    pub heuristic_weight: f64,
    pub learned_weight: f64,
    pub novelty_weight: f64,
    pub coherence_temperature: f32,
    pub coherence_max_tokens: usize,
    /// Path of the learned chunk model; defaults to `<config_dir>/chunk_model.json`
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub enabled: bool,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    pub reflection_interval: u64,
    pub reflection_window: usize,
    pub max_interactions: u64,
    pub prune_headroom: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path; defaults to `<config_dir>/swarm.db`
    pub database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                api_key: None,
                base_url: "https://openrouter.ai/api/v1".to_string(),
                embedding_model: "openai/text-embedding-3-small".to_string(),
                temperature: 0.7,
                max_tokens: 2048,
                timeout_secs: 120,
            },
            routing: RoutingConfig {
                default_agent: "arcee".to_string(),
                router_agent: "arcee".to_string(),
                confidence_margin: 0.05,
                ensemble_size: 3,
                forced_exploration_every: 25,
                similarity_threshold: 0.78,
                similarity_top_k: 25,
                similarity_window: 5000,
            },
            collab: CollabConfig {
                agent_timeout_secs: 60,
                diversity_penalty: 0.2,
            },
            synthesis: SynthesisConfig {
                top_chunks: 12,
                heuristic_weight: 0.6,
                learned_weight: 0.4,
                novelty_weight: 0.2,
                coherence_temperature: 0.2,
                coherence_max_tokens: 1100,
                model_path: None,
            },
            evaluator: EvaluatorConfig {
                enabled: true,
                model: "arcee-ai/trinity-large-preview:free".to_string(),
            },
            learning: LearningConfig {
                reflection_interval: 100,
                reflection_window: 500,
                max_interactions: 50_000,
                prune_headroom: 5_000,
            },
            storage: StorageConfig {
                database_path: None,
            },
            agents: default_agents(),
        }
    }
}

/// Read an API key from the environment, ignoring blanks and the sample placeholder
pub fn env_key(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != PLACEHOLDER_KEY)
}

impl LlmConfig {
    /// Key for one agent: `OPENROUTER_API_KEY_<ID>` then `OPENROUTER_API_KEY`
    pub fn agent_api_key(&self, agent_id: &str) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env_key(&format!("OPENROUTER_API_KEY_{}", agent_id.to_uppercase()))
            .or_else(|| env_key("OPENROUTER_API_KEY")))
    }

    /// Key for a named service (evaluator, embeddings), falling back to the default agent's key
    pub fn service_api_key(
        &self,
        service: &str,
        default_agent: &str,
    ) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env_key(&format!("OPENROUTER_API_KEY_{}", service.to_uppercase()))
            .or_else(|| env_key(&format!("OPENROUTER_API_KEY_{}", default_agent.to_uppercase())))
            .or_else(|| env_key("OPENROUTER_API_KEY")))
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env_key("OPENROUTER_API_KEY").map(|key| redact(&key)))
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "LLM API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

fn redact(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 4 {
        "***".to_string()
    } else {
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("***{}", suffix)
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("SWARM_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("swarm")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Resolved database path
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("swarm.db")),
        }
    }

    /// Resolved learned chunk model path
    pub fn chunk_model_path(&self) -> anyhow::Result<PathBuf> {
        match &self.synthesis.model_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("chunk_model.json")),
        }
    }

    /// Hot-reloadable UCB parameter file
    pub fn bandit_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("bandit.toml"))
    }

    /// Optional format keyword override
    pub fn format_keywords_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("format_keywords.json"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load()-> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()?;

        if self.agents.is_empty() {
            return Err(anyhow!("At least one agent must be configured"));
        }
        for (name, id) in [
            ("routing.default_agent", &self.routing.default_agent),
            ("routing.router_agent", &self.routing.router_agent),
        ] {
            if !self.agents.iter().any(|a| &a.id == id) {
                return Err(anyhow!("{} refers to unknown agent '{}'", name, id));
            }
        }
        if self.routing.ensemble_size < 2 {
            return Err(anyhow!("routing.ensemble_size must be at least 2"));
        }
        if !(0.0..=1.0).contains(&self.routing.similarity_threshold) {
            return Err(anyhow!("routing.similarity_threshold must be between 0.0 and 1.0"));
        }
        if self.synthesis.top_chunks == 0 {
            return Err(anyhow!("synthesis.top_chunks must be positive"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "llm.base_url" => Ok(self.llm.base_url.clone()),
            "llm.embedding_model" => Ok(self.llm.embedding_model.clone()),
            "llm.temperature" => Ok(self.llm.temperature.to_string()),
            "llm.max_tokens" => Ok(self.llm.max_tokens.to_string()),
            "llm.timeout_secs" => Ok(self.llm.timeout_secs.to_string()),

            "routing.default_agent" => Ok(self.routing.default_agent.clone()),
            "routing.router_agent" => Ok(self.routing.router_agent.clone()),
            "routing.confidence_margin" => Ok(self.routing.confidence_margin.to_string()),
            "routing.ensemble_size" => Ok(self.routing.ensemble_size.to_string()),
            "routing.forced_exploration_every" => {
                Ok(self.routing.forced_exploration_every.to_string())
            }
            "routing.similarity_threshold" => Ok(self.routing.similarity_threshold.to_string()),
            "routing.similarity_top_k" => Ok(self.routing.similarity_top_k.to_string()),

            "collab.agent_timeout_secs" => Ok(self.collab.agent_timeout_secs.to_string()),
            "collab.diversity_penalty" => Ok(self.collab.diversity_penalty.to_string()),

            "synthesis.top_chunks" => Ok(self.synthesis.top_chunks.to_string()),

            "evaluator.enabled" => Ok(self.evaluator.enabled.to_string()),
            "evaluator.model" => Ok(self.evaluator.model.clone()),

            "learning.reflection_interval" => Ok(self.learning.reflection_interval.to_string()),
            "learning.max_interactions" => Ok(self.learning.max_interactions.to_string()),

            "llm.api_key" | "api_key" => match self.llm.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok("(not set - use OPENROUTER_API_KEY env var)".to_string()),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `swarm config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "llm.base_url" => self.llm.base_url = value.to_string(),
            "llm.embedding_model" => self.llm.embedding_model = value.to_string(),
            "llm.temperature" => {
                let temp: f32 = value
                    .parse()
                    .with_context(|| format!("Invalid temperature value: {}", value))?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                self.llm.temperature = temp;
            }
            "llm.max_tokens" => {
                self.llm.max_tokens = value
                    .parse()
                    .with_context(|| format!("Invalid max_tokens value: {}", value))?;
            }
            "llm.timeout_secs" => {
                self.llm.timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid timeout_secs value: {}", value))?;
            }

            "routing.default_agent" | "routing.router_agent" => {
                if !self.agents.iter().any(|a| a.id == value) {
                    return Err(anyhow!(
                        "Unknown agent: {}. Run `swarm agents` to see configured agents.",
                        value
                    ));
                }
                if key == "routing.default_agent" {
                    self.routing.default_agent = value.to_string();
                } else {
                    self.routing.router_agent = value.to_string();
                }
            }
            "routing.confidence_margin" => {
                let margin: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid confidence_margin value: {}", value))?;
                if !(0.0..=1.0).contains(&margin) {
                    return Err(anyhow!("Confidence margin must be between 0.0 and 1.0"));
                }
                self.routing.confidence_margin = margin;
            }
            "routing.ensemble_size" => {
                let size: usize = value
                    .parse()
                    .with_context(|| format!("Invalid ensemble_size value: {}", value))?;
                if size < 2 {
                    return Err(anyhow!("Ensemble size must be at least 2"));
                }
                self.routing.ensemble_size = size;
            }
            "routing.forced_exploration_every" => {
                self.routing.forced_exploration_every = value
                    .parse()
                    .with_context(|| format!("Invalid forced_exploration_every value: {}", value))?;
            }
            "routing.similarity_threshold" => {
                let threshold: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid similarity_threshold value: {}", value))?;
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(anyhow!("Similarity threshold must be between 0.0 and 1.0"));
                }
                self.routing.similarity_threshold = threshold;
            }
            "routing.similarity_top_k" => {
                self.routing.similarity_top_k = value
                    .parse()
                    .with_context(|| format!("Invalid similarity_top_k value: {}", value))?;
            }

            "collab.agent_timeout_secs" => {
                self.collab.agent_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid agent_timeout_secs value: {}", value))?;
            }
            "collab.diversity_penalty" => {
                let penalty: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid diversity_penalty value: {}", value))?;
                if !(0.0..=1.0).contains(&penalty) {
                    return Err(anyhow!("Diversity penalty must be between 0.0 and 1.0"));
                }
                self.collab.diversity_penalty = penalty;
            }

            "synthesis.top_chunks" => {
                let top: usize = value
                    .parse()
                    .with_context(|| format!("Invalid top_chunks value: {}", value))?;
                if top == 0 {
                    return Err(anyhow!("top_chunks must be positive"));
                }
                self.synthesis.top_chunks = top;
            }

            "evaluator.enabled" => {
                self.evaluator.enabled = value
                    .parse()
                    .with_context(|| format!("Invalid boolean value: {}", value))?;
            }
            "evaluator.model" => self.evaluator.model = value.to_string(),

            "learning.reflection_interval" => {
                self.learning.reflection_interval = value
                    .parse()
                    .with_context(|| format!("Invalid reflection_interval value: {}", value))?;
            }
            "learning.max_interactions" => {
                self.learning.max_interactions = value
                    .parse()
                    .with_context(|| format!("Invalid max_interactions value: {}", value))?;
            }

            "llm.api_key" | "api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the OPENROUTER_API_KEY environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `swarm config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = vec![
            "llm.base_url",
            "llm.embedding_model",
            "llm.temperature",
            "llm.max_tokens",
            "llm.timeout_secs",
            "llm.api_key",
            "routing.default_agent",
            "routing.router_agent",
            "routing.confidence_margin",
            "routing.ensemble_size",
            "routing.forced_exploration_every",
            "routing.similarity_threshold",
            "routing.similarity_top_k",
            "collab.agent_timeout_secs",
            "collab.diversity_penalty",
            "synthesis.top_chunks",
            "evaluator.enabled",
            "evaluator.model",
            "learning.reflection_interval",
            "learning.max_interactions",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
