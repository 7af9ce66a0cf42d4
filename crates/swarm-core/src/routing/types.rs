//! Types for agent routing
//!
//! Agents are the unit the bandit learns about: each one is a model (plus
//! fallbacks) with a specialty used by the classifier prompt.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// One registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Stable identifier, also the suffix of its `OPENROUTER_API_KEY_<ID>` variable
    pub id: String,
    /// Primary OpenRouter model
    pub model: String,
    #[serde(default)]
    pub description: String,
    /// Short phrase used in the classifier prompt
    #[serde(default)]
    pub specialty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Whether automatic routing may pick this agent
    #[serde(default = "default_true")]
    pub routable: bool,
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// System prompt for agents that do not configure one
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Match the user's language.";

impl AgentSpec {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            description: String::new(),
            specialty: String::new(),
            system_prompt: None,
            routable: true,
            fallback_models: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = specialty.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    pub fn not_routable(mut self) -> Self {
        self.routable = false;
        self
    }

    /// Configured system prompt, or [`DEFAULT_SYSTEM_PROMPT`]
    pub fn base_system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    /// Base prompt with an optional per-chat override appended
    pub fn system_prompt_with(&self, chat_override: Option<&str>) -> String {
        match chat_override.map(str::trim).filter(|o| !o.is_empty()) {
            Some(extra) => format!("{}\n\n[Chat Override]\n{}", self.base_system_prompt(), extra),
            None => self.base_system_prompt().to_string(),
        }
    }

    /// Primary model followed by its fallbacks
    pub fn model_chain(&self) -> Vec<String> {
        let mut chain = vec![self.model.clone()];
        chain.extend(self.fallback_models.iter().cloned());
        chain
    }
}

/// Agents shipped by default (OpenRouter free tier)
pub fn default_agents() -> Vec<AgentSpec> {
    vec![
        AgentSpec::new("arcee", "arcee-ai/trinity-large-preview:free")
            .with_description("Arcee AI Trinity: balanced, good general reasoning")
            .with_specialty("general questions and balanced answers"),
        AgentSpec::new("solar", "upstage/solar-pro-3:free")
            .with_description("Solar Pro: fast and efficient, good for coding")
            .with_specialty("code, programming, debugging"),
        AgentSpec::new("liquid", "liquid/lfm-2.5-1.2b-thinking:free")
            .with_description("LiquidAI LFM Thinking: deep reasoning, chain-of-thought style")
            .with_specialty("step-by-step reasoning and math"),
        AgentSpec::new("qwen", "qwen/qwen3-next-80b-a3b-instruct:free")
            .with_description("Qwen Next: very strong multilingual and logic")
            .with_specialty("multilingual text, translation, logic"),
        AgentSpec::new("nemotron", "nvidia/nemotron-3-nano-30b-a3b:free")
            .with_description("NVIDIA Nemotron: optimized for factual tasks")
            .with_specialty("factual lookups and definitions"),
    ]
}

/// Ordered set of agents with designated default and router agents
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentSpec>,
    default_agent: String,
    router_agent: String,
}

impl AgentRegistry {
    pub fn new(
        agents: Vec<AgentSpec>,
        default_agent: impl Into<String>,
        router_agent: impl Into<String>,
    ) -> Result<Self> {
        let default_agent = default_agent.into();
        let router_agent = router_agent.into();

        if agents.is_empty() {
            return Err(Error::ConfigError("no agents configured".to_string()));
        }
        for (i, agent) in agents.iter().enumerate() {
            if agents[..i].iter().any(|a| a.id == agent.id) {
                return Err(Error::ConfigError(format!("duplicate agent id '{}'", agent.id)));
            }
        }
        for id in [&default_agent, &router_agent] {
            if !agents.iter().any(|a| &a.id == id) {
                return Err(Error::AgentNotFound(id.clone()));
            }
        }

        Ok(Self {
            agents,
            default_agent,
            router_agent,
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            agents: default_agents(),
            default_agent: "arcee".to_string(),
            router_agent: "arcee".to_string(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn require(&self, id: &str) -> Result<&AgentSpec> {
        self.get(id).ok_or_else(|| Error::AgentNotFound(id.to_string()))
    }

    pub fn all(&self) -> &[AgentSpec] {
        &self.agents
    }

    /// Agents automatic routing may choose, in registry order
    pub fn routable(&self) -> impl Iterator<Item = &AgentSpec> {
        self.agents.iter().filter(|a| a.routable)
    }

    pub fn routable_ids(&self) -> Vec<String> {
        self.routable().map(|a| a.id.clone()).collect()
    }

    pub fn is_routable(&self, id: &str) -> bool {
        self.get(id).is_some_and(|a| a.routable)
    }

    pub fn default_agent(&self) -> &AgentSpec {
        self.get(&self.default_agent)
            .unwrap_or(&self.agents[0])
    }

    pub fn router_agent(&self) -> &AgentSpec {
        self.get(&self.router_agent)
            .unwrap_or_else(|| self.default_agent())
    }
}

/// Why the router picked what it picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// A close past query was answered well by this agent
    EmbeddingSimilarity,
    /// Clear winner on normalized UCB score
    BanditUcb,
    /// Top two normalized scores within the confidence margin
    LowConfidence,
    /// User asked for an ensemble
    ForcedEnsemble,
    /// No statistics yet; the router model picked
    ClassifierFallback,
    /// Explicit agent or default agent
    Default,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmbeddingSimilarity => "embedding_similarity",
            Self::BanditUcb => "bandit_ucb",
            Self::LowConfidence => "low_confidence",
            Self::ForcedEnsemble => "forced_ensemble",
            Self::ClassifierFallback => "classifier_fallback",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for RouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single agent or an ensemble
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RouteTarget {
    Single { agent_id: String },
    Ensemble { agent_ids: Vec<String> },
}

impl RouteTarget {
    pub fn agent_ids(&self) -> Vec<String> {
        match self {
            Self::Single { agent_id } => vec![agent_id.clone()],
            Self::Ensemble { agent_ids } => agent_ids.clone(),
        }
    }

    /// Agent reported as selected: the single agent or the first ensemble member
    pub fn primary(&self) -> &str {
        match self {
            Self::Single { agent_id } => agent_id,
            Self::Ensemble { agent_ids } => agent_ids.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn is_ensemble(&self) -> bool {
        matches!(self, Self::Ensemble { .. })
    }
}

/// Result of routing one query
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub target: RouteTarget,
    pub reason: RouteReason,
    /// Normalized bandit scores over the candidates (empty when the bandit was skipped)
    pub scores: BTreeMap<String, f64>,
    /// Query embedding, kept for interaction storage
    #[serde(skip)]
    pub query_embedding: Option<Vec<f32>>,
}

impl RouteDecision {
    pub fn single(agent_id: impl Into<String>, reason: RouteReason) -> Self {
        Self {
            target: RouteTarget::Single {
                agent_id: agent_id.into(),
            },
            reason,
            scores: BTreeMap::new(),
            query_embedding: None,
        }
    }

    pub fn ensemble(agent_ids: Vec<String>, reason: RouteReason) -> Self {
        Self {
            target: RouteTarget::Ensemble { agent_ids },
            reason,
            scores: BTreeMap::new(),
            query_embedding: None,
        }
    }

    pub fn with_scores(mut self, scores: BTreeMap<String, f64>) -> Self {
        self.scores = scores;
        self
    }

    pub fn with_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.query_embedding = embedding;
        self
    }
}
