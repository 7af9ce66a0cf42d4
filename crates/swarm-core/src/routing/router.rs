//! Agent Router - similarity shortcut, UCB bandit, classifier fallback
//!
//! Routing order for one query:
//! 1. Embedding-similarity vote over past interactions (skipped for forced ensembles)
//! 2. Normalized UCB scores with a confidence margin: a clear winner is routed
//!    alone, a close race becomes an ensemble of the top agents
//! 3. With no statistics at all, the router model classifies the query
//!
//! Every N-th routed query that ends in an ensemble also drafts the least-used
//! candidate into the last slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use super::bandit::{self, UcbScorer};
use super::classifier;
use super::similarity::SimilarityMatcher;
use super::types::{AgentRegistry, RouteDecision, RouteReason};
use crate::config::{BanditConfig, RoutingConfig};
use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::llm::ModelBackend;
use crate::storage::{AgentStat, RewardStore};

/// Chat command that forces an ensemble
pub const SWARM_COMMAND: &str = "/swarm";

/// Configuration for the agent router
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Minimum normalized lead for a single-agent route
    pub confidence_margin: f64,
    /// Ensemble width
    pub ensemble_size: usize,
    /// Forced exploration period in routed queries (0 disables)
    pub forced_exploration_every: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_margin: 0.05,
            ensemble_size: bandit::DEFAULT_TOP_K,
            forced_exploration_every: 25,
        }
    }
}

impl From<&RoutingConfig> for RouterConfig {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            confidence_margin: config.confidence_margin,
            ensemble_size: config.ensemble_size,
            forced_exploration_every: config.forced_exploration_every,
        }
    }
}

/// Split a leading `/swarm` command off a query
///
/// Returns whether the command was present and the remaining text.
pub fn strip_swarm_command(query: &str) -> (bool, &str) {
    let trimmed = query.trim_start();
    let len = SWARM_COMMAND.len();
    let Some(head) = trimmed.get(..len) else {
        return (false, query);
    };
    if !head.eq_ignore_ascii_case(SWARM_COMMAND) {
        return (false, query);
    }
    let rest = &trimmed[len..];
    match rest.chars().next() {
        None => (true, ""),
        Some(c) if c.is_whitespace() => (true, rest.trim_start()),
        Some(_) => (false, query),
    }
}

/// Agent router with UCB-based selection
pub struct Router {
    config: RouterConfig,
    registry: Arc<AgentRegistry>,
    backend: Arc<dyn ModelBackend>,
    embeddings: EmbeddingClient,
    store: Arc<RewardStore>,
    bandit: Arc<BanditConfig>,
    matcher: SimilarityMatcher,
    /// Queries routed so far, drives forced exploration
    routed: AtomicU64,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("matcher", &self.matcher)
            .field("routed", &self.routed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Router {
    pub fn new(
        registry: Arc<AgentRegistry>,
        backend: Arc<dyn ModelBackend>,
        embeddings: EmbeddingClient,
        store: Arc<RewardStore>,
        bandit: Arc<BanditConfig>,
    ) -> Self {
        Self {
            config: RouterConfig::default(),
            registry,
            backend,
            embeddings,
            store,
            bandit,
            matcher: SimilarityMatcher::default(),
            routed: AtomicU64::new(0),
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_matcher(mut self, matcher: SimilarityMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Number of queries routed by this router
    pub fn routed_count(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// Routable agents that currently have credentials
    pub fn candidates(&self) -> Vec<String> {
        self.registry
            .routable()
            .filter(|a| self.backend.is_available(a))
            .map(|a| a.id.clone())
            .collect()
    }

    fn is_candidate(&self, agent_id: &str) -> bool {
        self.registry
            .get(agent_id)
            .is_some_and(|a| a.routable && self.backend.is_available(a))
    }

    /// Route one query
    ///
    /// A leading `/swarm` command or `force_ensemble` requests an ensemble.
    pub async fn route(&self, query: &str, force_ensemble: bool) -> Result<RouteDecision> {
        let (command, text) = strip_swarm_command(query);
        let forced = force_ensemble || command;

        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(Error::NoAgentAvailable);
        }

        let embedding = self.embeddings.embed(text).await;
        let sequence = self.routed.fetch_add(1, Ordering::Relaxed) + 1;

        if !forced && let Some(vector) = embedding.as_deref() {
            match self
                .matcher
                .find(&self.store, vector, |id| self.is_candidate(id))
                .await
            {
                Ok(Some(hit)) => {
                    info!(agent = %hit.agent_id, vote = hit.vote, "Routed by similarity");
                    return Ok(RouteDecision::single(hit.agent_id, RouteReason::EmbeddingSimilarity)
                        .with_scores(hit.votes)
                        .with_embedding(embedding));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Similarity lookup failed"),
            }
        }

        let stats: HashMap<String, AgentStat> = match self.store.agent_stats_map().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Failed to load agent stats");
                HashMap::new()
            }
        };

        let has_stats = candidates.iter().any(|id| stats.contains_key(id));
        if !has_stats && !forced {
            let fallback = self.fallback_agent(&candidates);
            let mut pick = classifier::classify(self.backend.as_ref(), &self.registry, text, &fallback).await;
            if !candidates.contains(&pick) {
                pick = fallback;
            }
            info!(agent = %pick, "Routed by classifier");
            return Ok(RouteDecision::single(pick, RouteReason::ClassifierFallback)
                .with_embedding(embedding));
        }

        let scorer = UcbScorer::new(self.bandit.current());
        let scores = scorer.normalized_scores(&candidates, &stats);
        let ranked = bandit::rank(&candidates, &scores, &stats);

        if ranked.len() == 1 {
            let reason = if has_stats {
                RouteReason::BanditUcb
            } else {
                RouteReason::Default
            };
            return Ok(RouteDecision::single(ranked[0].clone(), reason)
                .with_scores(scores)
                .with_embedding(embedding));
        }

        let top1 = scores.get(&ranked[0]).copied().unwrap_or(0.0);
        let top2 = scores.get(&ranked[1]).copied().unwrap_or(0.0);
        let margin = top1 - top2;

        debug!(
            sequence,
            top = %ranked[0],
            margin,
            forced,
            "Bandit scores computed"
        );

        if forced || margin < self.config.confidence_margin {
            let k = self.config.ensemble_size.max(2);
            let mut selected: Vec<String> = ranked.iter().take(k).cloned().collect();

            let every = self.config.forced_exploration_every;
            if every > 0
                && sequence % every == 0
                && bandit::force_exploration(&mut selected, &candidates, &stats, k)
            {
                info!(sequence, agents = ?selected, "Forced exploration");
            }

            let reason = if forced {
                RouteReason::ForcedEnsemble
            } else {
                RouteReason::LowConfidence
            };
            info!(agents = ?selected, reason = %reason, "Routed to ensemble");
            return Ok(RouteDecision::ensemble(selected, reason)
                .with_scores(scores)
                .with_embedding(embedding));
        }

        info!(agent = %ranked[0], margin, "Routed by bandit");
        Ok(RouteDecision::single(ranked[0].clone(), RouteReason::BanditUcb)
            .with_scores(scores)
            .with_embedding(embedding))
    }

    fn fallback_agent(&self, candidates: &[String]) -> String {
        let default = &self.registry.default_agent().id;
        if candidates.contains(default) {
            default.clone()
        } else {
            candidates.first().cloned().unwrap_or_else(|| default.clone())
        }
    }
}
