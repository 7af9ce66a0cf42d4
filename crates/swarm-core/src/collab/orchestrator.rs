//! Concurrent fan-out to an ensemble of agents

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::signals::{choose_synthesizer, compute_signals};
use super::{AgentAnswer, CollabOutcome};
use crate::config::{BanditConfig, CollabConfig};
use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::llm::{CompletionOptions, Message, MessageRole, ModelBackend, last_user_content};
use crate::routing::{AgentRegistry, UcbScorer};
use crate::storage::{AgentStat, RewardStore};
use crate::synthesis::{SynthesisInput, Synthesizer};

/// Final answer when no agent produced text
pub const ALL_FAILED_ANSWER: &str = "[Error: All agents failed to produce an answer]";

const UNAVAILABLE: &str = "unavailable";

/// One ensemble run
#[derive(Debug, Clone, Default)]
pub struct CollabRequest {
    pub agent_ids: Vec<String>,
    /// Conversation without system messages
    pub messages: Vec<Message>,
    /// Appended to each agent's base system prompt
    pub system_prompt_override: Option<String>,
    /// Reused from routing when available
    pub query_embedding: Option<Vec<f32>>,
}

impl CollabRequest {
    pub fn new(agent_ids: Vec<String>, messages: Vec<Message>) -> Self {
        Self {
            agent_ids,
            messages,
            ..Default::default()
        }
    }

    pub fn with_system_prompt_override(mut self, prompt: Option<String>) -> Self {
        self.system_prompt_override = prompt;
        self
    }

    pub fn with_query_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.query_embedding = embedding;
        self
    }
}

/// Runs ensembles: fan-out, signals, synthesis
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    backend: Arc<dyn ModelBackend>,
    embeddings: EmbeddingClient,
    store: Arc<RewardStore>,
    bandit: Arc<BanditConfig>,
    synthesizer: Arc<Synthesizer>,
    config: CollabConfig,
    options: CompletionOptions,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("options", &self.options)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        backend: Arc<dyn ModelBackend>,
        embeddings: EmbeddingClient,
        store: Arc<RewardStore>,
        bandit: Arc<BanditConfig>,
        synthesizer: Arc<Synthesizer>,
        config: CollabConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            embeddings,
            store,
            bandit,
            synthesizer,
            config,
            options: CompletionOptions::default(),
        }
    }

    /// Sampling options for the per-agent answer calls
    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the ensemble; cancelling `cancel` abandons in-flight calls
    pub async fn run(&self, request: CollabRequest, cancel: &CancellationToken) -> Result<CollabOutcome> {
        if request.agent_ids.is_empty() {
            return Err(Error::InvalidInput("no agents provided for collaboration".to_string()));
        }

        let started = Instant::now();
        let answers = tokio::select! {
            answers = self.gather(&request) => answers,
            _ = cancel.cancelled() => {
                info!(agents = ?request.agent_ids, "Collaboration cancelled");
                return Err(Error::Cancelled);
            }
        };

        let mut outcome = CollabOutcome {
            agents_used: request.agent_ids.clone(),
            answers,
            ..Default::default()
        };

        let answered: Vec<(String, String)> = outcome
            .answers
            .iter()
            .filter_map(|a| a.answer().map(|t| (a.agent_id.clone(), t.to_string())))
            .collect();

        if answered.is_empty() {
            warn!(agents = ?request.agent_ids, "All agents failed");
            outcome.final_answer = ALL_FAILED_ANSWER.to_string();
            return Ok(outcome);
        }

        let query = last_user_content(&request.messages);
        let query_embedding = match request.query_embedding {
            Some(embedding) => Some(embedding),
            None => self.embeddings.embed(query).await,
        };

        let stats: HashMap<String, AgentStat> = match self.store.agent_stats_map().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Failed to load agent stats");
                HashMap::new()
            }
        };
        let scorer = UcbScorer::new(self.bandit.current());
        let ucb_scores: BTreeMap<String, f64> =
            scorer.normalized_scores(&self.registry.routable_ids(), &stats);

        let signals = compute_signals(
            &self.embeddings,
            query_embedding.as_deref(),
            &answered,
            &stats,
            &ucb_scores,
            self.config.diversity_penalty,
        )
        .await;

        let synthesizer_id = choose_synthesizer(&signals, &self.registry, self.backend.as_ref());
        let synthesizer_spec = synthesizer_id.as_deref().and_then(|id| self.registry.get(id));

        let synthesis = tokio::select! {
            synthesis = self.synthesizer.synthesize(SynthesisInput {
                query,
                query_embedding: query_embedding.as_deref(),
                answers: signals
                    .iter()
                    .cloned()
                    .zip(answered.iter().map(|(_, text)| text.clone()))
                    .collect(),
                synthesizer: synthesizer_spec,
            }) => synthesis,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        info!(
            agents = answered.len(),
            failed = outcome.answers.len() - answered.len(),
            synthesizer = synthesizer_id.as_deref().unwrap_or("none"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collaboration complete"
        );

        outcome.final_answer = synthesis.final_answer.clone();
        outcome.synthesizer_id = synthesizer_id;
        outcome.signals = signals;
        outcome.ucb_scores = ucb_scores;
        outcome.synthesis = Some(synthesis);
        Ok(outcome)
    }

    /// Ask every agent concurrently, one spawned task each
    pub async fn gather(&self, request: &CollabRequest) -> Vec<AgentAnswer> {
        let timeout = Duration::from_secs(self.config.agent_timeout_secs);
        let conversation: Vec<Message> = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .cloned()
            .collect();

        let handles: Vec<_> = request
            .agent_ids
            .iter()
            .map(|agent_id| {
                let agent_id = agent_id.clone();
                let Some(agent) = self.registry.get(&agent_id).cloned() else {
                    return tokio::spawn(async move { AgentAnswer::failed(agent_id, "unknown agent") });
                };
                if !self.backend.is_available(&agent) {
                    return tokio::spawn(async move { AgentAnswer::failed(agent_id, UNAVAILABLE) });
                }

                let backend = Arc::clone(&self.backend);
                let options = self.options;
                let mut messages = vec![Message::system(
                    agent.system_prompt_with(request.system_prompt_override.as_deref()),
                )];
                messages.extend(conversation.iter().cloned());

                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = tokio::time::timeout(timeout, backend.complete(&agent, messages, options)).await;
                    let answer = match result {
                        Ok(Ok(text)) if !text.trim().is_empty() => AgentAnswer::ok(&agent.id, text.trim()),
                        Ok(Ok(_)) => AgentAnswer::failed(&agent.id, "empty response"),
                        Ok(Err(e)) => AgentAnswer::failed(&agent.id, e.to_string()),
                        Err(_) => AgentAnswer::failed(
                            &agent.id,
                            Error::Timeout(timeout.as_secs()).to_string(),
                        ),
                    };
                    debug!(
                        agent = %agent.id,
                        ok = answer.error.is_none(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Agent call finished"
                    );
                    answer
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(&request.agent_ids)
            .map(|(joined, agent_id)| match joined {
                Ok(answer) => answer,
                Err(e) => AgentAnswer::failed(agent_id, format!("task failed: {}", e)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BanditParams, Config};
    use crate::storage::reward_store::tests::create_test_store;
    use crate::synthesis::ChunkScorer;
    use crate::testing::{FakeBackend, FakeEmbedder, Script};

    async fn orchestrator(backend: FakeBackend) -> (Orchestrator, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let embeddings = EmbeddingClient::new(Arc::new(FakeEmbedder::new()));
        let config = Config::default();
        let synthesizer = Arc::new(Synthesizer::new(
            backend.clone(),
            embeddings.clone(),
            Arc::new(ChunkScorer::fixed(None)),
            config.synthesis.clone(),
        ));
        let orchestrator = Orchestrator::new(
            Arc::new(AgentRegistry::with_defaults()),
            backend.clone(),
            embeddings,
            Arc::new(create_test_store().await),
            Arc::new(BanditConfig::in_memory(BanditParams::default())),
            synthesizer,
            CollabConfig {
                agent_timeout_secs: 1,
                ..config.collab
            },
        );
        (orchestrator, backend)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn request(agents: &[&str]) -> CollabRequest {
        CollabRequest::new(ids(agents), vec![Message::user("compare rust and go")])
    }

    #[tokio::test]
    async fn test_one_failure_still_synthesizes() {
        let backend = FakeBackend::new()
            .reply("solar", "Rust has no garbage collector. Go has one.")
            .reply("qwen", "Go compiles fast.")
            .script("liquid", Script::Fail);
        let (orch, _) = orchestrator(backend).await;

        let outcome = orch
            .run(request(&["solar", "qwen", "liquid"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.answering_agents(), ids(&["solar", "qwen"]));
        assert!(outcome.answers[2].error.is_some());
        assert_eq!(outcome.signals.len(), 2);
        assert!(!outcome.final_answer.is_empty());
        assert_ne!(outcome.final_answer, ALL_FAILED_ANSWER);
        let synthesis = outcome.synthesis.as_ref().unwrap();
        assert!(synthesis.chunks.iter().all(|c| c.agent_id != "liquid"));
    }

    #[tokio::test]
    async fn test_all_failures_yield_sentinel() {
        let backend = FakeBackend::new()
            .script("solar", Script::Fail)
            .script("qwen", Script::Empty)
            .script("liquid", Script::Unavailable);
        let (orch, _) = orchestrator(backend).await;

        let outcome = orch
            .run(request(&["solar", "qwen", "liquid"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.final_answer, ALL_FAILED_ANSWER);
        assert!(outcome.all_failed());
        assert_eq!(outcome.answers[2].error.as_deref(), Some("unavailable"));
        assert!(outcome.synthesis.is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_a_per_agent_failure() {
        let backend = FakeBackend::new()
            .script("solar", Script::Slow(Duration::from_secs(5), "late".to_string()))
            .reply("qwen", "On time.");
        let (orch, _) = orchestrator(backend).await;

        let answers = orch.gather(&request(&["solar", "qwen"])).await;
        assert!(answers[0].error.as_deref().unwrap_or("").contains("timed out"));
        assert_eq!(answers[1].answer(), Some("On time."));
    }

    #[tokio::test]
    async fn test_override_appended_to_system_prompt() {
        let (orch, backend) = orchestrator(FakeBackend::new()).await;
        let request = request(&["solar"]).with_system_prompt_override(Some("Use a table.".to_string()));
        orch.gather(&request).await;

        let call = &backend.calls_for("solar")[0];
        assert_eq!(call.messages[0].role, MessageRole::System);
        assert!(call.messages[0].content.ends_with("\n\n[Chat Override]\nUse a table."));
        assert_eq!(call.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let backend = FakeBackend::new().script("solar", Script::Slow(Duration::from_millis(500), "x".to_string()));
        let (orch, _) = orchestrator(backend).await;
        let token = CancellationToken::new();
        token.cancel();

        let result = orch.run(request(&["solar"]), &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_empty_agent_list_is_rejected() {
        let (orch, _) = orchestrator(FakeBackend::new()).await;
        let result = orch.run(request(&[]), &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
