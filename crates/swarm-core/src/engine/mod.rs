//! Engine facade
//!
//! [`Engine`] wires routing, collaboration, synthesis, evaluation and
//! feedback together behind the handful of calls an application needs:
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use swarm_core::prelude::*;
//!
//! let engine = Engine::builder(Config::load()?).build().await?;
//! let mut events = std::pin::pin!(engine.respond(ChatRequest::new("compare rust and go")));
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event);
//! }
//! engine.shutdown().await;
//! ```

mod stream;
pub mod tasks;

use std::sync::Arc;

use anyhow::Context;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collab::{CollabOutcome, CollabRequest, Orchestrator};
use crate::config::{BanditConfig, BanditParams, Config};
use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::evaluator::Evaluator;
use crate::feedback::{FeedbackAttributor, FeedbackReport, ReflectionReport, SelfReflection, Verdict};
use crate::format::{FormatDetector, FormatIntent};
use crate::llm::{
    CompletionOptions, Embedder, Message, MessageRole, ModelBackend, OpenRouterBackend,
    OpenRouterEmbedder,
};
use crate::routing::{
    AgentRegistry, RouteDecision, RouteReason, RouteTarget, Router, RouterConfig,
    SimilarityMatcher, strip_swarm_command,
};
use crate::storage::{Database, InteractionV2, NewCollabRun, RewardStore};
use crate::synthesis::{ChunkScorer, Synthesizer};

pub use stream::{AnswerEnvelope, CONTENT_PIECE_CHARS, ResponseEvent, content_pieces};
pub use tasks::{JobOutcome, PostAnswerJob, PostAnswerWorker, TaskQueue};

/// Which agents answer a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AgentChoice {
    /// Let the router decide
    #[default]
    Auto,
    /// One named agent, bypassing the router
    Agent(String),
    /// A fixed ensemble, bypassing the router
    Ensemble(Vec<String>),
}

impl AgentChoice {
    /// `"auto"` or an empty string selects routing, anything else names an agent
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("auto") {
            Self::Auto
        } else {
            Self::Agent(value.to_string())
        }
    }
}

/// One chat turn
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub agent: AgentChoice,
    pub force_ensemble: bool,
    pub user_id: Option<String>,
    pub system_prompt_override: Option<String>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self::from_messages(vec![Message::user(query)])
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: AgentChoice) -> Self {
        self.agent = agent;
        self
    }

    pub fn force_ensemble(mut self, force: bool) -> Self {
        self.force_ensemble = force;
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_system_prompt_override(mut self, prompt: Option<String>) -> Self {
        self.system_prompt_override = prompt;
        self
    }
}

/// Builds an [`Engine`] from configuration, with optional injected parts
pub struct EngineBuilder {
    config: Config,
    backend: Option<Arc<dyn ModelBackend>>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<RewardStore>>,
    bandit: Option<Arc<BanditConfig>>,
    chunk_scorer: Option<Arc<ChunkScorer>>,
    formats: Option<FormatDetector>,
}

impl EngineBuilder {
    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn store(mut self, store: Arc<RewardStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn bandit(mut self, bandit: Arc<BanditConfig>) -> Self {
        self.bandit = Some(bandit);
        self
    }

    pub fn chunk_scorer(mut self, scorer: Arc<ChunkScorer>) -> Self {
        self.chunk_scorer = Some(scorer);
        self
    }

    pub fn formats(mut self, formats: FormatDetector) -> Self {
        self.formats = Some(formats);
        self
    }

    /// Open missing parts from the config paths and start the task queue
    pub async fn build(self) -> anyhow::Result<Engine> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(AgentRegistry::new(
            config.agents.clone(),
            config.routing.default_agent.clone(),
            config.routing.router_agent.clone(),
        )?);

        let backend: Arc<dyn ModelBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(OpenRouterBackend::from_config(&config)?),
        };
        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => Arc::new(OpenRouterEmbedder::from_config(&config)?),
        };
        let embeddings = EmbeddingClient::new(embedder);

        let store = match self.store {
            Some(store) => store,
            None => {
                let path = config.database_path()?;
                let db = Database::open(&path)
                    .await
                    .with_context(|| format!("Failed to open database: {}", path.display()))?;
                Arc::new(
                    RewardStore::new(db.pool().clone())
                        .with_similarity_window(config.routing.similarity_window),
                )
            }
        };
        let bandit = match self.bandit {
            Some(bandit) => bandit,
            None => Arc::new(BanditConfig::load(Config::bandit_path()?)?),
        };
        let chunk_scorer = match self.chunk_scorer {
            Some(scorer) => scorer,
            None => Arc::new(ChunkScorer::load(config.chunk_model_path()?)?),
        };
        let formats = match self.formats {
            Some(formats) => formats,
            None => FormatDetector::load(&Config::format_keywords_path()?)?,
        };

        let router = Router::new(
            registry.clone(),
            backend.clone(),
            embeddings.clone(),
            store.clone(),
            bandit.clone(),
        )
        .with_config(RouterConfig::from(&config.routing))
        .with_matcher(SimilarityMatcher::from_config(&config.routing));

        let options = CompletionOptions::new(config.llm.temperature, config.llm.max_tokens);
        let synthesizer = Arc::new(Synthesizer::new(
            backend.clone(),
            embeddings.clone(),
            chunk_scorer.clone(),
            config.synthesis.clone(),
        ));
        let orchestrator = Orchestrator::new(
            registry.clone(),
            backend.clone(),
            embeddings.clone(),
            store.clone(),
            bandit.clone(),
            synthesizer,
            config.collab.clone(),
        )
        .with_options(options);

        let evaluator = Arc::new(Evaluator::new(backend.clone(), &config.evaluator));
        let reflection = SelfReflection::new(store.clone(), &config.learning);
        let tasks = TaskQueue::start(PostAnswerWorker::new(
            store.clone(),
            evaluator,
            embeddings.clone(),
            reflection.clone(),
            config.learning.clone(),
        ));

        info!(
            agents = registry.all().len(),
            evaluator = config.evaluator.enabled,
            embeddings = embeddings.is_available(),
            "Engine ready"
        );

        Ok(Engine {
            attributor: FeedbackAttributor::new(store.clone()),
            config,
            registry,
            backend,
            store,
            bandit,
            chunk_scorer,
            formats,
            router,
            orchestrator,
            reflection,
            tasks,
            options,
            cancel: CancellationToken::new(),
        })
    }
}

/// Adaptive routing and ensemble engine
pub struct Engine {
    config: Config,
    registry: Arc<AgentRegistry>,
    backend: Arc<dyn ModelBackend>,
    store: Arc<RewardStore>,
    bandit: Arc<BanditConfig>,
    chunk_scorer: Arc<ChunkScorer>,
    formats: FormatDetector,
    router: Router,
    orchestrator: Orchestrator,
    attributor: FeedbackAttributor,
    reflection: SelfReflection,
    tasks: TaskQueue,
    options: CompletionOptions,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("orchestrator", &self.orchestrator)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            backend: None,
            embedder: None,
            store: None,
            bandit: None,
            chunk_scorer: None,
            formats: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn store(&self) -> &RewardStore {
        &self.store
    }

    pub fn bandit(&self) -> &BanditConfig {
        &self.bandit
    }

    /// Whether an agent currently has credentials
    pub fn is_agent_available(&self, agent_id: &str) -> bool {
        self.registry
            .get(agent_id)
            .is_some_and(|a| self.backend.is_available(a))
    }

    pub fn detect_format(&self, query: &str) -> FormatIntent {
        self.formats.detect(query)
    }

    /// Route a query without answering it
    pub async fn route(&self, query: &str, force_ensemble: bool) -> Result<RouteDecision> {
        self.router.route(query, force_ensemble).await
    }

    /// Run an ensemble over explicit agents without persisting anything
    pub async fn run_ensemble(
        &self,
        agent_ids: Vec<String>,
        messages: Vec<Message>,
        system_prompt_override: Option<String>,
    ) -> Result<CollabOutcome> {
        let request = CollabRequest::new(agent_ids, messages)
            .with_system_prompt_override(system_prompt_override);
        self.orchestrator.run(request, &self.cancel.child_token()).await
    }

    /// Answer a chat turn as a stream of [`ResponseEvent`]s
    pub fn respond(&self, request: ChatRequest) -> impl Stream<Item = ResponseEvent> + '_ {
        async_stream::stream! {
            let response_id = Uuid::new_v4().to_string();
            let cancel = self.cancel.child_token();

            let mut messages: Vec<Message> = request
                .messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .cloned()
                .collect();
            let (command, query) = match messages.iter_mut().rev().find(|m| m.role == MessageRole::User) {
                Some(last) => {
                    let (command, stripped) = strip_swarm_command(&last.content);
                    let stripped = stripped.to_string();
                    last.content = stripped.clone();
                    (command, stripped)
                }
                None => (false, String::new()),
            };

            if query.trim().is_empty() {
                yield ResponseEvent::error(&Error::InvalidInput("query is empty".to_string()));
                return;
            }

            let decision = match self.decide(&request.agent, &query, request.force_ensemble || command).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(error = %e, "Routing failed");
                    yield ResponseEvent::error(&e);
                    return;
                }
            };

            yield ResponseEvent::SelectedAgent {
                agent_id: decision.target.primary().to_string(),
                reason: decision.reason,
                scores: decision.scores.clone(),
            };
            yield ResponseEvent::ResponseId { response_id: response_id.clone() };

            let intent = self.formats.detect(&query);
            let system_prompt_override = merge_override(request.system_prompt_override.as_deref(), intent.constraint());
            yield ResponseEvent::FormatIntent(intent);

            match &decision.target {
                RouteTarget::Ensemble { agent_ids } => {
                    yield ResponseEvent::CollabAgents { agent_ids: agent_ids.clone() };

                    let collab = CollabRequest::new(agent_ids.clone(), messages.clone())
                        .with_system_prompt_override(system_prompt_override)
                        .with_query_embedding(decision.query_embedding.clone());
                    let outcome = match self.orchestrator.run(collab, &cancel).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            yield ResponseEvent::error(&e);
                            return;
                        }
                    };

                    for text in content_pieces(&outcome.final_answer, CONTENT_PIECE_CHARS) {
                        yield ResponseEvent::Content { text };
                    }

                    let leader = outcome
                        .synthesizer_id
                        .clone()
                        .or_else(|| outcome.answering_agents().into_iter().next())
                        .unwrap_or_else(|| decision.target.primary().to_string());
                    self.persist_ensemble(&response_id, request.user_id.as_deref(), &query, &leader, decision.reason, &outcome).await;
                    if !outcome.all_failed() {
                        self.tasks.enqueue(PostAnswerJob {
                            response_id: response_id.clone(),
                            user_id: request.user_id.clone(),
                            agent_id: leader.clone(),
                            query: query.clone(),
                            response: outcome.final_answer.clone(),
                            query_embedding: decision.query_embedding.clone(),
                        });
                    }
                    yield ResponseEvent::Done { response_id: response_id.clone(), agent_id: leader };
                }
                RouteTarget::Single { agent_id } => {
                    let agent = match self.registry.require(agent_id) {
                        Ok(agent) => agent,
                        Err(e) => {
                            yield ResponseEvent::error(&e);
                            return;
                        }
                    };
                    if !self.backend.is_available(agent) {
                        yield ResponseEvent::error(&Error::AgentUnavailable(agent.id.clone()));
                        return;
                    }

                    let mut call = vec![Message::system(agent.system_prompt_with(system_prompt_override.as_deref()))];
                    call.extend(messages.iter().cloned());

                    let pieces = tokio::select! {
                        pieces = self.backend.complete_streaming(agent, call, self.options) => pieces,
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                    };
                    let mut pieces = match pieces {
                        Ok(pieces) => pieces,
                        Err(e) => {
                            warn!(agent = %agent.id, error = %e, "Agent call failed");
                            yield ResponseEvent::error(&e);
                            return;
                        }
                    };

                    let mut answer = String::new();
                    while let Some(piece) = pieces.next().await {
                        match piece {
                            Ok(text) if text.is_empty() => {}
                            Ok(text) => {
                                answer.push_str(&text);
                                yield ResponseEvent::Content { text };
                            }
                            Err(e) => {
                                warn!(agent = %agent.id, error = %e, "Agent stream failed");
                                yield ResponseEvent::error(&e);
                                return;
                            }
                        }
                    }
                    if answer.trim().is_empty() {
                        yield ResponseEvent::error(&Error::LLMError(format!("{} returned an empty response", agent.id)));
                        return;
                    }

                    self.tasks.enqueue(PostAnswerJob {
                        response_id: response_id.clone(),
                        user_id: request.user_id.clone(),
                        agent_id: agent.id.clone(),
                        query: query.clone(),
                        response: answer,
                        query_embedding: decision.query_embedding.clone(),
                    });
                    yield ResponseEvent::Done { response_id: response_id.clone(), agent_id: agent.id.clone() };
                }
            }
        }
    }

    /// Answer a chat turn and collect the whole answer
    pub async fn ask(&self, request: ChatRequest) -> Result<AnswerEnvelope> {
        AnswerEnvelope::collect(self.respond(request)).await
    }

    pub async fn record_feedback(
        &self,
        response_id: &str,
        user_id: Option<&str>,
        agent_ids: &[String],
        verdict: Verdict,
    ) -> Result<FeedbackReport> {
        self.attributor
            .record(response_id, user_id, agent_ids, verdict)
            .await
    }

    /// Run self-reflection now
    pub async fn reflect(&self) -> Result<ReflectionReport> {
        self.reflection.reflect().await
    }

    /// Apply the interaction retention cap now
    pub async fn prune(&self) -> Result<u64> {
        self.store
            .prune_interactions(
                self.config.learning.max_interactions,
                self.config.learning.prune_headroom,
            )
            .await
    }

    pub fn reload_bandit(&self) -> Result<BanditParams> {
        self.bandit.reload()
    }

    pub fn reload_chunk_model(&self) -> Result<bool> {
        self.chunk_scorer.reload()
    }

    /// Cancel in-flight answers and drain the background queue
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.shutdown().await;
    }

    async fn decide(&self, choice: &AgentChoice, query: &str, force_ensemble: bool) -> Result<RouteDecision> {
        match choice {
            AgentChoice::Auto => self.router.route(query, force_ensemble).await,
            AgentChoice::Agent(id) => {
                let agent_id = match self.registry.get(id) {
                    Some(agent) => agent.id.clone(),
                    None => {
                        let fallback = self.registry.default_agent().id.clone();
                        warn!(requested = %id, fallback = %fallback, "Unknown agent, using default");
                        fallback
                    }
                };
                Ok(RouteDecision::single(agent_id, RouteReason::Default))
            }
            AgentChoice::Ensemble(ids) => {
                if ids.is_empty() {
                    return Err(Error::InvalidInput("no agents provided for collaboration".to_string()));
                }
                Ok(RouteDecision::ensemble(ids.clone(), RouteReason::ForcedEnsemble))
            }
        }
    }

    async fn persist_ensemble(
        &self,
        response_id: &str,
        user_id: Option<&str>,
        query: &str,
        leader: &str,
        reason: RouteReason,
        outcome: &CollabOutcome,
    ) {
        let metrics = outcome.metrics();
        let run = NewCollabRun {
            response_id: response_id.to_string(),
            user_id: user_id.map(str::to_string),
            query: query.to_string(),
            agents_used: outcome.agents_used.clone(),
            leader_agent: leader.to_string(),
            router_reason: reason.as_str().to_string(),
            answers: outcome.answers.clone(),
            synthesizer_id: outcome.synthesizer_id.clone(),
            final_answer: outcome.final_answer.clone(),
            metrics: metrics.clone(),
        };
        if let Err(e) = self.store.insert_collab_run(&run).await {
            warn!(response_id, error = %e, "Failed to store collaboration run");
        }

        let record = InteractionV2 {
            response_id: response_id.to_string(),
            query: query.to_string(),
            agent_responses: outcome.answers.clone(),
            ucb_scores: outcome.agent_ucb_scores(),
            coherence_scores: outcome.coherence_scores(),
            novelty_scores: outcome.novelty_scores(),
            chunk_scores: metrics.chunk_scores,
            selected_chunks: metrics.selected_chunks,
            final_answer: outcome.final_answer.clone(),
            feedback: None,
        };
        if let Err(e) = self.store.insert_interaction_v2(&record).await {
            warn!(response_id, error = %e, "Failed to store ensemble record");
        }
        debug!(response_id, leader, "Ensemble persisted");
    }
}

/// Append the format constraint to the caller's system prompt override
fn merge_override(base: Option<&str>, constraint: &str) -> Option<String> {
    let base = base.map(str::trim).filter(|b| !b.is_empty());
    match (base, constraint.is_empty()) {
        (None, true) => None,
        (Some(base), true) => Some(base.to_string()),
        (None, false) => Some(constraint.to_string()),
        (Some(base), false) => Some(format!("{}\n\n{}", base, constraint)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::llm::EVALUATOR_ID;
    use crate::storage::reward_store::tests::create_test_store;
    use crate::testing::{FakeBackend, FakeEmbedder, Script};

    const JUDGE_REPLY: &str = r#"{"relevance":0.9,"accuracy":0.9,"clarity":0.9,"usefulness":0.9,"notes":"ok"}"#;

    async fn engine(backend: FakeBackend) -> (Engine, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let engine = Engine::builder(Config::default())
            .backend(backend.clone())
            .embedder(Arc::new(FakeEmbedder::new()))
            .store(Arc::new(create_test_store().await))
            .bandit(Arc::new(BanditConfig::in_memory(BanditParams::default())))
            .chunk_scorer(Arc::new(ChunkScorer::fixed(None)))
            .formats(FormatDetector::default())
            .build()
            .await
            .unwrap();
        (engine, backend)
    }

    async fn events(engine: &Engine, request: ChatRequest) -> Vec<ResponseEvent> {
        engine.respond(request).collect().await
    }

    #[test]
    fn test_merge_override() {
        assert_eq!(merge_override(None, ""), None);
        assert_eq!(merge_override(Some("  "), "X"), Some("X".to_string()));
        assert_eq!(merge_override(Some("Be brief."), "X"), Some("Be brief.\n\nX".to_string()));
        assert_eq!(AgentChoice::parse("Auto"), AgentChoice::Auto);
        assert_eq!(AgentChoice::parse("solar"), AgentChoice::Agent("solar".to_string()));
    }

    #[tokio::test]
    async fn test_single_agent_event_order() {
        let backend = FakeBackend::new()
            .reply("solar", "Rust is a systems language.")
            .reply(EVALUATOR_ID, JUDGE_REPLY);
        let (engine, _) = engine(backend).await;

        let request = ChatRequest::new("what is rust").with_agent(AgentChoice::Agent("solar".to_string()));
        let events = events(&engine, request).await;

        assert!(matches!(&events[0], ResponseEvent::SelectedAgent { agent_id, .. } if agent_id == "solar"));
        let ResponseEvent::ResponseId { response_id } = &events[1] else {
            panic!("expected response id, got {:?}", events[1]);
        };
        assert!(Uuid::parse_str(response_id).is_ok());
        assert!(matches!(events[2], ResponseEvent::FormatIntent(_)));
        assert!(matches!(&events[3], ResponseEvent::Content { text } if text == "Rust is a systems language."));
        assert!(matches!(events.last(), Some(ResponseEvent::Done { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        engine.shutdown().await;
        let stored = engine.store().interaction_by_response(response_id).await.unwrap().unwrap();
        assert_eq!(stored.agent_id, "solar");
        assert!(stored.overall_score.is_some());
    }

    #[tokio::test]
    async fn test_unknown_agent_falls_back_to_default() {
        let (engine, backend) = engine(FakeBackend::new()).await;
        let envelope = engine
            .ask(ChatRequest::new("hello").with_agent(AgentChoice::Agent("nobody".to_string())))
            .await
            .unwrap();
        assert_eq!(envelope.agent_id, "arcee");
        assert_eq!(envelope.content, "arcee answer");
        assert_eq!(backend.calls_for("arcee").len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_swarm_command_runs_ensemble_and_persists() {
        let backend = FakeBackend::new()
            .reply("arcee", "Rust has ownership. It prevents data races.")
            .reply("solar", "Go has goroutines.")
            .reply(EVALUATOR_ID, JUDGE_REPLY);
        let (engine, backend) = engine(backend).await;

        let events = events(&engine, ChatRequest::new("/SWARM compare rust and go")).await;
        let agents = events
            .iter()
            .find_map(|e| match e {
                ResponseEvent::CollabAgents { agent_ids } => Some(agent_ids.clone()),
                _ => None,
            })
            .unwrap();
        assert!(agents.len() >= 2);

        let envelope = AnswerEnvelope::collect(futures_util::stream::iter(events)).await.unwrap();
        assert!(!envelope.content.is_empty());

        // the command never reaches the agents
        let call = &backend.calls_for(&agents[0])[0];
        assert_eq!(call.messages.last().unwrap().content, "compare rust and go");

        engine.shutdown().await;
        let run = engine.store().collab_run_details(&envelope.response_id).await.unwrap().unwrap();
        assert_eq!(run.router_reason, "forced_ensemble");
        let record = engine
            .store()
            .interaction_v2_by_response_id(&envelope.response_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.final_answer, envelope.content);
        assert!(!record.selected_chunks.is_empty());

        let report = engine
            .record_feedback(&envelope.response_id, None, &[], Verdict::Up)
            .await
            .unwrap();
        assert!(report.run_found);
        let total: f64 = report.attributions.iter().map(|a| a.contribution).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_long_ensemble_answer_is_chunked() {
        let long = "word ".repeat(120);
        let backend = FakeBackend::new()
            .reply("solar", long.trim())
            .reply("qwen", long.trim());
        let (engine, _) = engine(backend).await;

        let request = ChatRequest::new("explain")
            .with_agent(AgentChoice::Ensemble(vec!["solar".to_string(), "qwen".to_string()]));
        let events = events(&engine, request).await;
        let pieces: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ResponseEvent::Content { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.chars().count() <= CONTENT_PIECE_CHARS));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_format_constraint_reaches_agent() {
        let (engine, backend) = engine(FakeBackend::new()).await;
        engine
            .ask(
                ChatRequest::new("show me a table of sorting algorithms")
                    .with_agent(AgentChoice::Agent("qwen".to_string())),
            )
            .await
            .unwrap();
        let call = &backend.calls_for("qwen")[0];
        assert!(call.messages[0].content.contains("[Chat Override]\nUser requested format: TABLE."));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unavailable_agents_end_with_error() {
        let mut backend = FakeBackend::new();
        for agent in AgentRegistry::with_defaults().all() {
            backend = backend.script(&agent.id, Script::Unavailable);
        }
        let (engine, _) = engine(backend).await;

        let events = events(&engine, ChatRequest::new("hi")).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ResponseEvent::Error { code, .. } if code == "E003"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_failed_ensemble_is_not_evaluated() {
        let backend = FakeBackend::new()
            .script("solar", Script::Fail)
            .script("qwen", Script::Slow(Duration::from_millis(10), String::new()));
        let (engine, _) = engine(backend).await;

        let envelope = engine
            .ask(ChatRequest::new("hi").with_agent(AgentChoice::Ensemble(vec![
                "solar".to_string(),
                "qwen".to_string(),
            ])))
            .await
            .unwrap();
        assert_eq!(envelope.content, crate::collab::ALL_FAILED_ANSWER);
        engine.shutdown().await;
        assert_eq!(engine.store().interaction_count().await.unwrap(), 0);
    }
}
