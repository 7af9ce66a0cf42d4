//! Top-chunk merge with a single coherence pass

use std::cmp::Ordering;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use super::chunker::split_chunks;
use super::scorer::{ChunkScorer, blend, heuristic_score};
use super::{ChunkFeatures, ChunkRecord};
use crate::collab::AgentSignal;
use crate::config::SynthesisConfig;
use crate::embedding::{EmbeddingClient, cosine_similarity};
use crate::llm::{CompletionOptions, Message, ModelBackend};
use crate::routing::AgentSpec;
use crate::storage::SelectedChunk;

/// Relevance used when an embedding is missing
const NEUTRAL_RELEVANCE: f64 = 0.5;

pub const COHERENCE_SYSTEM_PROMPT: &str = "Smooth and unify the merged answer for coherence, style, and logical flow. \
Preserve the markdown structure exactly: keep every table and code fence intact. \
Do not add new facts.";

/// Answers to merge, each with its agent's signals
#[derive(Debug, Clone)]
pub struct SynthesisInput<'a> {
    pub query: &'a str,
    pub query_embedding: Option<&'a [f32]>,
    pub answers: Vec<(AgentSignal, String)>,
    /// Agent running the coherence pass
    pub synthesizer: Option<&'a AgentSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisOutcome {
    pub final_answer: String,
    /// Selected chunks joined before the coherence pass
    pub composite: String,
    /// Every scored chunk, in agent then chunk order
    pub chunks: Vec<ChunkRecord>,
    /// Selected chunks in ranking order
    pub selected: Vec<SelectedChunk>,
    pub degraded: bool,
    pub coherence_applied: bool,
}

pub struct Synthesizer {
    backend: Arc<dyn ModelBackend>,
    embeddings: EmbeddingClient,
    scorer: Arc<ChunkScorer>,
    config: SynthesisConfig,
}

impl std::fmt::Debug for Synthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synthesizer")
            .field("scorer", &self.scorer)
            .field("config", &self.config)
            .finish()
    }
}

impl Synthesizer {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        embeddings: EmbeddingClient,
        scorer: Arc<ChunkScorer>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            backend,
            embeddings,
            scorer,
            config,
        }
    }

    pub fn scorer(&self) -> &ChunkScorer {
        &self.scorer
    }

    pub async fn synthesize(&self, input: SynthesisInput<'_>) -> SynthesisOutcome {
        let (mut chunks, degraded) = self.score_chunks(&input).await;
        let selected = select_top(&mut chunks, self.config.top_chunks);

        let composite = selected
            .iter()
            .filter_map(|s| {
                chunks
                    .iter()
                    .find(|c| c.agent_id == s.agent_id && c.chunk_id == s.chunk_id)
                    .map(|c| c.text.as_str())
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let polished = self.coherence_pass(input.synthesizer, &composite).await;
        let coherence_applied = polished.is_some();
        let final_answer = polished.unwrap_or_else(|| composite.clone());

        debug!(
            chunks = chunks.len(),
            selected = selected.len(),
            degraded,
            coherence_applied,
            "Synthesized ensemble answer"
        );

        SynthesisOutcome {
            final_answer,
            composite,
            chunks,
            selected,
            degraded,
            coherence_applied,
        }
    }

    /// Chunk every answer and score each chunk; embeddings are fetched concurrently
    pub async fn score_chunks(&self, input: &SynthesisInput<'_>) -> (Vec<ChunkRecord>, bool) {
        let pieces: Vec<(&AgentSignal, super::Chunk)> = input
            .answers
            .iter()
            .flat_map(|(signal, text)| split_chunks(text).into_iter().map(move |c| (signal, c)))
            .collect();

        let embeddings: Vec<Option<Vec<f32>>> = match input.query_embedding {
            Some(_) => join_all(pieces.iter().map(|(_, c)| self.embeddings.embed(&c.text))).await,
            None => vec![None; pieces.len()],
        };

        let mut degraded = false;
        let records = pieces
            .into_iter()
            .zip(embeddings)
            .map(|((signal, chunk), embedding)| {
                let (relevance, chunk_degraded) = match (input.query_embedding, embedding.as_deref()) {
                    (Some(q), Some(c)) => (cosine_similarity(q, c), false),
                    _ => (NEUTRAL_RELEVANCE, true),
                };
                degraded |= chunk_degraded;

                let features = ChunkFeatures {
                    agent_ucb: signal.ucb,
                    agent_factual: signal.factual,
                    agent_coherence: signal.coherence,
                    chunk_relevance: relevance,
                    agent_novelty: signal.novelty,
                    agent_usage_frequency: signal.usage_frequency,
                };
                let heuristic = heuristic_score(&features, self.config.novelty_weight);
                let learned = self.scorer.learned(&features);
                let blended = blend(
                    heuristic,
                    learned,
                    self.config.heuristic_weight,
                    self.config.learned_weight,
                );

                ChunkRecord {
                    agent_id: signal.agent_id.clone(),
                    chunk_id: chunk.id,
                    kind: chunk.kind,
                    text: chunk.text,
                    features,
                    relevance,
                    heuristic_score: heuristic,
                    learned_score: learned,
                    blended_score: blended,
                    selected: false,
                    degraded: chunk_degraded,
                }
            })
            .collect();

        (records, degraded)
    }

    /// One smoothing call; `None` when unavailable, failed or empty
    pub async fn coherence_pass(&self, agent: Option<&AgentSpec>, composite: &str) -> Option<String> {
        let agent = agent?;
        if composite.trim().is_empty() || !self.backend.is_available(agent) {
            return None;
        }

        let messages = vec![
            Message::system(COHERENCE_SYSTEM_PROMPT),
            Message::user(composite),
        ];
        let options = CompletionOptions::new(
            self.config.coherence_temperature,
            self.config.coherence_max_tokens,
        );

        match self.backend.complete(agent, messages, options).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => {
                warn!(agent = %agent.id, "Coherence pass returned empty text");
                None
            }
            Err(e) => {
                warn!(agent = %agent.id, error = %e, "Coherence pass failed");
                None
            }
        }
    }
}

/// Mark the `top` best chunks selected and return them in ranking order
///
/// Stable: equal scores keep agent then chunk order.
pub(crate) fn select_top(chunks: &mut [ChunkRecord], top: usize) -> Vec<SelectedChunk> {
    let mut order: Vec<usize> = (0..chunks.len()).collect();
    order.sort_by(|&a, &b| {
        chunks[b]
            .blended_score
            .partial_cmp(&chunks[a].blended_score)
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(top);

    order
        .into_iter()
        .map(|i| {
            chunks[i].selected = true;
            SelectedChunk {
                agent_id: chunks[i].agent_id.clone(),
                chunk_id: chunks[i].chunk_id,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::synthesis::{ChunkKind, LinearChunkModel};
    use crate::testing::{FakeBackend, FakeEmbedder, Script};

    fn signal(id: &str, ucb: f64, factual: f64) -> AgentSignal {
        AgentSignal {
            agent_id: id.to_string(),
            factual,
            ucb,
            coherence: 0.8,
            novelty: 0.0,
            usage_frequency: 0.0,
        }
    }

    fn synthesizer(backend: FakeBackend, embedder: FakeEmbedder, model: Option<LinearChunkModel>) -> Synthesizer {
        Synthesizer::new(
            Arc::new(backend),
            EmbeddingClient::new(Arc::new(embedder)),
            Arc::new(ChunkScorer::fixed(model)),
            Config::default().synthesis,
        )
    }

    #[tokio::test]
    async fn test_top_chunks_from_stronger_agent_lead() {
        let synth = synthesizer(FakeBackend::new().script("arcee", Script::Fail), FakeEmbedder::new(), None);
        let query = "rust memory safety";
        let query_embedding = FakeEmbedder::vector_for(query);
        let arcee = AgentSpec::new("arcee", "m");

        let outcome = synth
            .synthesize(SynthesisInput {
                query,
                query_embedding: Some(&query_embedding),
                answers: vec![
                    (signal("solar", 1.0, 0.9), "Rust memory safety comes from ownership. The borrow checker enforces it.".to_string()),
                    (signal("qwen", 0.1, 0.5), "Rust memory safety is nice.".to_string()),
                ],
                synthesizer: Some(&arcee),
            })
            .await;

        assert_eq!(outcome.chunks.len(), 3);
        assert_eq!(outcome.selected.len(), 3);
        assert_eq!(outcome.selected[0].agent_id, "solar");
        assert!(outcome.chunks.iter().all(|c| c.selected && !c.degraded));
        assert!(!outcome.degraded);
        // coherence pass failed: composite returned unchanged
        assert!(!outcome.coherence_applied);
        assert_eq!(outcome.final_answer, outcome.composite);
        assert!(outcome.composite.contains("\n\n"));
    }

    #[tokio::test]
    async fn test_selects_at_most_top_chunks() {
        let synth = synthesizer(FakeBackend::new().reply("arcee", "polished"), FakeEmbedder::new(), None);
        let long: String = (0..20).map(|i| format!("Sentence {i}. ")).collect();
        let arcee = AgentSpec::new("arcee", "m");
        let emb = FakeEmbedder::vector_for("sentence");

        let outcome = synth
            .synthesize(SynthesisInput {
                query: "sentence",
                query_embedding: Some(&emb),
                answers: vec![(signal("solar", 0.5, 0.5), long)],
                synthesizer: Some(&arcee),
            })
            .await;

        assert_eq!(outcome.chunks.len(), 20);
        assert_eq!(outcome.selected.len(), 12);
        assert_eq!(outcome.chunks.iter().filter(|c| c.selected).count(), 12);
        assert_eq!(outcome.final_answer, "polished");
        assert!(outcome.coherence_applied);
    }

    #[tokio::test]
    async fn test_missing_embeddings_degrade_relevance() {
        let synth = synthesizer(FakeBackend::new(), FakeEmbedder::unavailable(), None);
        let outcome = synth
            .synthesize(SynthesisInput {
                query: "q",
                query_embedding: None,
                answers: vec![(signal("solar", 1.0, 1.0), "```\ncode\n```".to_string())],
                synthesizer: None,
            })
            .await;

        assert!(outcome.degraded);
        assert_eq!(outcome.chunks[0].kind, ChunkKind::Code);
        assert_eq!(outcome.chunks[0].relevance, 0.5);
        assert_eq!(outcome.final_answer, "```\ncode\n```");
    }

    #[tokio::test]
    async fn test_learned_model_blends() {
        let model = LinearChunkModel {
            weights: Default::default(),
            bias: 0.0,
        };
        let synth = synthesizer(FakeBackend::new(), FakeEmbedder::unavailable(), Some(model));
        let outcome = synth
            .synthesize(SynthesisInput {
                query: "q",
                query_embedding: None,
                answers: vec![(signal("solar", 1.0, 1.0), "Only one.".to_string())],
                synthesizer: None,
            })
            .await;

        let chunk = &outcome.chunks[0];
        assert_eq!(chunk.learned_score, Some(0.5));
        let expected = 0.6 * chunk.heuristic_score + 0.4 * 0.5;
        assert!((chunk.blended_score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_select_top_is_stable() {
        let record = |agent: &str, id: usize, score: f64| ChunkRecord {
            agent_id: agent.to_string(),
            chunk_id: id,
            kind: ChunkKind::Sentence,
            text: format!("{agent}-{id}"),
            features: ChunkFeatures::default(),
            relevance: 0.5,
            heuristic_score: score,
            learned_score: None,
            blended_score: score,
            selected: false,
            degraded: false,
        };
        let mut chunks = vec![record("a", 0, 0.5), record("b", 0, 0.9), record("a", 1, 0.5)];
        let selected = select_top(&mut chunks, 2);
        assert_eq!(selected[0].agent_id, "b");
        assert_eq!((selected[1].agent_id.as_str(), selected[1].chunk_id), ("a", 0));
        assert!(!chunks[2].selected);
    }
}
