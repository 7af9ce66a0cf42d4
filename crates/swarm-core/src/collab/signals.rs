//! Per-agent answer signals

use std::collections::{BTreeMap, HashMap};

use futures_util::future::join_all;

use super::AgentSignal;
use crate::embedding::{EmbeddingClient, cosine_similarity};
use crate::llm::{EMBED_MAX_CHARS, ModelBackend, truncate_chars};
use crate::routing::AgentRegistry;
use crate::routing::bandit::usage_frequency;
use crate::storage::AgentStat;

/// `cos(query, answer)` clamped to [0, 1]; 0.5 when either embedding is missing
pub fn coherence_score(query: Option<&[f32]>, answer: Option<&[f32]>) -> f64 {
    match (query, answer) {
        (Some(q), Some(a)) => cosine_similarity(q, a).clamp(0.0, 1.0),
        _ => 0.5,
    }
}

/// `1 - max cosine to every other answer`, clamped; 0 without comparisons
pub fn novelty_scores(embeddings: &[Option<Vec<f32>>]) -> Vec<f64> {
    embeddings
        .iter()
        .enumerate()
        .map(|(i, own)| {
            let Some(own) = own else {
                return 0.0;
            };
            let max_sim = embeddings
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .filter_map(|(_, other)| other.as_deref())
                .map(|other| cosine_similarity(own, other))
                .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));
            match max_sim {
                Some(sim) => (1.0 - sim).clamp(0.0, 1.0),
                None => 0.0,
            }
        })
        .collect()
}

/// Signals for every answering agent, in answer order
///
/// `answers` holds `(agent_id, text)` pairs; `ucb_scores` are normalized bandit scores.
pub async fn compute_signals(
    embeddings: &EmbeddingClient,
    query_embedding: Option<&[f32]>,
    answers: &[(String, String)],
    stats: &HashMap<String, AgentStat>,
    ucb_scores: &BTreeMap<String, f64>,
    diversity_penalty: f64,
) -> Vec<AgentSignal> {
    let answer_embeddings: Vec<Option<Vec<f32>>> = join_all(
        answers
            .iter()
            .map(|(_, text)| embeddings.embed(truncate_chars(text, EMBED_MAX_CHARS))),
    )
    .await;
    let novelty = novelty_scores(&answer_embeddings);

    answers
        .iter()
        .zip(answer_embeddings.iter())
        .zip(novelty)
        .map(|(((agent_id, _), embedding), novelty)| {
            let factual = stats
                .get(agent_id)
                .map(|s| s.mean_reward)
                .filter(|m| m.is_finite())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);
            let ucb = ucb_scores.get(agent_id).copied().unwrap_or(0.0);

            AgentSignal {
                agent_id: agent_id.clone(),
                factual,
                ucb: ucb - diversity_penalty * (1.0 - novelty),
                coherence: coherence_score(query_embedding, embedding.as_deref()),
                novelty,
                usage_frequency: usage_frequency(agent_id, stats),
            }
        })
        .collect()
}

/// Highest-factual available agent, else the default agent if available, else the first answerer
pub fn choose_synthesizer(
    signals: &[AgentSignal],
    registry: &AgentRegistry,
    backend: &dyn ModelBackend,
) -> Option<String> {
    let available = |id: &str| registry.get(id).is_some_and(|a| backend.is_available(a));

    let mut best: Option<&AgentSignal> = None;
    for signal in signals.iter().filter(|s| available(&s.agent_id)) {
        if best.is_none_or(|b| signal.factual > b.factual) {
            best = Some(signal);
        }
    }
    if let Some(best) = best {
        return Some(best.agent_id.clone());
    }

    let default = registry.default_agent();
    if backend.is_available(default) {
        return Some(default.id.clone());
    }
    signals.first().map(|s| s.agent_id.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::testing::{FakeBackend, FakeEmbedder, Script};

    #[test]
    fn test_novelty_by_index() {
        let embeddings = vec![
            Some(vec![1.0, 0.0]),
            Some(vec![1.0, 0.0]),
            Some(vec![0.0, 1.0]),
            None,
        ];
        let novelty = novelty_scores(&embeddings);
        assert_eq!(novelty[0], 0.0);
        assert_eq!(novelty[1], 0.0);
        assert_eq!(novelty[2], 1.0);
        assert_eq!(novelty[3], 0.0);

        assert_eq!(novelty_scores(&[Some(vec![1.0])]), vec![0.0]);
    }

    #[test]
    fn test_coherence_defaults() {
        let up = [1.0f32, 0.0];
        let down = [-1.0f32, 0.0];
        assert_eq!(coherence_score(None, Some(&up[..])), 0.5);
        assert_eq!(coherence_score(Some(&up[..]), Some(&down[..])), 0.0);
    }

    #[tokio::test]
    async fn test_compute_signals_applies_penalty() {
        let embeddings = EmbeddingClient::new(Arc::new(FakeEmbedder::new()));
        let answers = vec![
            ("solar".to_string(), "same words here".to_string()),
            ("qwen".to_string(), "same words here".to_string()),
        ];
        let stats = HashMap::from([(
            "solar".to_string(),
            AgentStat {
                agent_id: "solar".to_string(),
                pulls: 3,
                mean_reward: 0.9,
                updated_at: Utc::now(),
            },
        )]);
        let ucb = BTreeMap::from([("solar".to_string(), 1.0), ("qwen".to_string(), 0.5)]);

        let signals = compute_signals(&embeddings, None, &answers, &stats, &ucb, 0.2).await;
        assert_eq!(signals.len(), 2);
        // identical answers: novelty 0, full penalty
        assert!((signals[0].ucb - 0.8).abs() < 1e-9);
        assert!((signals[1].ucb - 0.3).abs() < 1e-9);
        assert_eq!(signals[0].factual, 0.9);
        assert_eq!(signals[1].factual, 0.5);
        assert_eq!(signals[0].coherence, 0.5);
        assert!((signals[0].usage_frequency - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_choose_synthesizer() {
        let registry = AgentRegistry::with_defaults();
        let sig = |id: &str, factual: f64| AgentSignal {
            agent_id: id.to_string(),
            factual,
            ..Default::default()
        };
        let signals = vec![sig("solar", 0.4), sig("qwen", 0.9)];

        let backend = FakeBackend::new();
        assert_eq!(choose_synthesizer(&signals, &registry, &backend).as_deref(), Some("qwen"));

        let backend = FakeBackend::new()
            .script("solar", Script::Unavailable)
            .script("qwen", Script::Unavailable);
        assert_eq!(choose_synthesizer(&signals, &registry, &backend).as_deref(), Some("arcee"));

        let backend = backend.script("arcee", Script::Unavailable);
        assert_eq!(choose_synthesizer(&signals, &registry, &backend).as_deref(), Some("solar"));
    }
}
