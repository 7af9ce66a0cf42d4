//! Nearest-neighbour routing over past queries
//!
//! Each stored interaction whose query embedding is close enough to the new
//! query casts a vote for the agent that answered it, weighted by how well
//! that answer was judged.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::RoutingConfig;
use crate::error::Result;
use crate::storage::{RewardStore, SimilarInteraction};

/// Minimum cosine similarity for a past interaction to vote
pub const DEFAULT_THRESHOLD: f64 = 0.78;

/// Neighbours fetched from the store
pub const DEFAULT_TOP_K: usize = 25;

/// Winning agent of a similarity vote
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatch {
    pub agent_id: String,
    pub vote: f64,
    /// Every agent's accumulated vote
    pub votes: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityMatcher {
    threshold: f64,
    top_k: usize,
}

impl Default for SimilarityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_TOP_K)
    }
}

impl SimilarityMatcher {
    pub fn new(threshold: f64, top_k: usize) -> Self {
        Self { threshold, top_k }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(config.similarity_threshold, config.similarity_top_k)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Aggregate votes from neighbours; `eligible` filters agents that may be routed to
    pub fn tally<F>(&self, hits: &[SimilarInteraction], eligible: F) -> Option<SimilarityMatch>
    where
        F: Fn(&str) -> bool,
    {
        let mut order: Vec<String> = Vec::new();
        let mut votes: BTreeMap<String, f64> = BTreeMap::new();

        for hit in hits {
            if !hit.similarity.is_finite() || hit.similarity < self.threshold {
                continue;
            }
            if !eligible(&hit.agent_id) {
                continue;
            }
            let sim = hit.similarity.clamp(0.0, 1.0);
            let quality = hit
                .overall_score
                .filter(|s| s.is_finite())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);

            if !votes.contains_key(&hit.agent_id) {
                order.push(hit.agent_id.clone());
            }
            *votes.entry(hit.agent_id.clone()).or_insert(0.0) += sim * (0.25 + 0.75 * quality);
        }

        // first agent to reach the maximum wins ties
        let mut best: Option<(&String, f64)> = None;
        for id in &order {
            let vote = votes[id];
            if best.is_none_or(|(_, b)| vote > b) {
                best = Some((id, vote));
            }
        }

        let (agent_id, vote) = best?;
        if vote <= 0.0 {
            return None;
        }
        Some(SimilarityMatch {
            agent_id: agent_id.clone(),
            vote,
            votes: votes.clone(),
        })
    }

    /// Query the store and tally the neighbours of `embedding`
    pub async fn find<F>(
        &self,
        store: &RewardStore,
        embedding: &[f32],
        eligible: F,
    ) -> Result<Option<SimilarityMatch>>
    where
        F: Fn(&str) -> bool,
    {
        let hits = store.similar_by_embedding(embedding, self.top_k).await?;
        let result = self.tally(&hits, eligible);
        debug!(
            neighbours = hits.len(),
            matched = result.as_ref().map(|m| m.agent_id.as_str()).unwrap_or("none"),
            "Similarity lookup"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewInteraction;
    use crate::storage::reward_store::tests::create_test_store;

    fn hit(agent: &str, similarity: f64, score: Option<f64>) -> SimilarInteraction {
        SimilarInteraction {
            interaction_id: 1,
            agent_id: agent.to_string(),
            similarity,
            overall_score: score,
        }
    }

    #[test]
    fn test_votes_weighted_by_quality() {
        let matcher = SimilarityMatcher::default();
        let hits = vec![
            hit("solar", 0.9, Some(0.2)),
            hit("qwen", 0.85, Some(1.0)),
            hit("solar", 0.8, None),
        ];
        let m = matcher.tally(&hits, |_| true).unwrap();
        // solar: 0.9*(0.25+0.15) + 0.8*(0.25+0.375) = 0.36 + 0.5 = 0.86
        // qwen: 0.85
        assert_eq!(m.agent_id, "solar");
        assert!((m.votes["solar"] - 0.86).abs() < 1e-9);
        assert!((m.votes["qwen"] - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_below_threshold_never_matches() {
        let matcher = SimilarityMatcher::default();
        assert!(matcher.tally(&[hit("solar", 0.5, Some(1.0))], |_| true).is_none());
        assert!(matcher.tally(&[], |_| true).is_none());
    }

    #[test]
    fn test_ineligible_agents_do_not_vote() {
        let matcher = SimilarityMatcher::default();
        let hits = vec![hit("retired", 0.99, Some(1.0)), hit("arcee", 0.8, Some(0.5))];
        let m = matcher.tally(&hits, |id| id != "retired").unwrap();
        assert_eq!(m.agent_id, "arcee");
        assert!(!m.votes.contains_key("retired"));
    }

    #[tokio::test]
    async fn test_find_against_store() {
        let store = create_test_store().await;
        store
            .insert_interaction(&NewInteraction {
                agent_id: "nemotron".to_string(),
                query: "capital of france".to_string(),
                response: "Paris".to_string(),
                query_embedding: Some(vec![1.0, 0.0, 0.0]),
                overall_score: Some(0.9),
                ..Default::default()
            })
            .await
            .unwrap();

        let matcher = SimilarityMatcher::default();
        let close = matcher
            .find(&store, &[0.95, 0.1, 0.0], |_| true)
            .await
            .unwrap();
        assert_eq!(close.unwrap().agent_id, "nemotron");

        let far = matcher.find(&store, &[0.0, 1.0, 0.0], |_| true).await.unwrap();
        assert!(far.is_none());
    }
}
