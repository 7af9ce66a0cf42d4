//! Credit attribution for explicit feedback

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::Verdict;
use crate::error::{Error, Result};
use crate::storage::{ChunkTrainingExample, InteractionV2, RewardLogEntry, RewardStore};

/// Reward credited to one agent for one feedback event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribution {
    pub agent_id: String,
    /// Share of the final answer, the shares of one event sum to 1
    pub contribution: f64,
    pub ucb_weight: f64,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackReport {
    pub response_id: String,
    pub verdict: Verdict,
    pub attributions: Vec<Attribution>,
    /// Whether an ensemble record existed for the response
    pub run_found: bool,
    pub training_examples: usize,
}

/// Split credit for `raw` across agents
///
/// With selected chunks on record, each contributing agent gets its share of
/// the selected chunks. Otherwise credit splits evenly across `agent_ids`.
pub fn attribute(record: Option<&InteractionV2>, agent_ids: &[String], raw: f64) -> Vec<Attribution> {
    let mut shares: Vec<(String, f64)> = Vec::new();

    match record.filter(|r| !r.selected_chunks.is_empty()) {
        Some(record) => {
            let total = record.selected_chunks.len() as f64;
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            let mut order: Vec<&str> = Vec::new();
            for chunk in &record.selected_chunks {
                let count = counts.entry(chunk.agent_id.as_str()).or_insert(0);
                if *count == 0 {
                    order.push(chunk.agent_id.as_str());
                }
                *count += 1;
            }
            for agent in order {
                shares.push((agent.to_string(), counts[agent] as f64 / total));
            }
        }
        None => {
            let mut unique: Vec<&String> = Vec::new();
            for id in agent_ids {
                if !id.trim().is_empty() && !unique.contains(&id) {
                    unique.push(id);
                }
            }
            let n = unique.len() as f64;
            shares.extend(unique.into_iter().map(|id| (id.clone(), 1.0 / n)));
        }
    }

    shares
        .into_iter()
        .map(|(agent_id, contribution)| {
            let ucb_weight = record
                .and_then(|r| r.ucb_scores.get(&agent_id))
                .copied()
                .filter(|w| w.is_finite())
                .unwrap_or(1.0);
            Attribution {
                reward: raw * contribution * ucb_weight,
                agent_id,
                contribution,
                ucb_weight,
            }
        })
        .collect()
}

/// Applies feedback to the reward store
#[derive(Debug, Clone)]
pub struct FeedbackAttributor {
    store: Arc<RewardStore>,
}

impl FeedbackAttributor {
    pub fn new(store: Arc<RewardStore>) -> Self {
        Self { store }
    }

    /// Record the event, credit agents, and log chunk training examples
    ///
    /// Without selected chunks or `agent_ids`, the agent recorded for the
    /// response is credited. Only an empty response id is an error; storage
    /// failures are logged.
    pub async fn record(
        &self,
        response_id: &str,
        user_id: Option<&str>,
        agent_ids: &[String],
        verdict: Verdict,
    ) -> Result<FeedbackReport> {
        let response_id = response_id.trim();
        if response_id.is_empty() {
            return Err(Error::InvalidInput("response id is required".to_string()));
        }
        let raw = verdict.reward();

        if let Err(e) = self.store.insert_feedback(response_id, user_id, agent_ids, verdict).await {
            warn!(response_id, error = %e, "Failed to store feedback event");
        }

        let record = match self.store.interaction_v2_by_response_id(response_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(response_id, error = %e, "Failed to load ensemble record");
                None
            }
        };
        if record.is_some()
            && let Err(e) = self.store.update_interaction_v2_feedback(response_id, verdict).await
        {
            warn!(response_id, error = %e, "Failed to attach feedback to ensemble record");
        }

        let has_chunks = record.as_ref().is_some_and(|r| !r.selected_chunks.is_empty());
        let mut targets = agent_ids.to_vec();
        if !has_chunks && targets.iter().all(|id| id.trim().is_empty()) {
            match self.store.interaction_by_response(response_id).await {
                Ok(Some(interaction)) => targets = vec![interaction.agent_id],
                Ok(None) => {}
                Err(e) => warn!(response_id, error = %e, "Failed to load answering agent"),
            }
        }

        let attributions = attribute(record.as_ref(), &targets, raw);
        for attribution in &attributions {
            if let Err(e) = self.store.upsert_agent_stat(&attribution.agent_id, attribution.reward).await {
                warn!(agent = %attribution.agent_id, error = %e, "Failed to update agent stat");
            }
            let entry = RewardLogEntry {
                response_id: response_id.to_string(),
                user_id: user_id.map(str::to_string),
                agent_id: attribution.agent_id.clone(),
                raw_feedback: raw,
                contribution: attribution.contribution,
                ucb_weight: attribution.ucb_weight,
                reward: attribution.reward,
                created_at: Utc::now(),
            };
            if let Err(e) = self.store.insert_reward_log(&entry).await {
                warn!(agent = %attribution.agent_id, error = %e, "Failed to write reward log");
            }
        }

        let mut training_examples = 0;
        if let Some(record) = &record {
            for chunk in &record.chunk_scores {
                let example = ChunkTrainingExample {
                    response_id: response_id.to_string(),
                    query: record.query.clone(),
                    chunk_text: chunk.text.clone(),
                    agent_id: chunk.agent_id.clone(),
                    features: chunk.features,
                    user_feedback: raw,
                    final_quality_score: raw,
                    final_chunk_selected: chunk.selected,
                };
                match self.store.insert_chunk_training_example(&example).await {
                    Ok(()) => training_examples += 1,
                    Err(e) => warn!(error = %e, "Failed to write chunk training example"),
                }
            }
        }

        info!(
            response_id,
            verdict = %verdict,
            agents = attributions.len(),
            training_examples,
            "Feedback recorded"
        );

        Ok(FeedbackReport {
            response_id: response_id.to_string(),
            verdict,
            attributions,
            run_found: record.is_some(),
            training_examples,
        })
    }
}
