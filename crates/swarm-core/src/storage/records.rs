//! Rows persisted by the reward store

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collab::{AgentAnswer, AgentSignal};
use crate::feedback::Verdict;
use crate::synthesis::{ChunkFeatures, ChunkRecord};

/// Running reward statistics for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStat {
    pub agent_id: String,
    pub pulls: u64,
    pub mean_reward: f64,
    pub updated_at: DateTime<Utc>,
}

/// Interaction about to be recorded
#[derive(Debug, Clone, Default)]
pub struct NewInteraction {
    pub response_id: Option<String>,
    pub user_id: Option<String>,
    pub agent_id: String,
    pub query: String,
    pub response: String,
    pub query_embedding: Option<Vec<f32>>,
    pub response_embedding: Option<Vec<f32>>,
    pub relevance: Option<f64>,
    pub accuracy: Option<f64>,
    pub clarity: Option<f64>,
    pub usefulness: Option<f64>,
    pub overall_score: Option<f64>,
}

/// Stored interaction
#[derive(Debug, Clone, Serialize)]
pub struct InteractionRecord {
    pub id: i64,
    pub response_id: Option<String>,
    pub user_id: Option<String>,
    pub agent_id: String,
    pub query: String,
    pub response: String,
    #[serde(skip)]
    pub query_embedding: Option<Vec<f32>>,
    #[serde(skip)]
    pub response_embedding: Option<Vec<f32>>,
    pub relevance: Option<f64>,
    pub accuracy: Option<f64>,
    pub clarity: Option<f64>,
    pub usefulness: Option<f64>,
    pub overall_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Nearest-neighbour hit returned by `similar_by_embedding`
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarInteraction {
    pub interaction_id: i64,
    pub agent_id: String,
    pub similarity: f64,
    pub overall_score: Option<f64>,
}

/// Reference to one chunk that made it into a synthesized answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedChunk {
    pub agent_id: String,
    pub chunk_id: usize,
}

/// Scores and traces computed during an ensemble run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollabMetrics {
    pub ucb_scores: BTreeMap<String, f64>,
    pub agent_signals: Vec<AgentSignal>,
    pub chunk_scores: Vec<ChunkRecord>,
    pub selected_chunks: Vec<SelectedChunk>,
    pub composite_before_coherence: String,
    #[serde(default)]
    pub degraded: bool,
}

/// Collaboration run about to be recorded
#[derive(Debug, Clone)]
pub struct NewCollabRun {
    pub response_id: String,
    pub user_id: Option<String>,
    pub query: String,
    pub agents_used: Vec<String>,
    pub leader_agent: String,
    pub router_reason: String,
    pub answers: Vec<AgentAnswer>,
    pub synthesizer_id: Option<String>,
    pub final_answer: String,
    pub metrics: CollabMetrics,
}

/// Stored collaboration run
#[derive(Debug, Clone, Serialize)]
pub struct CollabRunRecord {
    pub id: i64,
    pub response_id: String,
    pub user_id: Option<String>,
    pub query: String,
    pub agents_used: Vec<String>,
    pub leader_agent: String,
    pub router_reason: String,
    pub answers: Vec<AgentAnswer>,
    pub synthesizer_id: Option<String>,
    pub final_answer: String,
    pub metrics: CollabMetrics,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollabRunSummary {
    pub id: i64,
    pub response_id: String,
    pub query: String,
    pub agents_used: Vec<String>,
    pub leader_agent: String,
    pub router_reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollabStats {
    pub total_runs: u64,
    /// How often each agent took part in a run
    pub participation: BTreeMap<String, u64>,
    /// How often each agent synthesized the final answer
    pub leader_counts: BTreeMap<String, u64>,
}

/// Per-response ensemble trace that later receives user feedback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionV2 {
    pub response_id: String,
    pub query: String,
    pub agent_responses: Vec<AgentAnswer>,
    pub ucb_scores: BTreeMap<String, f64>,
    pub coherence_scores: BTreeMap<String, f64>,
    pub novelty_scores: BTreeMap<String, f64>,
    pub chunk_scores: Vec<ChunkRecord>,
    pub selected_chunks: Vec<SelectedChunk>,
    pub final_answer: String,
    pub feedback: Option<Verdict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackEvent {
    pub id: i64,
    pub response_id: String,
    pub user_id: Option<String>,
    pub agent_ids: Vec<String>,
    pub verdict: Verdict,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
    pub up: u64,
    pub down: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedbackStats {
    pub total: VerdictCounts,
    pub per_agent: BTreeMap<String, VerdictCounts>,
}

/// One attributed reward
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardLogEntry {
    pub response_id: String,
    pub user_id: Option<String>,
    pub agent_id: String,
    pub raw_feedback: f64,
    pub contribution: f64,
    pub ucb_weight: f64,
    pub reward: f64,
    pub created_at: DateTime<Utc>,
}

/// Labelled chunk used to fit the learned chunk scorer offline
#[derive(Debug, Clone, Serialize)]
pub struct ChunkTrainingExample {
    pub response_id: String,
    pub query: String,
    pub chunk_text: String,
    pub agent_id: String,
    pub features: ChunkFeatures,
    pub user_feedback: f64,
    pub final_quality_score: f64,
    pub final_chunk_selected: bool,
}
