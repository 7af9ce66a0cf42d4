//! Parallel collaboration across agents
//!
//! An ensemble run asks every selected agent concurrently, measures each
//! answer (factual prior, coherence with the query, novelty against the other
//! answers, bandit weight) and hands the answers to the chunk synthesizer.

mod orchestrator;
mod signals;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::CollabMetrics;
use crate::synthesis::SynthesisOutcome;

pub use orchestrator::{ALL_FAILED_ANSWER, CollabRequest, Orchestrator};
pub use signals::{choose_synthesizer, coherence_score, compute_signals, novelty_scores};

/// Outcome of one agent in an ensemble run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentAnswer {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentAnswer {
    pub fn ok(agent_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            text: Some(text.into()),
            error: None,
        }
    }

    pub fn failed(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            text: None,
            error: Some(error.into()),
        }
    }

    /// Non-empty answer text
    pub fn answer(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Per-agent measurements feeding chunk scoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSignal {
    pub agent_id: String,
    /// Stored mean reward
    pub factual: f64,
    /// Normalized bandit score after the diversity penalty
    pub ucb: f64,
    pub coherence: f64,
    pub novelty: f64,
    pub usage_frequency: f64,
}

/// Everything an ensemble run produced
#[derive(Debug, Clone, Default)]
pub struct CollabOutcome {
    pub agents_used: Vec<String>,
    pub answers: Vec<AgentAnswer>,
    pub synthesizer_id: Option<String>,
    pub final_answer: String,
    pub signals: Vec<AgentSignal>,
    /// Normalized bandit scores over routable agents
    pub ucb_scores: BTreeMap<String, f64>,
    pub synthesis: Option<SynthesisOutcome>,
}

impl CollabOutcome {
    pub fn all_failed(&self) -> bool {
        self.answers.iter().all(|a| a.answer().is_none())
    }

    pub fn answering_agents(&self) -> Vec<String> {
        self.answers
            .iter()
            .filter(|a| a.answer().is_some())
            .map(|a| a.agent_id.clone())
            .collect()
    }

    /// Trace stored with the collaboration run
    pub fn metrics(&self) -> CollabMetrics {
        let synthesis = self.synthesis.as_ref();
        CollabMetrics {
            ucb_scores: self.ucb_scores.clone(),
            agent_signals: self.signals.clone(),
            chunk_scores: synthesis.map(|s| s.chunks.clone()).unwrap_or_default(),
            selected_chunks: synthesis.map(|s| s.selected.clone()).unwrap_or_default(),
            composite_before_coherence: synthesis.map(|s| s.composite.clone()).unwrap_or_default(),
            degraded: synthesis.is_some_and(|s| s.degraded),
        }
    }

    fn signal_map(&self, pick: impl Fn(&AgentSignal) -> f64) -> BTreeMap<String, f64> {
        self.signals
            .iter()
            .map(|s| (s.agent_id.clone(), pick(s)))
            .collect()
    }

    pub fn coherence_scores(&self) -> BTreeMap<String, f64> {
        self.signal_map(|s| s.coherence)
    }

    pub fn novelty_scores(&self) -> BTreeMap<String, f64> {
        self.signal_map(|s| s.novelty)
    }

    /// Bandit weight each answering agent carried into synthesis
    pub fn agent_ucb_scores(&self) -> BTreeMap<String, f64> {
        self.signal_map(|s| s.ucb)
    }
}
