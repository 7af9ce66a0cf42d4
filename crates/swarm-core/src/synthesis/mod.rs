//! Chunk-level synthesis of ensemble answers
//!
//! Each agent's answer is cut into atomic chunks (code blocks, tables,
//! sentences), every chunk is scored from its agent's signals and its own
//! relevance to the query, and the best chunks are merged and smoothed by one
//! coherence pass.
//!
//! - `chunker`: markdown-aware splitting
//! - `scorer`: heuristic score plus the optional learned linear model
//! - `synthesizer`: embedding, ranking, merge and coherence pass

mod chunker;
mod scorer;
mod synthesizer;

use serde::{Deserialize, Serialize};

pub use chunker::{Chunk, is_markdown_table, split_chunks, split_sentences};
pub use scorer::{ChunkScorer, LinearChunkModel, blend, heuristic_score, sigmoid};
pub use synthesizer::{
    COHERENCE_SYSTEM_PROMPT, SynthesisInput, SynthesisOutcome, Synthesizer,
};

/// Structural kind of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Code,
    Table,
    Sentence,
    Paragraph,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Table => "table",
            Self::Sentence => "sentence",
            Self::Paragraph => "paragraph",
        }
    }
}

/// Inputs of the chunk quality model
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkFeatures {
    pub agent_ucb: f64,
    pub agent_factual: f64,
    pub agent_coherence: f64,
    pub chunk_relevance: f64,
    pub agent_novelty: f64,
    pub agent_usage_frequency: f64,
}

impl ChunkFeatures {
    /// Feature value by its serialized name
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "agent_ucb" => Some(self.agent_ucb),
            "agent_factual" => Some(self.agent_factual),
            "agent_coherence" => Some(self.agent_coherence),
            "chunk_relevance" => Some(self.chunk_relevance),
            "agent_novelty" => Some(self.agent_novelty),
            "agent_usage_frequency" => Some(self.agent_usage_frequency),
            _ => None,
        }
    }
}

/// One scored chunk of one ensemble run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub agent_id: String,
    /// Index within the agent's answer
    pub chunk_id: usize,
    pub kind: ChunkKind,
    pub text: String,
    pub features: ChunkFeatures,
    pub relevance: f64,
    pub heuristic_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learned_score: Option<f64>,
    pub blended_score: f64,
    pub selected: bool,
    /// Relevance fell back to the neutral value
    #[serde(default)]
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_lookup() {
        let features = ChunkFeatures {
            agent_ucb: 0.1,
            chunk_relevance: 0.7,
            ..Default::default()
        };
        assert_eq!(features.get("agent_ucb"), Some(0.1));
        assert_eq!(features.get("chunk_relevance"), Some(0.7));
        assert_eq!(features.get("length"), None);
    }

    #[test]
    fn test_chunk_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ChunkKind::Table).unwrap(), "\"table\"");
    }
}
