//! Chunk quality scoring
//!
//! The heuristic score multiplies the agent signals with the chunk's own
//! relevance and adds a novelty bonus. When a trained linear model is present
//! on disk its sigmoid output is blended in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ChunkFeatures;
use crate::error::Result;

/// Logistic model over [`ChunkFeatures`], stored as `{"weights": {...}, "bias": b}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearChunkModel {
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub bias: f64,
}

impl LinearChunkModel {
    /// Probability in [0, 1]; unknown feature names contribute nothing
    pub fn predict(&self, features: &ChunkFeatures) -> f64 {
        let bias = if self.bias.is_finite() { self.bias } else { 0.0 };
        let z = self.weights.iter().fold(bias, |z, (name, w)| {
            let w = if w.is_finite() { *w } else { 0.0 };
            let x = features.get(name).filter(|x| x.is_finite()).unwrap_or(0.0);
            z + w * x
        });
        sigmoid(z).clamp(0.0, 1.0)
    }
}

/// Numerically stable logistic function
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// `ucb * factual * coherence * relevance + novelty_weight * novelty`
pub fn heuristic_score(features: &ChunkFeatures, novelty_weight: f64) -> f64 {
    features.agent_ucb * features.agent_factual * features.agent_coherence * features.chunk_relevance
        + novelty_weight * features.agent_novelty
}

/// Weighted mix of heuristic and learned scores; heuristic alone without a model
pub fn blend(heuristic: f64, learned: Option<f64>, heuristic_weight: f64, learned_weight: f64) -> f64 {
    match learned {
        Some(learned) => heuristic_weight * heuristic + learned_weight * learned,
        None => heuristic,
    }
}

/// Learned chunk model loaded from disk with explicit reload
#[derive(Debug)]
pub struct ChunkScorer {
    path: Option<PathBuf>,
    model: RwLock<Option<LinearChunkModel>>,
}

impl ChunkScorer {
    /// Load the model at `path`; a missing file means no learned score
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let model = read_model(&path)?;
        Ok(Self {
            path: Some(path),
            model: RwLock::new(model),
        })
    }

    /// Scorer with a fixed model (or none) and no backing file
    pub fn fixed(model: Option<LinearChunkModel>) -> Self {
        Self {
            path: None,
            model: RwLock::new(model),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn has_model(&self) -> bool {
        self.snapshot().is_some()
    }

    fn snapshot(&self) -> Option<LinearChunkModel> {
        match self.model.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-read the weights file; returns whether a model is now loaded
    pub fn reload(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(self.has_model());
        };
        let model = read_model(path)?;
        let loaded = model.is_some();
        match self.model.write() {
            Ok(mut guard) => *guard = model,
            Err(poisoned) => *poisoned.into_inner() = model,
        }
        info!(path = %path.display(), loaded, "Reloaded chunk model");
        Ok(loaded)
    }

    /// Learned score, `None` without a model
    pub fn learned(&self, features: &ChunkFeatures) -> Option<f64> {
        self.snapshot().map(|m| m.predict(features))
    }
}

fn read_model(path: &Path) -> Result<Option<LinearChunkModel>> {
    if !path.exists() {
        debug!(path = %path.display(), "No chunk model on disk");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    match serde_json::from_str::<LinearChunkModel>(&raw) {
        Ok(model) => Ok(Some(model)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed chunk model");
            Ok(None)
        }
    }
}
