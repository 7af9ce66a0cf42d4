//! UCB v2 bandit scoring for agent selection
//!
//! Every agent (arm) is scored from its stored running-mean reward plus an
//! optimism bonus that shrinks as the agent accumulates pulls.
//!
//! ## Algorithm Overview
//!
//! ```text
//! T           = sum of pulls over all agents
//! exploration = pulls > 0 ? c * alpha * sqrt(ln(T + 1) / pulls) : c * alpha
//! score       = mean + exploration
//!             + beta * novelty
//!             + diversity_bonus * (1 - pulls / (T + 1))
//! ```
//!
//! Agents without statistics use a prior mean of 0.5 and the maximal
//! exploration bonus. The observed bonus is capped at `c * alpha` so an
//! untried agent always ranks at least as high as a tried one with the same
//! mean. Raw scores are unbounded; [`normalize`] rescales a set into [0, 1]
//! before the router compares margins.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::config::BanditParams;
use crate::storage::AgentStat;

/// Prior mean reward for agents without statistics
pub const PRIOR_MEAN: f64 = 0.5;

/// Default ensemble width
pub const DEFAULT_TOP_K: usize = 3;

/// Scores agents with the UCB v2 formula
#[derive(Debug, Clone, Copy, Default)]
pub struct UcbScorer {
    params: BanditParams,
}

impl UcbScorer {
    pub fn new(params: BanditParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> BanditParams {
        self.params
    }

    /// Score one agent given its stat (if any) and the population's total pulls
    pub fn score(&self, stat: Option<&AgentStat>, total_pulls: u64, novelty: f64) -> f64 {
        let BanditParams {
            c,
            alpha,
            beta,
            diversity_bonus,
        } = self.params;

        let pulls = stat.map(|s| s.pulls).unwrap_or(0);
        let mean = stat
            .map(|s| s.mean_reward)
            .filter(|m| m.is_finite())
            .unwrap_or(PRIOR_MEAN)
            .clamp(0.0, 1.0);

        let max_bonus = c * alpha;
        let exploration = if pulls > 0 {
            let bonus = max_bonus * (((total_pulls + 1) as f64).ln() / pulls as f64).sqrt();
            bonus.min(max_bonus)
        } else {
            max_bonus
        };

        let novelty = if novelty.is_finite() { novelty } else { 0.0 };
        let usage = pulls as f64 / (total_pulls + 1) as f64;

        mean + exploration + beta * novelty + diversity_bonus * (1.0 - usage)
    }

    /// Raw scores for `candidates`; missing novelty entries count as 0
    pub fn score_all(
        &self,
        candidates: &[String],
        stats: &HashMap<String, AgentStat>,
        novelty: &HashMap<String, f64>,
    ) -> BTreeMap<String, f64> {
        let total = total_pulls(stats);
        candidates
            .iter()
            .map(|id| {
                let n = novelty.get(id).copied().unwrap_or(0.0);
                (id.clone(), self.score(stats.get(id), total, n))
            })
            .collect()
    }

    /// Min-max normalized scores for `candidates`
    pub fn normalized_scores(
        &self,
        candidates: &[String],
        stats: &HashMap<String, AgentStat>,
    ) -> BTreeMap<String, f64> {
        normalize(&self.score_all(candidates, stats, &HashMap::new()))
    }
}

/// Sum of pulls over every agent with statistics
pub fn total_pulls(stats: &HashMap<String, AgentStat>) -> u64 {
    stats.values().map(|s| s.pulls).sum()
}

/// Share of all pulls taken by one agent: `pulls / (T + 1)`
pub fn usage_frequency(agent_id: &str, stats: &HashMap<String, AgentStat>) -> f64 {
    let pulls = stats.get(agent_id).map(|s| s.pulls).unwrap_or(0);
    pulls as f64 / (total_pulls(stats) + 1) as f64
}

/// Rescale into [0, 1]; an all-equal set maps to 1.0
pub fn normalize(scores: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let finite = scores.values().copied().filter(|v| v.is_finite());
    let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });

    scores
        .iter()
        .map(|(id, &v)| {
            let n = if !v.is_finite() {
                0.0
            } else if max - min <= f64::EPSILON {
                1.0
            } else {
                (v - min) / (max - min)
            };
            (id.clone(), n)
        })
        .collect()
}

/// Candidates ordered by descending score; ties go to the agent with fewer pulls
///
/// The sort is stable, so remaining ties keep candidate order.
pub fn rank(
    candidates: &[String],
    scores: &BTreeMap<String, f64>,
    stats: &HashMap<String, AgentStat>,
) -> Vec<String> {
    let pulls = |id: &str| stats.get(id).map(|s| s.pulls).unwrap_or(0);
    let score = |id: &str| scores.get(id).copied().unwrap_or(0.0);

    let mut ranked: Vec<String> = candidates.to_vec();
    ranked.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| pulls(a).cmp(&pulls(b)))
    });
    ranked
}

/// First `k` of [`rank`]
pub fn top_k(
    candidates: &[String],
    scores: &BTreeMap<String, f64>,
    stats: &HashMap<String, AgentStat>,
    k: usize,
) -> Vec<String> {
    let mut ranked = rank(candidates, scores, stats);
    ranked.truncate(k);
    ranked
}

/// Candidate with the fewest pulls (first in candidate order on ties)
pub fn least_used(candidates: &[String], stats: &HashMap<String, AgentStat>) -> Option<String> {
    candidates
        .iter()
        .min_by_key(|id| stats.get(*id).map(|s| s.pulls).unwrap_or(0))
        .cloned()
}

/// Put the least-used candidate into the last slot of `selected` if it is missing
///
/// Returns true when the selection changed.
pub fn force_exploration(
    selected: &mut Vec<String>,
    candidates: &[String],
    stats: &HashMap<String, AgentStat>,
    k: usize,
) -> bool {
    let Some(explorer) = least_used(candidates, stats) else {
        return false;
    };
    if selected.contains(&explorer) || k == 0 {
        return false;
    }
    selected.truncate(k.saturating_sub(1));
    selected.push(explorer);
    true
}
