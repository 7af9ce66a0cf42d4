//! Periodic self-reflection over judged interactions

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LearningConfig;
use crate::error::Result;
use crate::llm::truncate_chars;
use crate::storage::{InteractionRecord, RewardStore};

const MIN_ROWS: usize = 10;
const MIN_IMPROVEMENT_SAMPLES: usize = 20;
const UNDERPERFORM_BELOW: f64 = 0.55;
const OVERPERFORM_ABOVE: f64 = 0.8;
const FAILURE_BELOW: f64 = 0.5;
const MAX_FAILURE_EXAMPLES: usize = 3;
const EXAMPLE_RESPONSE_CHARS: usize = 300;

/// Judge-score summary for one agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentInsight {
    pub agent_id: String,
    /// Interactions in the window
    pub rows: usize,
    /// Interactions with an overall score
    pub samples: usize,
    pub mean: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReflectionReport {
    pub window: usize,
    pub insights: Vec<AgentInsight>,
    pub underperformers: Vec<String>,
    pub overperformers: Vec<String>,
    pub worst_agent: Option<String>,
    pub improvement_prompt: Option<String>,
}

/// Reviews the last `window` interactions every `interval` recorded ones
#[derive(Debug, Clone)]
pub struct SelfReflection {
    store: Arc<RewardStore>,
    interval: u64,
    window: usize,
}

impl SelfReflection {
    pub fn new(store: Arc<RewardStore>, config: &LearningConfig) -> Self {
        Self {
            store,
            interval: config.reflection_interval,
            window: config.reflection_window,
        }
    }

    /// True when interaction number `sequence` should trigger a reflection
    pub fn is_due(&self, sequence: i64) -> bool {
        self.interval > 0 && sequence > 0 && sequence as u64 % self.interval == 0
    }

    pub async fn reflect(&self) -> Result<ReflectionReport> {
        let rows = self.store.recent_interactions(self.window).await?;
        let report = analyze(&rows, self.window);

        for insight in &report.insights {
            if report.underperformers.contains(&insight.agent_id) {
                warn!(
                    agent = %insight.agent_id,
                    mean = insight.mean,
                    samples = insight.samples,
                    "Agent underperforming"
                );
            } else if report.overperformers.contains(&insight.agent_id) {
                info!(
                    agent = %insight.agent_id,
                    mean = insight.mean,
                    samples = insight.samples,
                    "Agent overperforming"
                );
            }
        }
        if let Some(prompt) = &report.improvement_prompt {
            debug!(prompt = %prompt, "Improvement prompt");
        }

        Ok(report)
    }
}

/// Aggregate judge scores per agent and flag outliers
pub fn analyze(rows: &[InteractionRecord], window: usize) -> ReflectionReport {
    let mut by_agent: BTreeMap<&str, Vec<&InteractionRecord>> = BTreeMap::new();
    for row in rows {
        by_agent.entry(row.agent_id.as_str()).or_default().push(row);
    }

    let mut report = ReflectionReport {
        window,
        ..Default::default()
    };

    for (agent_id, agent_rows) in &by_agent {
        if agent_rows.len() < MIN_ROWS {
            continue;
        }
        let scores: Vec<f64> = agent_rows
            .iter()
            .filter_map(|r| r.overall_score)
            .filter(|s| s.is_finite())
            .collect();
        if scores.is_empty() {
            continue;
        }
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        if mean < UNDERPERFORM_BELOW {
            report.underperformers.push(agent_id.to_string());
        } else if mean > OVERPERFORM_ABOVE {
            report.overperformers.push(agent_id.to_string());
        }
        report.insights.push(AgentInsight {
            agent_id: agent_id.to_string(),
            rows: agent_rows.len(),
            samples: scores.len(),
            mean,
        });
    }

    let worst = report
        .insights
        .iter()
        .filter(|i| i.samples >= MIN_IMPROVEMENT_SAMPLES)
        .filter(|i| report.underperformers.contains(&i.agent_id))
        .min_by(|a, b| a.mean.total_cmp(&b.mean));
    if let Some(worst) = worst {
        report.worst_agent = Some(worst.agent_id.clone());
        report.improvement_prompt = improvement_prompt(&worst.agent_id, &by_agent[worst.agent_id.as_str()]);
    }

    report
}

fn improvement_prompt(agent_id: &str, rows: &[&InteractionRecord]) -> Option<String> {
    let failures: Vec<String> = rows
        .iter()
        .filter(|r| r.overall_score.is_some_and(|s| s < FAILURE_BELOW))
        .take(MAX_FAILURE_EXAMPLES)
        .map(|r| {
            format!(
                "Q: {}\nA: {}",
                r.query,
                truncate_chars(&r.response, EXAMPLE_RESPONSE_CHARS)
            )
        })
        .collect();
    if failures.is_empty() {
        return None;
    }
    Some(format!(
        "Improve {} responses based on these failures:\n{}",
        agent_id,
        failures.join("\n\n")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::NewInteraction;
    use crate::storage::reward_store::tests::create_test_store;

    async fn seed(store: &RewardStore, agent: &str, scores: &[Option<f64>]) {
        for (i, score) in scores.iter().enumerate() {
            store
                .insert_interaction(&NewInteraction {
                    agent_id: agent.to_string(),
                    query: format!("{} question {}", agent, i),
                    response: "r".repeat(400),
                    overall_score: *score,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_is_due() {
        let store = Arc::new(create_test_store().await);
        let reflection = SelfReflection::new(store, &Config::default().learning);
        assert!(reflection.is_due(100));
        assert!(reflection.is_due(300));
        assert!(!reflection.is_due(0));
        assert!(!reflection.is_due(150));
    }

    #[tokio::test]
    async fn test_flags_under_and_overperformers() {
        let store = Arc::new(create_test_store().await);
        seed(&store, "solar", &[Some(0.3); 25]).await;
        seed(&store, "qwen", &[Some(0.9); 12]).await;
        seed(&store, "liquid", &[Some(0.1); 5]).await;

        let reflection = SelfReflection::new(store, &Config::default().learning);
        let report = reflection.reflect().await.unwrap();

        assert_eq!(report.underperformers, vec!["solar"]);
        assert_eq!(report.overperformers, vec!["qwen"]);
        assert!(report.insights.iter().all(|i| i.agent_id != "liquid"));
        assert_eq!(report.worst_agent.as_deref(), Some("solar"));

        let prompt = report.improvement_prompt.unwrap();
        assert!(prompt.starts_with("Improve solar responses based on these failures:\nQ: "));
        assert_eq!(prompt.matches("Q: ").count(), 3);
        assert!(!prompt.contains(&"r".repeat(301)));
    }

    #[tokio::test]
    async fn test_no_prompt_below_sample_floor() {
        let store = Arc::new(create_test_store().await);
        seed(&store, "solar", &[Some(0.2); 15]).await;

        let report = SelfReflection::new(store, &Config::default().learning)
            .reflect()
            .await
            .unwrap();
        assert_eq!(report.underperformers, vec!["solar"]);
        assert!(report.worst_agent.is_none());
        assert!(report.improvement_prompt.is_none());
    }

    #[tokio::test]
    async fn test_strong_agent_with_failures_is_not_worst() {
        let store = Arc::new(create_test_store().await);
        let mut scores = vec![Some(0.95); 23];
        scores.extend([Some(0.2), Some(0.2)]);
        seed(&store, "qwen", &scores).await;

        let report = SelfReflection::new(store, &Config::default().learning)
            .reflect()
            .await
            .unwrap();
        assert_eq!(report.overperformers, vec!["qwen"]);
        assert!(report.underperformers.is_empty());
        assert!(report.worst_agent.is_none());
        assert!(report.improvement_prompt.is_none());
    }

    #[test]
    fn test_unscored_rows_count_toward_floor_only() {
        let now = chrono::Utc::now();
        let rows: Vec<InteractionRecord> = (0..10)
            .map(|i| InteractionRecord {
                id: i,
                response_id: None,
                user_id: None,
                agent_id: "arcee".to_string(),
                query: "q".to_string(),
                response: "a".to_string(),
                query_embedding: None,
                response_embedding: None,
                relevance: None,
                accuracy: None,
                clarity: None,
                usefulness: None,
                overall_score: (i < 2).then_some(0.9),
                created_at: now,
            })
            .collect();
        let report = analyze(&rows, 500);
        assert_eq!(report.insights[0].rows, 10);
        assert_eq!(report.insights[0].samples, 2);
        assert_eq!(report.overperformers, vec!["arcee"]);
    }
}
