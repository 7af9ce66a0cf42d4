//! LLM-as-judge evaluation of answers
//!
//! One judge call returns JSON scores for relevance, accuracy, clarity and
//! usefulness. The weighted overall score feeds the bandit as the implicit
//! reward of the answering agent.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EvaluatorConfig;
use crate::llm::{CompletionOptions, EVALUATOR_ID, Message, ModelBackend, truncate_chars};
use crate::routing::AgentSpec;

pub const JUDGE_SYSTEM_PROMPT: &str = "You are an AI evaluator. Score the following response on relevance, accuracy, clarity, and usefulness from 0 to 1. Output JSON only.\n\nReturn format (JSON only): {\"relevance\":0-1,\"accuracy\":0-1,\"clarity\":0-1,\"usefulness\":0-1,\"notes\":\"short\"}";

const QUERY_MAX_CHARS: usize = 4000;
const RESPONSE_MAX_CHARS: usize = 8000;
const NOTES_MAX_CHARS: usize = 500;
const JUDGE_MAX_TOKENS: usize = 220;

pub const NOTES_NO_API_KEY: &str = "no_api_key";
pub const NOTES_EVAL_FAILED: &str = "eval_failed";
pub const NOTES_DISABLED: &str = "disabled";

/// Judge scores, each in [0, 1] or absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeScores {
    pub relevance: Option<f64>,
    pub accuracy: Option<f64>,
    pub clarity: Option<f64>,
    pub usefulness: Option<f64>,
    pub notes: String,
}

impl JudgeScores {
    fn empty(notes: &str) -> Self {
        Self {
            notes: notes.to_string(),
            ..Default::default()
        }
    }

    /// `0.35r + 0.35a + 0.20c + 0.10u`, `None` unless r, a and c are present
    pub fn overall(&self) -> Option<f64> {
        overall_score(self.relevance, self.accuracy, self.clarity, self.usefulness)
    }
}

/// Weighted overall score; usefulness defaults to 0.5
pub fn overall_score(
    relevance: Option<f64>,
    accuracy: Option<f64>,
    clarity: Option<f64>,
    usefulness: Option<f64>,
) -> Option<f64> {
    let r = relevance.and_then(clamp01)?;
    let a = accuracy.and_then(clamp01)?;
    let c = clarity.and_then(clamp01)?;
    let u = usefulness.and_then(clamp01).unwrap_or(0.5);
    Some(0.35 * r + 0.35 * a + 0.20 * c + 0.10 * u)
}

fn clamp01(x: f64) -> Option<f64> {
    x.is_finite().then(|| x.clamp(0.0, 1.0))
}

fn score_value(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64().and_then(clamp01),
        Value::String(s) => s.trim().parse::<f64>().ok().and_then(clamp01),
        _ => None,
    }
}

/// Parse the judge reply: the text from the first `{` to the last `}`
pub fn parse_judge_output(text: &str) -> Option<JudgeScores> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&text[start..=end]).ok()?;
    let object = parsed.as_object()?;

    let notes = object
        .get("notes")
        .and_then(Value::as_str)
        .map(|n| truncate_chars(n, NOTES_MAX_CHARS).to_string())
        .unwrap_or_default();

    Some(JudgeScores {
        relevance: score_value(object.get("relevance")),
        accuracy: score_value(object.get("accuracy")),
        clarity: score_value(object.get("clarity")),
        usefulness: score_value(object.get("usefulness")),
        notes,
    })
}

/// Judge messages for one exchange
pub fn judge_messages(query: &str, response: &str) -> Vec<Message> {
    vec![
        Message::system(JUDGE_SYSTEM_PROMPT),
        Message::user(format!(
            "USER QUERY:\n{}\n\nASSISTANT RESPONSE:\n{}",
            truncate_chars(query, QUERY_MAX_CHARS),
            truncate_chars(response, RESPONSE_MAX_CHARS)
        )),
    ]
}

pub struct Evaluator {
    backend: Arc<dyn ModelBackend>,
    judge: AgentSpec,
    enabled: bool,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("judge", &self.judge.model)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl Evaluator {
    pub fn new(backend: Arc<dyn ModelBackend>, config: &EvaluatorConfig) -> Self {
        Self {
            backend,
            judge: AgentSpec::new(EVALUATOR_ID, config.model.clone()).not_routable(),
            enabled: config.enabled,
        }
    }

    pub fn is_available(&self) -> bool {
        self.enabled && self.backend.is_available(&self.judge)
    }

    /// Score one answer; never fails, failures surface in `notes`
    pub async fn evaluate(&self, query: &str, response: &str) -> JudgeScores {
        if !self.enabled {
            return JudgeScores::empty(NOTES_DISABLED);
        }
        if !self.backend.is_available(&self.judge) {
            return JudgeScores::empty(NOTES_NO_API_KEY);
        }

        let options = CompletionOptions::new(0.0, JUDGE_MAX_TOKENS);
        match self
            .backend
            .complete(&self.judge, judge_messages(query, response), options)
            .await
        {
            Ok(text) => match parse_judge_output(&text) {
                Some(scores) => {
                    debug!(overall = ?scores.overall(), "Judge scored response");
                    scores
                }
                None => {
                    warn!(output = %truncate_chars(text.trim(), 200), "Judge returned invalid output");
                    JudgeScores::empty(NOTES_EVAL_FAILED)
                }
            },
            Err(e) => {
                warn!(error = %e, "Judge call failed");
                JudgeScores::empty(NOTES_EVAL_FAILED)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{FakeBackend, Script};

    fn evaluator(backend: FakeBackend) -> (Evaluator, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        (Evaluator::new(backend.clone(), &Config::default().evaluator), backend)
    }

    #[test]
    fn test_overall_formula() {
        let overall = overall_score(Some(1.0), Some(0.5), Some(0.5), None).unwrap();
        assert!((overall - (0.35 + 0.175 + 0.1 + 0.05)).abs() < 1e-9);
        assert!(overall_score(None, Some(1.0), Some(1.0), Some(1.0)).is_none());
        assert!(overall_score(Some(1.0), Some(1.0), None, Some(1.0)).is_none());
        assert!(overall_score(Some(f64::NAN), Some(1.0), Some(1.0), None).is_none());
    }

    #[test]
    fn test_parse_judge_output() {
        let text = "Sure! ```json\n{\"relevance\": 1.4, \"accuracy\": \"0.8\", \"clarity\": -1, \"usefulness\": \"high\", \"notes\": \"fine\"}\n```";
        let scores = parse_judge_output(text).unwrap();
        assert_eq!(scores.relevance, Some(1.0));
        assert_eq!(scores.accuracy, Some(0.8));
        assert_eq!(scores.clarity, Some(0.0));
        assert_eq!(scores.usefulness, None);
        assert_eq!(scores.notes, "fine");

        assert!(parse_judge_output("no json here").is_none());
        assert!(parse_judge_output("} backwards {").is_none());
    }

    #[test]
    fn test_notes_truncated() {
        let long = "x".repeat(900);
        let scores = parse_judge_output(&format!("{{\"notes\": \"{}\"}}", long)).unwrap();
        assert_eq!(scores.notes.len(), 500);
        assert_eq!(scores.overall(), None);
    }

    #[tokio::test]
    async fn test_evaluate_calls_judge() {
        let (eval, backend) = evaluator(FakeBackend::new().reply(
            EVALUATOR_ID,
            r#"{"relevance":0.9,"accuracy":0.8,"clarity":0.7,"usefulness":0.6,"notes":"ok"}"#,
        ));
        let scores = eval.evaluate("q", &"r".repeat(9000)).await;
        assert_eq!(scores.relevance, Some(0.9));
        assert!(scores.overall().is_some());

        let call = &backend.calls_for(EVALUATOR_ID)[0];
        assert_eq!(call.options.max_tokens, Some(220));
        assert_eq!(call.options.temperature, Some(0.0));
        assert!(call.messages[1].content.len() < 8100);
    }

    #[tokio::test]
    async fn test_evaluate_failure_modes() {
        let (unavailable, _) = evaluator(FakeBackend::new().script(EVALUATOR_ID, Script::Unavailable));
        assert_eq!(unavailable.evaluate("q", "r").await.notes, NOTES_NO_API_KEY);

        let (failing, _) = evaluator(FakeBackend::new().script(EVALUATOR_ID, Script::Fail));
        let scores = failing.evaluate("q", "r").await;
        assert_eq!(scores.notes, NOTES_EVAL_FAILED);
        assert_eq!(scores.overall(), None);

        let (garbage, _) = evaluator(FakeBackend::new().reply(EVALUATOR_ID, "great answer!"));
        assert_eq!(garbage.evaluate("q", "r").await.notes, NOTES_EVAL_FAILED);
    }
}
