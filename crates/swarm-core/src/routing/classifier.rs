//! One-word LLM classifier used when there is no history to learn from

use tracing::{debug, warn};

use super::types::AgentRegistry;
use crate::llm::{CompletionOptions, Message, ModelBackend, truncate_chars};

/// Query characters sent to the router model
pub const CLASSIFIER_QUERY_CHARS: usize = 2000;

const CLASSIFIER_MAX_TOKENS: usize = 20;
const CLASSIFIER_TEMPERATURE: f32 = 0.1;

/// Build the router prompt listing each routable agent's specialty
pub fn classifier_prompt(registry: &AgentRegistry) -> String {
    let agents: Vec<_> = registry.routable().collect();
    let ids: Vec<&str> = agents.iter().map(|a| a.id.as_str()).collect();
    let rules: Vec<String> = agents
        .iter()
        .map(|a| {
            let specialty = if a.specialty.is_empty() {
                a.description.as_str()
            } else {
                a.specialty.as_str()
            };
            format!("use {} for {}", a.id, specialty)
        })
        .collect();

    let vocabulary = match ids.split_last() {
        Some((last, [])) => last.to_string(),
        Some((last, rest)) => format!("{}, or {}", rest.join(", "), last),
        None => String::new(),
    };

    format!(
        "You are a router. Given the user's message, reply with exactly ONE word: {}.\n\
         Rules: {}. Reply only the word.",
        vocabulary,
        rules.join("; ")
    )
}

/// First routable agent id mentioned in the classifier output
pub fn parse_choice(output: &str, registry: &AgentRegistry) -> Option<String> {
    let lowered = output.to_lowercase();
    registry
        .routable()
        .filter_map(|a| lowered.find(&a.id.to_lowercase()).map(|pos| (pos, &a.id)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, id)| id.clone())
}

/// Ask the router agent to pick one agent, falling back to `fallback`
pub async fn classify(
    backend: &dyn ModelBackend,
    registry: &AgentRegistry,
    query: &str,
    fallback: &str,
) -> String {
    let router = registry.router_agent();
    if !backend.is_available(router) {
        debug!(router = %router.id, "Router agent unavailable, using fallback");
        return fallback.to_string();
    }

    let messages = vec![
        Message::system(classifier_prompt(registry)),
        Message::user(truncate_chars(query, CLASSIFIER_QUERY_CHARS)),
    ];
    let options = CompletionOptions::new(CLASSIFIER_TEMPERATURE, CLASSIFIER_MAX_TOKENS);

    match backend.complete(router, messages, options).await {
        Ok(output) => match parse_choice(&output, registry) {
            Some(choice) => {
                debug!(choice = %choice, "Classifier picked agent");
                choice
            }
            None => {
                warn!(output = %output.trim(), "Classifier output named no agent");
                fallback.to_string()
            }
        },
        Err(e) => {
            warn!(error = %e, "Classifier call failed");
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Script};

    #[test]
    fn test_prompt_lists_vocabulary() {
        let registry = AgentRegistry::with_defaults();
        let prompt = classifier_prompt(&registry);
        assert!(prompt.contains("exactly ONE word: arcee, solar, liquid, qwen, or nemotron."));
        assert!(prompt.contains("use solar for code"));
        assert!(prompt.ends_with("Reply only the word."));
    }

    #[test]
    fn test_parse_choice() {
        let registry = AgentRegistry::with_defaults();
        assert_eq!(parse_choice("  Solar\n", &registry).as_deref(), Some("solar"));
        assert_eq!(
            parse_choice("I'd go with qwen, not arcee", &registry).as_deref(),
            Some("qwen")
        );
        assert_eq!(parse_choice("banana", &registry), None);
    }

    #[tokio::test]
    async fn test_classify_uses_router_output() {
        let registry = AgentRegistry::with_defaults();
        let backend = FakeBackend::new().reply("arcee", "nemotron");
        let pick = classify(&backend, &registry, "who wrote hamlet?", "arcee").await;
        assert_eq!(pick, "nemotron");

        let call = &backend.calls_for("arcee")[0];
        assert_eq!(call.options.max_tokens, Some(20));
        assert_eq!(call.options.temperature, Some(0.1));
    }

    #[tokio::test]
    async fn test_classify_falls_back() {
        let registry = AgentRegistry::with_defaults();

        let garbage = FakeBackend::new().reply("arcee", "I cannot decide");
        assert_eq!(classify(&garbage, &registry, "q", "arcee").await, "arcee");

        let failing = FakeBackend::new().script("arcee", Script::Fail);
        assert_eq!(classify(&failing, &registry, "q", "solar").await, "solar");
    }
}
