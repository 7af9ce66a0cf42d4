//! In-process fakes for the model and embedding capabilities

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::llm::{CompletionOptions, Embedder, Message, ModelBackend};
use crate::routing::AgentSpec;

const DIMS: usize = 32;

/// Bag-of-words hashing embedder: texts sharing words get similar vectors
#[derive(Debug, Default)]
pub struct FakeEmbedder {
    unavailable: bool,
    failing: bool,
    fixed: HashMap<String, Vec<f32>>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.fixed.insert(text.to_string(), vector);
        self
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            let hash = word
                .bytes()
                .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619));
            v[(hash as usize) % DIMS] += 1.0;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn is_available(&self) -> bool {
        !self.unavailable
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.failing {
            return Err(Error::EmbeddingFailed("fake failure".to_string()));
        }
        if let Some(v) = self.fixed.get(text) {
            return Ok(v.clone());
        }
        Ok(Self::vector_for(text))
    }
}

/// Scripted behaviour for one agent
#[derive(Debug, Clone)]
pub enum Script {
    Reply(String),
    Fail,
    Empty,
    Slow(Duration, String),
    Unavailable,
}

/// Recorded call made against the fake backend
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub agent_id: String,
    pub messages: Vec<Message>,
    pub options: CompletionOptions,
}

/// Backend answering from per-agent scripts; unknown agents reply "<id> answer"
#[derive(Debug, Default)]
pub struct FakeBackend {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, agent_id: &str, script: Script) -> Self {
        self.scripts.insert(agent_id.to_string(), script);
        self
    }

    pub fn reply(self, agent_id: &str, text: &str) -> Self {
        self.script(agent_id, Script::Reply(text.to_string()))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, agent_id: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.agent_id == agent_id)
            .collect()
    }
}

#[async_trait]
impl ModelBackend for FakeBackend {
    fn is_available(&self, agent: &AgentSpec) -> bool {
        !matches!(self.scripts.get(&agent.id), Some(Script::Unavailable))
    }

    async fn complete(
        &self,
        agent: &AgentSpec,
        messages: Vec<Message>,
        options: CompletionOptions,
    ) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                agent_id: agent.id.clone(),
                messages,
                options,
            });
        }

        match self.scripts.get(&agent.id) {
            Some(Script::Reply(text)) => Ok(text.clone()),
            Some(Script::Fail) => Err(Error::LLMError(format!("{} failed", agent.id))),
            Some(Script::Empty) => Ok(String::new()),
            Some(Script::Slow(delay, text)) => {
                tokio::time::sleep(*delay).await;
                Ok(text.clone())
            }
            Some(Script::Unavailable) => Err(Error::AgentUnavailable(agent.id.clone())),
            None => Ok(format!("{} answer", agent.id)),
        }
    }
}
