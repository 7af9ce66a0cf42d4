//! Response events and their collected form

use std::collections::BTreeMap;

use futures_util::{Stream, StreamExt};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::format::{AnswerFormat, FormatIntent};
use crate::routing::RouteReason;

/// Size of the pieces an ensemble answer is streamed in
pub const CONTENT_PIECE_CHARS: usize = 240;

/// One event of a streamed answer
///
/// Order: `SelectedAgent`, `ResponseId`, `FormatIntent`, `CollabAgents`
/// (ensembles only), any number of `Content`, then exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    SelectedAgent {
        agent_id: String,
        reason: RouteReason,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        scores: BTreeMap<String, f64>,
    },
    ResponseId {
        response_id: String,
    },
    FormatIntent(FormatIntent),
    CollabAgents {
        agent_ids: Vec<String>,
    },
    Content {
        text: String,
    },
    Done {
        response_id: String,
        agent_id: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ResponseEvent {
    pub fn error(e: &Error) -> Self {
        Self::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// A whole answer, as returned by [`Engine::ask`](super::Engine::ask)
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnswerEnvelope {
    pub response_id: String,
    /// Agent credited with the answer; the synthesizer for ensembles
    pub agent_id: String,
    pub reason: Option<RouteReason>,
    pub format: Option<AnswerFormat>,
    /// Ensemble members, empty for single-agent answers
    pub agents: Vec<String>,
    pub content: String,
}

impl AnswerEnvelope {
    pub fn is_ensemble(&self) -> bool {
        !self.agents.is_empty()
    }

    /// Drain `events` into an envelope; a terminal `Error` event becomes `Err`
    pub async fn collect<S>(events: S) -> Result<Self>
    where
        S: Stream<Item = ResponseEvent>,
    {
        let mut envelope = Self::default();
        let mut events = std::pin::pin!(events);

        while let Some(event) = events.next().await {
            match event {
                ResponseEvent::SelectedAgent { agent_id, reason, .. } => {
                    envelope.agent_id = agent_id;
                    envelope.reason = Some(reason);
                }
                ResponseEvent::ResponseId { response_id } => envelope.response_id = response_id,
                ResponseEvent::FormatIntent(intent) => envelope.format = Some(intent.format),
                ResponseEvent::CollabAgents { agent_ids } => envelope.agents = agent_ids,
                ResponseEvent::Content { text } => envelope.content.push_str(&text),
                ResponseEvent::Done { agent_id, .. } => {
                    envelope.agent_id = agent_id;
                    return Ok(envelope);
                }
                ResponseEvent::Error { message, .. } => return Err(Error::Other(message)),
            }
        }

        Err(Error::Other("response stream ended without a terminal event".to_string()))
    }
}

/// Split `text` into pieces of at most `max` characters
pub fn content_pieces(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        current.push(c);
        count += 1;
        if count == max {
            pieces.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
