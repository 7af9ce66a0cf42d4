//! Server-Sent Events parsing for streaming chat completions

use serde::Deserialize;

use super::types::FinishReason;

#[derive(Debug, Clone, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<FinishReason>,
}

/// A chunk from a streaming response
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub model: String,
    choices: Vec<StreamChoice>,
}

impl StreamChunk {
    /// Content fragment carried by this chunk, if any
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()?
            .delta
            .content
            .as_deref()
            .filter(|c| !c.is_empty())
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.choices.first()?.finish_reason.as_ref()
    }
}

/// Event from streaming response parsing
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    Done,
    Error(String),
}

/// Parse one SSE line; comments, blank lines and non-data fields yield `None`
pub fn parse_sse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();

    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(StreamEvent::Done);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => Some(StreamEvent::Chunk(chunk)),
        Err(e) => Some(StreamEvent::Error(format!("Failed to parse chunk: {}", e))),
    }
}

/// Split complete lines off the front of `buffer`, leaving any partial line in place
pub fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        lines.push(line);
    }
    lines
}
