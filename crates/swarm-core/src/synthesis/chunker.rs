//! Markdown-aware answer chunking
//!
//! Precedence: fenced code blocks are atomic, table paragraphs are atomic,
//! other paragraphs split into sentences when they hold more than one.

use super::ChunkKind;

/// A piece of one agent's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Index within the answer
    pub id: usize,
    pub kind: ChunkKind,
    pub text: String,
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

/// Split an answer into chunks
pub fn split_chunks(text: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        if let Some(marker) = fence_marker(line) {
            flush_paragraph(&mut paragraph, &mut chunks);

            let mut block = vec![line];
            for inner in lines.by_ref() {
                block.push(inner);
                if inner.trim_start().starts_with(marker) {
                    break;
                }
            }
            push(&mut chunks, ChunkKind::Code, block.join("\n").trim());
            continue;
        }

        if line.trim().is_empty() {
            flush_paragraph(&mut paragraph, &mut chunks);
        } else {
            paragraph.push(line);
        }
    }
    flush_paragraph(&mut paragraph, &mut chunks);

    chunks
}

fn push(chunks: &mut Vec<Chunk>, kind: ChunkKind, text: &str) {
    if text.is_empty() {
        return;
    }
    chunks.push(Chunk {
        id: chunks.len(),
        kind,
        text: text.to_string(),
    });
}

fn flush_paragraph(lines: &mut Vec<&str>, chunks: &mut Vec<Chunk>) {
    if lines.is_empty() {
        return;
    }
    let joined = lines.join("\n");
    let text = joined.trim();

    if is_markdown_table(lines) {
        push(chunks, ChunkKind::Table, text);
    } else {
        let sentences = split_sentences(text);
        if sentences.len() > 1 {
            for sentence in sentences {
                push(chunks, ChunkKind::Sentence, sentence);
            }
        } else {
            push(chunks, ChunkKind::Paragraph, text);
        }
    }
    lines.clear();
}

/// At least two lines, every line has a pipe, and one line is a header separator
pub fn is_markdown_table(lines: &[&str]) -> bool {
    lines.len() >= 2 && lines.iter().all(|l| l.contains('|')) && lines.iter().any(|l| is_separator_row(l))
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);

    let cells: Vec<&str> = inner.split('|').map(str::trim).collect();
    !cells.is_empty() && cells.iter().all(|cell| is_separator_cell(cell))
}

// :?-+:?
fn is_separator_cell(cell: &str) -> bool {
    let cell = cell.strip_prefix(':').unwrap_or(cell);
    let cell = cell.strip_suffix(':').unwrap_or(cell);
    !cell.is_empty() && cell.chars().all(|c| c == '-')
}

/// Split after `.`, `!` or `?` followed by whitespace
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut after_terminator = false;

    for (i, c) in text.char_indices() {
        if after_terminator && c.is_whitespace() {
            let sentence = text[start..i].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i;
        }
        after_terminator = matches!(c, '.' | '!' | '?');
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}
