//! Answer format detection
//!
//! Looks for keywords in the query that ask for a specific layout (code,
//! table, chart, steps, list) and turns the winner into an instruction that
//! is appended to every agent's system prompt.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Layout the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerFormat {
    Code,
    Table,
    Chart,
    Steps,
    List,
    Paragraph,
}

impl AnswerFormat {
    /// Detection priority, highest first
    pub const PRIORITY: [AnswerFormat; 6] = [
        Self::Code,
        Self::Table,
        Self::Chart,
        Self::Steps,
        Self::List,
        Self::Paragraph,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Table => "table",
            Self::Chart => "chart",
            Self::Steps => "steps",
            Self::List => "list",
            Self::Paragraph => "paragraph",
        }
    }

    /// Instruction forwarded to agents; empty for plain paragraphs
    pub fn constraint(&self) -> &'static str {
        match self {
            Self::Code => {
                "User requested format: CODE. You MUST output only code in a single fenced code block. Do not include explanations."
            }
            Self::Table => {
                "User requested format: TABLE. You MUST output a Markdown table. Do not use paragraphs."
            }
            Self::Chart => {
                "User requested format: CHART. You MUST output a JSON dataset (labels + series) followed by a concise explanation. Do not output tables unless asked."
            }
            Self::Steps => {
                "User requested format: STEPS. You MUST output numbered steps. Do not use tables."
            }
            Self::List => {
                "User requested format: LIST. You MUST output bullet points only. Do not use tables."
            }
            Self::Paragraph => "",
        }
    }
}

impl std::fmt::Display for AnswerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnswerFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidInput(format!("unknown format '{}'", s)))
    }
}

/// Detected format with its confidence and the keywords that matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatIntent {
    pub format: AnswerFormat,
    pub confidence: f64,
    pub matched_keywords: Vec<String>,
}

impl FormatIntent {
    pub fn constraint(&self) -> &'static str {
        self.format.constraint()
    }
}

/// Keyword-driven format detector
#[derive(Debug, Clone)]
pub struct FormatDetector {
    keywords: BTreeMap<AnswerFormat, Vec<String>>,
}

impl Default for FormatDetector {
    fn default() -> Self {
        let table = |words: &[&str]| words.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        let keywords = BTreeMap::from([
            (
                AnswerFormat::Code,
                table(&["code", "snippet", "script", "function", "implement", "program"]),
            ),
            (
                AnswerFormat::Table,
                table(&["table", "tabular", "columns", "side by side", "differentiate"]),
            ),
            (
                AnswerFormat::Chart,
                table(&["chart", "graph", "plot", "visualize", "visualise"]),
            ),
            (
                AnswerFormat::Steps,
                table(&["steps", "step by step", "step-by-step", "procedure", "walk me through"]),
            ),
            (
                AnswerFormat::List,
                table(&["list", "bullet", "bullets", "pros and cons", "enumerate"]),
            ),
        ]);
        Self { keywords }
    }
}

impl FormatDetector {
    pub fn with_keywords(keywords: BTreeMap<AnswerFormat, Vec<String>>) -> Self {
        Self { keywords }
    }

    /// Keywords from a JSON file `{"code": [...], "table": [...]}`, built-ins when missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let keywords: BTreeMap<AnswerFormat, Vec<String>> = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), formats = keywords.len(), "Loaded format keywords");
        Ok(Self { keywords })
    }

    pub fn detect(&self, text: &str) -> FormatIntent {
        let lowered = text.trim().to_lowercase();

        for format in AnswerFormat::PRIORITY {
            let Some(words) = self.keywords.get(&format) else {
                continue;
            };
            let matched: Vec<String> = words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty() && lowered.contains(w.as_str()))
                .collect();
            if !matched.is_empty() {
                let confidence = 0.7 + (0.05 * matched.len() as f64).min(0.25);
                return FormatIntent {
                    format,
                    confidence,
                    matched_keywords: matched,
                };
            }
        }

        if lowered.contains("```") || lowered.contains("code") {
            return FormatIntent {
                format: AnswerFormat::Code,
                confidence: 0.6,
                matched_keywords: vec!["```".to_string()],
            };
        }
        if lowered.contains("table") && lowered.contains('|') {
            return FormatIntent {
                format: AnswerFormat::Table,
                confidence: 0.55,
                matched_keywords: vec!["|".to_string()],
            };
        }

        FormatIntent {
            format: AnswerFormat::Paragraph,
            confidence: 0.3,
            matched_keywords: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_requested_formats() {
        let detector = FormatDetector::default();
        let cases = [
            ("Differentiate flora and fauna in table", AnswerFormat::Table),
            ("Explain photosynthesis in steps", AnswerFormat::Steps),
            ("Show population growth chart", AnswerFormat::Chart),
            ("Give Python code example", AnswerFormat::Code),
            ("List advantages and disadvantages", AnswerFormat::List),
            ("Why is the sky blue?", AnswerFormat::Paragraph),
        ];
        for (query, expected) in cases {
            assert_eq!(detector.detect(query).format, expected, "{query}");
        }
    }

    #[test]
    fn test_priority_and_confidence() {
        let detector = FormatDetector::default();
        let intent = detector.detect("write a script, then list the steps in a table");
        assert_eq!(intent.format, AnswerFormat::Code);
        assert!((intent.confidence - 0.75).abs() < 1e-9);

        let paragraph = detector.detect("hello");
        assert_eq!(paragraph.confidence, 0.3);
        assert!(paragraph.constraint().is_empty());
    }

    #[test]
    fn test_fallback_rules() {
        let empty = FormatDetector::with_keywords(BTreeMap::new());
        let code = empty.detect("fix this ```let x = 1;```");
        assert_eq!(code.format, AnswerFormat::Code);
        assert_eq!(code.confidence, 0.6);

        let table = empty.detect("turn a | b into a table");
        assert_eq!(table.format, AnswerFormat::Table);
        assert_eq!(table.confidence, 0.55);
    }

    #[test]
    fn test_confidence_caps() {
        let detector = FormatDetector::with_keywords(BTreeMap::from([(
            AnswerFormat::List,
            ["a", "b", "c", "d", "e", "f", "g"].iter().map(|s| s.to_string()).collect(),
        )]));
        let intent = detector.detect("a b c d e f g");
        assert!((intent.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_load_keywords_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("format_keywords.json");
        assert_eq!(
            FormatDetector::load(&path).unwrap().detect("plot it").format,
            AnswerFormat::Chart
        );

        std::fs::write(&path, r#"{"steps": ["recipe"]}"#).unwrap();
        let detector = FormatDetector::load(&path).unwrap();
        assert_eq!(detector.detect("a recipe for bread").format, AnswerFormat::Steps);
        assert_eq!(detector.detect("plot it").format, AnswerFormat::Paragraph);
    }

    #[test]
    fn test_constraint_text() {
        assert!(AnswerFormat::Table.constraint().starts_with("User requested format: TABLE."));
        assert_eq!("STEPS".parse::<AnswerFormat>().unwrap(), AnswerFormat::Steps);
    }
}
