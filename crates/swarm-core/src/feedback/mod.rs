//! Learning from user feedback
//!
//! - `attributor`: turns a thumbs up/down on an answer into per-agent rewards,
//!   weighted by how much each agent contributed to the final answer
//! - `reflection`: periodic review of judged interactions that flags agents
//!   scoring far below or above the rest

mod attributor;
mod reflection;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use attributor::{Attribution, FeedbackAttributor, FeedbackReport, attribute};
pub use reflection::{AgentInsight, ReflectionReport, SelfReflection};

/// Explicit user verdict on an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Up,
    Down,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    /// Raw reward: up is 1, down is 0
    pub fn reward(&self) -> f64 {
        match self {
            Self::Up => 1.0,
            Self::Down => 0.0,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verdict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(Error::InvalidInput(format!(
                "unknown verdict '{}', expected up or down",
                other
            ))),
        }
    }
}
