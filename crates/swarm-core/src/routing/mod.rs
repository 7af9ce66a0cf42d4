//! Adaptive agent routing
//!
//! This module decides which agent (or ensemble of agents) answers a query,
//! learning from stored rewards instead of fixed rules.
//!
//! # Components
//!
//! - **Agent registry**: ordered agents with a default and a router agent
//! - **UCB v2 bandit**: optimism-under-uncertainty scores from running-mean rewards
//! - **Similarity matcher**: votes from past queries with close embeddings
//! - **Classifier**: one-word router-model call used before any statistics exist
//! - **Router**: combines the above and picks single vs. ensemble
//!
//! # Usage
//!
//! ```rust,ignore
//! use swarm_core::routing::{Router, RouteTarget};
//!
//! let decision = router.route("/swarm compare tokio and async-std", false).await?;
//! match decision.target {
//!     RouteTarget::Single { agent_id } => println!("ask {agent_id}"),
//!     RouteTarget::Ensemble { agent_ids } => println!("ensemble of {agent_ids:?}"),
//! }
//! println!("reason: {}", decision.reason);
//! ```

pub mod bandit;
pub mod classifier;
mod router;
pub mod similarity;
mod types;

pub use bandit::{UcbScorer, normalize};
pub use router::{Router, RouterConfig, SWARM_COMMAND, strip_swarm_command};
pub use similarity::{SimilarityMatch, SimilarityMatcher};
pub use types::{
    AgentRegistry, AgentSpec, DEFAULT_SYSTEM_PROMPT, RouteDecision, RouteReason, RouteTarget,
    default_agents,
};
