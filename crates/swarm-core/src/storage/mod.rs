//! Storage layer - SQLite reward store
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//! - `reward_store`: Agent statistics and interaction history
//! - `runs`: Collaboration run traces and per-response ensemble records
//! - `feedback`: Feedback events, reward log, chunk training examples
//!
//! # Usage
//!
//! ```ignore
//! use swarm_core::storage::{Database, RewardStore};
//!
//! let db = Database::in_memory().await?;
//! let store = RewardStore::new(db.pool().clone());
//! store.upsert_agent_stat("solar", 1.0).await?;
//! ```

pub mod database;
mod feedback;
pub mod migrations;
pub mod records;
pub(crate) mod reward_store;
mod runs;

pub use database::{Database, DatabaseConfig};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};
pub use records::{
    AgentStat, ChunkTrainingExample, CollabMetrics, CollabRunRecord, CollabRunSummary,
    CollabStats, FeedbackEvent, FeedbackStats, InteractionRecord, InteractionV2, NewCollabRun,
    NewInteraction, RewardLogEntry, SelectedChunk, SimilarInteraction, VerdictCounts,
};
pub use reward_store::{DEFAULT_SIMILARITY_WINDOW, RewardStore};
