//! Database migrations
//!
//! Versioned SQLite schema, applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: agent statistics, interactions, collaboration runs, feedback events
const MIGRATION_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS agent_stats (
        agent_id TEXT PRIMARY KEY NOT NULL,
        pulls INTEGER NOT NULL DEFAULT 0 CHECK (pulls >= 0),
        mean_reward REAL NOT NULL DEFAULT 0.0 CHECK (mean_reward >= 0.0 AND mean_reward <= 1.0),
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS interactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        response_id TEXT UNIQUE,
        user_id TEXT,
        agent_id TEXT NOT NULL,
        query TEXT NOT NULL,
        response TEXT NOT NULL,
        query_embedding BLOB,
        response_embedding BLOB,
        relevance REAL,
        accuracy REAL,
        clarity REAL,
        usefulness REAL,
        overall_score REAL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_interactions_agent_id ON interactions(agent_id);
    CREATE INDEX IF NOT EXISTS idx_interactions_created_at ON interactions(created_at);

    CREATE TABLE IF NOT EXISTS collab_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        response_id TEXT NOT NULL,
        user_id TEXT,
        query TEXT NOT NULL,
        agents_used TEXT NOT NULL,
        leader_agent TEXT NOT NULL,
        router_reason TEXT NOT NULL,
        answers TEXT NOT NULL,
        synthesizer_id TEXT,
        final_answer TEXT NOT NULL,
        metrics TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_collab_runs_response_id ON collab_runs(response_id);

    CREATE TABLE IF NOT EXISTS response_feedback (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        response_id TEXT NOT NULL,
        user_id TEXT,
        agent_ids TEXT NOT NULL,
        verdict TEXT NOT NULL CHECK (verdict IN ('up', 'down')),
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_response_feedback_response_id ON response_feedback(response_id);
"#;

/// Migration 2: ensemble learning (chunk-level scores, reward attribution, training log)
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS interaction_v2 (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        response_id TEXT NOT NULL UNIQUE,
        query TEXT NOT NULL,
        agent_responses TEXT NOT NULL,
        ucb_scores TEXT NOT NULL,
        coherence_scores TEXT NOT NULL,
        novelty_scores TEXT NOT NULL,
        chunk_scores TEXT NOT NULL,
        selected_chunks TEXT NOT NULL,
        final_answer TEXT NOT NULL,
        feedback TEXT CHECK (feedback IS NULL OR feedback IN ('up', 'down')),
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS agent_reward_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        response_id TEXT NOT NULL,
        user_id TEXT,
        agent_id TEXT NOT NULL,
        raw_feedback REAL NOT NULL,
        contribution REAL NOT NULL,
        ucb_weight REAL NOT NULL,
        reward REAL NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_agent_reward_log_agent_id ON agent_reward_log(agent_id);

    CREATE TABLE IF NOT EXISTS chunk_training_examples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        response_id TEXT NOT NULL,
        query TEXT NOT NULL,
        chunk_text TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        features TEXT NOT NULL,
        user_feedback REAL NOT NULL,
        final_quality_score REAL NOT NULL,
        final_chunk_selected INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::debug!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Reward store schema");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Ensemble learning tables");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub target_version: i32,
    pub needs_migration: bool,
}
