//! Reward store: agent statistics and the interaction history
//!
//! Collaboration runs, feedback events, the reward log and chunk training
//! examples are implemented on the same store in `runs.rs` and `feedback.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::records::{AgentStat, InteractionRecord, NewInteraction, SimilarInteraction};
use crate::embedding::{cosine_similarity, decode_embedding, encode_embedding};
use crate::error::{Error, Result};

/// Number of most recent embedded interactions scanned for similarity
pub const DEFAULT_SIMILARITY_WINDOW: usize = 5000;

const INTERACTION_COLUMNS: &str = "id, response_id, user_id, agent_id, query, response, \
     query_embedding, response_embedding, relevance, accuracy, clarity, usefulness, \
     overall_score, created_at";

/// SQLite-backed store of everything the engine learns from
pub struct RewardStore {
    pool: SqlitePool,
    agent_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    similarity_window: usize,
}

impl std::fmt::Debug for RewardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardStore")
            .field("similarity_window", &self.similarity_window)
            .finish()
    }
}

impl RewardStore {
    /// Wrap a pool whose schema has already been migrated
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            agent_locks: StdMutex::new(HashMap::new()),
            similarity_window: DEFAULT_SIMILARITY_WINDOW,
        }
    }

    pub fn with_similarity_window(mut self, window: usize) -> Self {
        self.similarity_window = window.max(1);
        self
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.agent_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// All agent statistics ordered by agent id
    pub async fn agent_stats(&self) -> Result<Vec<AgentStat>> {
        let rows = sqlx::query(
            "SELECT agent_id, pulls, mean_reward, updated_at FROM agent_stats ORDER BY agent_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows.iter().map(row_to_stat).collect())
    }

    /// Statistics keyed by agent id
    pub async fn agent_stats_map(&self) -> Result<HashMap<String, AgentStat>> {
        Ok(self
            .agent_stats()
            .await?
            .into_iter()
            .map(|s| (s.agent_id.clone(), s))
            .collect())
    }

    pub async fn agent_stat(&self, agent_id: &str) -> Result<Option<AgentStat>> {
        let row = sqlx::query(
            "SELECT agent_id, pulls, mean_reward, updated_at FROM agent_stats WHERE agent_id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(row.as_ref().map(row_to_stat))
    }

    /// Fold one reward into the agent's running mean
    ///
    /// The reward is clamped to [0, 1]. Updates for the same agent are
    /// serialized; different agents proceed concurrently.
    pub async fn upsert_agent_stat(&self, agent_id: &str, reward: f64) -> Result<AgentStat> {
        if !reward.is_finite() {
            return Err(Error::InvalidInput(format!(
                "reward for '{}' is not finite",
                agent_id
            )));
        }
        let reward = reward.clamp(0.0, 1.0);

        let lock = self.agent_lock(agent_id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        let current: Option<(i64, f64)> =
            sqlx::query_as("SELECT pulls, mean_reward FROM agent_stats WHERE agent_id = ?")
                .bind(agent_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::DatabaseError)?;

        let (pulls, mean) = current.unwrap_or((0, 0.0));
        let new_pulls = pulls + 1;
        let new_mean = (mean + (reward - mean) / new_pulls as f64).clamp(0.0, 1.0);
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO agent_stats (agent_id, pulls, mean_reward, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(agent_id) DO UPDATE SET
                pulls = excluded.pulls,
                mean_reward = excluded.mean_reward,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(agent_id)
        .bind(new_pulls)
        .bind(new_mean)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::DatabaseError)?;

        tx.commit().await.map_err(Error::DatabaseError)?;

        debug!(
            agent_id = %agent_id,
            reward = reward,
            pulls = new_pulls,
            mean_reward = new_mean,
            "Updated agent statistics"
        );

        Ok(AgentStat {
            agent_id: agent_id.to_string(),
            pulls: new_pulls as u64,
            mean_reward: new_mean,
            updated_at: now,
        })
    }

    /// Append an interaction; returns its sequence id, or `None` when the response id was already recorded
    pub async fn insert_interaction(&self, interaction: &NewInteraction) -> Result<Option<i64>> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO interactions (
                response_id, user_id, agent_id, query, response,
                query_embedding, response_embedding,
                relevance, accuracy, clarity, usefulness, overall_score, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&interaction.response_id)
        .bind(&interaction.user_id)
        .bind(&interaction.agent_id)
        .bind(&interaction.query)
        .bind(&interaction.response)
        .bind(interaction.query_embedding.as_deref().map(encode_embedding))
        .bind(interaction.response_embedding.as_deref().map(encode_embedding))
        .bind(interaction.relevance)
        .bind(interaction.accuracy)
        .bind(interaction.clarity)
        .bind(interaction.usefulness)
        .bind(interaction.overall_score)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            debug!(response_id = ?interaction.response_id, "Interaction already recorded");
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    /// Most recent interactions, newest first
    pub async fn recent_interactions(&self, limit: usize) -> Result<Vec<InteractionRecord>> {
        let sql = format!(
            "SELECT {} FROM interactions ORDER BY id DESC LIMIT ?",
            INTERACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(rows.iter().map(row_to_interaction).collect())
    }

    pub async fn interaction_by_response(
        &self,
        response_id: &str,
    ) -> Result<Option<InteractionRecord>> {
        let sql = format!(
            "SELECT {} FROM interactions WHERE response_id = ?",
            INTERACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(response_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(row.as_ref().map(row_to_interaction))
    }

    /// Top-`k` past interactions by cosine similarity of their query embedding
    ///
    /// Only the most recent `similarity_window` embedded interactions are scanned.
    pub async fn similar_by_embedding(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<SimilarInteraction>> {
        if embedding.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, agent_id, query_embedding, overall_score
            FROM interactions
            WHERE query_embedding IS NOT NULL
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(self.similarity_window as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let mut hits: Vec<SimilarInteraction> = rows
            .iter()
            .filter_map(|row| {
                let bytes: Vec<u8> = row.get("query_embedding");
                let vector = decode_embedding(&bytes)?;
                Some(SimilarInteraction {
                    interaction_id: row.get("id"),
                    agent_id: row.get("agent_id"),
                    similarity: cosine_similarity(embedding, &vector),
                    overall_score: row.get("overall_score"),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);
        Ok(hits)
    }

    pub async fn interaction_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM interactions")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(count as u64)
    }

    /// Delete the oldest interactions once the table exceeds `max_rows`
    ///
    /// Removes enough rows to land `headroom` below the cap. Returns the number deleted.
    pub async fn prune_interactions(&self, max_rows: u64, headroom: u64) -> Result<u64> {
        let count = self.interaction_count().await?;
        if count <= max_rows {
            return Ok(0);
        }

        let to_delete = (count - max_rows + headroom).min(count);
        let result = sqlx::query(
            "DELETE FROM interactions WHERE id IN (SELECT id FROM interactions ORDER BY id ASC LIMIT ?)",
        )
        .bind(to_delete as i64)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        info!(
            deleted = result.rows_affected(),
            remaining = count - result.rows_affected(),
            "Pruned interaction history"
        );
        Ok(result.rows_affected())
    }
}

fn row_to_stat(row: &SqliteRow) -> AgentStat {
    AgentStat {
        agent_id: row.get("agent_id"),
        pulls: row.get::<i64, _>("pulls").max(0) as u64,
        mean_reward: row.get("mean_reward"),
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .unwrap_or_else(|_| Utc::now()),
    }
}

fn row_to_interaction(row: &SqliteRow) -> InteractionRecord {
    let blob = |name: &str| {
        row.get::<Option<Vec<u8>>, _>(name)
            .and_then(|b| decode_embedding(&b))
    };
    InteractionRecord {
        id: row.get("id"),
        response_id: row.get("response_id"),
        user_id: row.get("user_id"),
        agent_id: row.get("agent_id"),
        query: row.get("query"),
        response: row.get("response"),
        query_embedding: blob("query_embedding"),
        response_embedding: blob("response_embedding"),
        relevance: row.get("relevance"),
        accuracy: row.get("accuracy"),
        clarity: row.get("clarity"),
        usefulness: row.get("usefulness"),
        overall_score: row.get("overall_score"),
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .unwrap_or_else(|_| Utc::now()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::Database;

    pub(crate) async fn create_test_store() -> RewardStore {
        let db = Database::in_memory().await.unwrap();
        RewardStore::new(db.pool().clone())
    }

    fn interaction(agent: &str, response_id: Option<&str>, emb: Option<Vec<f32>>) -> NewInteraction {
        NewInteraction {
            response_id: response_id.map(String::from),
            agent_id: agent.to_string(),
            query: "what is rust".to_string(),
            response: "a language".to_string(),
            query_embedding: emb,
            overall_score: Some(0.8),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_running_mean() {
        let store = create_test_store().await;

        let s1 = store.upsert_agent_stat("solar", 1.0).await.unwrap();
        assert_eq!(s1.pulls, 1);
        assert!((s1.mean_reward - 1.0).abs() < 1e-9);

        let s2 = store.upsert_agent_stat("solar", 0.0).await.unwrap();
        assert_eq!(s2.pulls, 2);
        assert!((s2.mean_reward - 0.5).abs() < 1e-9);

        let s3 = store.upsert_agent_stat("solar", 5.0).await.unwrap();
        assert_eq!(s3.pulls, 3);
        assert!((s3.mean_reward - 2.0 / 3.0).abs() < 1e-9);

        let loaded = store.agent_stat("solar").await.unwrap().unwrap();
        assert_eq!(loaded.pulls, 3);
    }

    #[tokio::test]
    async fn test_upsert_rejects_nan() {
        let store = create_test_store().await;
        assert!(store.upsert_agent_stat("qwen", f64::NAN).await.is_err());
        assert!(store.agent_stat("qwen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_count_every_pull() {
        let store = Arc::new(create_test_store().await);
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            let agent = if i % 2 == 0 { "arcee" } else { "qwen" };
            handles.push(tokio::spawn(async move {
                store.upsert_agent_stat(agent, 1.0).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stats = store.agent_stats_map().await.unwrap();
        assert_eq!(stats["arcee"].pulls, 5);
        assert_eq!(stats["qwen"].pulls, 5);
    }

    #[tokio::test]
    async fn test_insert_interaction_is_idempotent_on_response_id() {
        let store = create_test_store().await;

        let first = store
            .insert_interaction(&interaction("solar", Some("r-1"), None))
            .await
            .unwrap();
        assert!(first.is_some());

        let again = store
            .insert_interaction(&interaction("solar", Some("r-1"), None))
            .await
            .unwrap();
        assert!(again.is_none());

        store
            .insert_interaction(&interaction("solar", None, None))
            .await
            .unwrap();
        store
            .insert_interaction(&interaction("solar", None, None))
            .await
            .unwrap();
        assert_eq!(store.interaction_count().await.unwrap(), 3);

        let loaded = store.interaction_by_response("r-1").await.unwrap().unwrap();
        assert_eq!(loaded.agent_id, "solar");
        assert_eq!(loaded.overall_score, Some(0.8));
    }

    #[tokio::test]
    async fn test_similar_by_embedding_orders_by_cosine() {
        let store = create_test_store().await;
        store
            .insert_interaction(&interaction("solar", None, Some(vec![1.0, 0.0])))
            .await
            .unwrap();
        store
            .insert_interaction(&interaction("qwen", None, Some(vec![0.7, 0.7])))
            .await
            .unwrap();
        store
            .insert_interaction(&interaction("liquid", None, None))
            .await
            .unwrap();

        let hits = store.similar_by_embedding(&[1.0, 0.0], 25).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].agent_id, "solar");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].agent_id, "qwen");

        let top1 = store.similar_by_embedding(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn test_similarity_window_limits_scan() {
        let db = Database::in_memory().await.unwrap();
        let store = RewardStore::new(db.pool().clone()).with_similarity_window(1);
        store
            .insert_interaction(&interaction("old", None, Some(vec![1.0, 0.0])))
            .await
            .unwrap();
        store
            .insert_interaction(&interaction("new", None, Some(vec![0.0, 1.0])))
            .await
            .unwrap();

        let hits = store.similar_by_embedding(&[1.0, 0.0], 25).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].agent_id, "new");
    }

    #[tokio::test]
    async fn test_prune_interactions_removes_oldest() {
        let store = create_test_store().await;
        for _ in 0..10 {
            store
                .insert_interaction(&interaction("solar", None, None))
                .await
                .unwrap();
        }

        assert_eq!(store.prune_interactions(20, 2).await.unwrap(), 0);

        let deleted = store.prune_interactions(8, 2).await.unwrap();
        assert_eq!(deleted, 4);
        assert_eq!(store.interaction_count().await.unwrap(), 6);

        let recent = store.recent_interactions(100).await.unwrap();
        assert_eq!(recent.len(), 6);
        assert!(recent.windows(2).all(|w| w[0].id > w[1].id));
        assert!(recent.iter().all(|r| r.id > 4));
    }
}
