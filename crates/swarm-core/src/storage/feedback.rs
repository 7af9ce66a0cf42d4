//! Feedback events, attributed rewards and chunk training examples

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::records::{
    ChunkTrainingExample, FeedbackEvent, FeedbackStats, RewardLogEntry, VerdictCounts,
};
use super::reward_store::RewardStore;
use crate::error::{Error, Result};
use crate::feedback::Verdict;

impl RewardStore {
    /// Append a raw feedback event
    pub async fn insert_feedback(
        &self,
        response_id: &str,
        user_id: Option<&str>,
        agent_ids: &[String],
        verdict: Verdict,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO response_feedback (response_id, user_id, agent_ids, verdict, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(response_id)
        .bind(user_id)
        .bind(serde_json::to_string(agent_ids)?)
        .bind(verdict.as_str())
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(Error::DatabaseError)?;

        Ok(result.last_insert_rowid())
    }

    pub async fn feedback_for_response(&self, response_id: &str) -> Result<Vec<FeedbackEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, response_id, user_id, agent_ids, verdict, created_at
            FROM response_feedback
            WHERE response_id = ?
            ORDER BY id
            "#,
        )
        .bind(response_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let verdict: String = row.get("verdict");
                let agent_ids: String = row.get("agent_ids");
                Some(FeedbackEvent {
                    id: row.get("id"),
                    response_id: row.get("response_id"),
                    user_id: row.get("user_id"),
                    agent_ids: serde_json::from_str(&agent_ids).unwrap_or_default(),
                    verdict: Verdict::from_str(&verdict).ok()?,
                    created_at: row
                        .try_get::<DateTime<Utc>, _>("created_at")
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .collect())
    }

    /// Up/down totals, overall and per named agent
    pub async fn feedback_stats(&self) -> Result<FeedbackStats> {
        let rows = sqlx::query("SELECT agent_ids, verdict FROM response_feedback")
            .fetch_all(self.pool())
            .await
            .map_err(Error::DatabaseError)?;

        let mut stats = FeedbackStats::default();
        for row in &rows {
            let verdict: String = row.get("verdict");
            let Ok(verdict) = Verdict::from_str(&verdict) else {
                continue;
            };
            let agent_ids: String = row.get("agent_ids");
            let agent_ids: Vec<String> = serde_json::from_str(&agent_ids).unwrap_or_default();

            bump(&mut stats.total, verdict);
            for agent in agent_ids {
                bump(stats.per_agent.entry(agent).or_default(), verdict);
            }
        }
        Ok(stats)
    }

    pub async fn insert_reward_log(&self, entry: &RewardLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_reward_log (
                response_id, user_id, agent_id, raw_feedback, contribution, ucb_weight, reward, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.response_id)
        .bind(&entry.user_id)
        .bind(&entry.agent_id)
        .bind(entry.raw_feedback)
        .bind(entry.contribution)
        .bind(entry.ucb_weight)
        .bind(entry.reward)
        .bind(entry.created_at)
        .execute(self.pool())
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    pub async fn recent_reward_log(&self, limit: usize) -> Result<Vec<RewardLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT response_id, user_id, agent_id, raw_feedback, contribution, ucb_weight, reward, created_at
            FROM agent_reward_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows
            .iter()
            .map(|row| RewardLogEntry {
                response_id: row.get("response_id"),
                user_id: row.get("user_id"),
                agent_id: row.get("agent_id"),
                raw_feedback: row.get("raw_feedback"),
                contribution: row.get("contribution"),
                ucb_weight: row.get("ucb_weight"),
                reward: row.get("reward"),
                created_at: row
                    .try_get::<DateTime<Utc>, _>("created_at")
                    .unwrap_or_else(|_| Utc::now()),
            })
            .collect())
    }

    pub async fn insert_chunk_training_example(&self, example: &ChunkTrainingExample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_training_examples (
                response_id, query, chunk_text, agent_id, features,
                user_feedback, final_quality_score, final_chunk_selected, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&example.response_id)
        .bind(&example.query)
        .bind(&example.chunk_text)
        .bind(&example.agent_id)
        .bind(serde_json::to_string(&example.features)?)
        .bind(example.user_feedback)
        .bind(example.final_quality_score)
        .bind(example.final_chunk_selected)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    pub async fn chunk_training_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunk_training_examples")
            .fetch_one(self.pool())
            .await
            .map_err(Error::DatabaseError)?;
        Ok(count as u64)
    }
}

fn bump(counts: &mut VerdictCounts, verdict: Verdict) {
    match verdict {
        Verdict::Up => counts.up += 1,
        Verdict::Down => counts.down += 1,
    }
}
