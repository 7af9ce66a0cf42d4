//! Collaboration run traces and per-response ensemble records

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use super::records::{
    CollabRunRecord, CollabRunSummary, CollabStats, InteractionV2, NewCollabRun,
};
use super::reward_store::RewardStore;
use crate::error::{Error, Result};
use crate::feedback::Verdict;

fn decode_json<T: DeserializeOwned + Default>(row: &SqliteRow, column: &str) -> T {
    let text: String = row.get(column);
    serde_json::from_str(&text).unwrap_or_default()
}

fn created_at(row: &SqliteRow) -> DateTime<Utc> {
    row.try_get::<DateTime<Utc>, _>("created_at")
        .unwrap_or_else(|_| Utc::now())
}

impl RewardStore {
    pub async fn insert_collab_run(&self, run: &NewCollabRun) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO collab_runs (
                response_id, user_id, query, agents_used, leader_agent, router_reason,
                answers, synthesizer_id, final_answer, metrics, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.response_id)
        .bind(&run.user_id)
        .bind(&run.query)
        .bind(serde_json::to_string(&run.agents_used)?)
        .bind(&run.leader_agent)
        .bind(&run.router_reason)
        .bind(serde_json::to_string(&run.answers)?)
        .bind(&run.synthesizer_id)
        .bind(&run.final_answer)
        .bind(serde_json::to_string(&run.metrics)?)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(Error::DatabaseError)?;

        debug!(response_id = %run.response_id, agents = run.agents_used.len(), "Recorded collaboration run");
        Ok(result.last_insert_rowid())
    }

    pub async fn recent_collab_runs(&self, limit: usize) -> Result<Vec<CollabRunSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, response_id, query, agents_used, leader_agent, router_reason, created_at
            FROM collab_runs
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
            .map(|row| CollabRunSummary {
                id: row.get("id"),
                response_id: row.get("response_id"),
                query: row.get("query"),
                agents_used: decode_json(row, "agents_used"),
                leader_agent: row.get("leader_agent"),
                router_reason: row.get("router_reason"),
                created_at: created_at(row),
            })
            .collect())
    }

    /// Full trace of one run, looked up by row id or response id
    pub async fn collab_run_details(&self, id_or_response: &str) -> Result<Option<CollabRunRecord>> {
        let row_id = id_or_response.parse::<i64>().unwrap_or(-1);
        let row = sqlx::query(
            r#"
            SELECT id, response_id, user_id, query, agents_used, leader_agent, router_reason,
                   answers, synthesizer_id, final_answer, metrics, created_at
            FROM collab_runs
            WHERE id = ? OR response_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(row_id)
        .bind(id_or_response)
        .fetch_optional(self.pool())
        .await
        .map_err(Error::DatabaseError)?;

        Ok(row.map(|row| CollabRunRecord {
            id: row.get("id"),
            response_id: row.get("response_id"),
            user_id: row.get("user_id"),
            query: row.get("query"),
            agents_used: decode_json(&row, "agents_used"),
            leader_agent: row.get("leader_agent"),
            router_reason: row.get("router_reason"),
            answers: decode_json(&row, "answers"),
            synthesizer_id: row.get("synthesizer_id"),
            final_answer: row.get("final_answer"),
            metrics: decode_json(&row, "metrics"),
            created_at: created_at(&row),
        }))
    }

    pub async fn collab_stats(&self) -> Result<CollabStats> {
        let rows = sqlx::query("SELECT agents_used, leader_agent FROM collab_runs")
            .fetch_all(self.pool())
            .await
            .map_err(Error::DatabaseError)?;

        let mut stats = CollabStats {
            total_runs: rows.len() as u64,
            ..Default::default()
        };
        for row in &rows {
            let agents: Vec<String> = decode_json(row, "agents_used");
            for agent in agents {
                *stats.participation.entry(agent).or_insert(0) += 1;
            }
            let leader: String = row.get("leader_agent");
            *stats.leader_counts.entry(leader).or_insert(0) += 1;
        }
        Ok(stats)
    }

    pub async fn insert_interaction_v2(&self, record: &InteractionV2) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO interaction_v2 (
                response_id, query, agent_responses, ucb_scores, coherence_scores,
                novelty_scores, chunk_scores, selected_chunks, final_answer, feedback, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.response_id)
        .bind(&record.query)
        .bind(serde_json::to_string(&record.agent_responses)?)
        .bind(serde_json::to_string(&record.ucb_scores)?)
        .bind(serde_json::to_string(&record.coherence_scores)?)
        .bind(serde_json::to_string(&record.novelty_scores)?)
        .bind(serde_json::to_string(&record.chunk_scores)?)
        .bind(serde_json::to_string(&record.selected_chunks)?)
        .bind(&record.final_answer)
        .bind(record.feedback.map(|v| v.as_str()))
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    pub async fn interaction_v2_by_response_id(
        &self,
        response_id: &str,
    ) -> Result<Option<InteractionV2>> {
        let row = sqlx::query(
            r#"
            SELECT response_id, query, agent_responses, ucb_scores, coherence_scores,
                   novelty_scores, chunk_scores, selected_chunks, final_answer, feedback
            FROM interaction_v2
            WHERE response_id = ?
            "#,
        )
        .bind(response_id)
        .fetch_optional(self.pool())
        .await
        .map_err(Error::DatabaseError)?;

        Ok(row.map(|row| {
            let feedback: Option<String> = row.get("feedback");
            InteractionV2 {
                response_id: row.get("response_id"),
                query: row.get("query"),
                agent_responses: decode_json(&row, "agent_responses"),
                ucb_scores: decode_json::<BTreeMap<String, f64>>(&row, "ucb_scores"),
                coherence_scores: decode_json(&row, "coherence_scores"),
                novelty_scores: decode_json(&row, "novelty_scores"),
                chunk_scores: decode_json(&row, "chunk_scores"),
                selected_chunks: decode_json(&row, "selected_chunks"),
                final_answer: row.get("final_answer"),
                feedback: feedback.and_then(|f| Verdict::from_str(&f).ok()),
            }
        }))
    }

    /// Attach user feedback; returns false when no record exists for the response
    pub async fn update_interaction_v2_feedback(
        &self,
        response_id: &str,
        verdict: Verdict,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE interaction_v2 SET feedback = ? WHERE response_id = ?")
            .bind(verdict.as_str())
            .bind(response_id)
            .execute(self.pool())
            .await
            .map_err(Error::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }
}
