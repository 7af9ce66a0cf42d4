//! Background post-answer work
//!
//! Answers are evaluated and recorded off the response path. Jobs go through
//! a bounded channel to a single worker task; a failed job is retried a few
//! times, so the interaction insert is idempotent on `response_id`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::LearningConfig;
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::feedback::SelfReflection;
use crate::llm::{EMBED_MAX_CHARS, truncate_chars};
use crate::storage::{NewInteraction, RewardStore};

const QUEUE_CAPACITY: usize = 256;
pub const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Evaluate and record one delivered answer
#[derive(Debug, Clone)]
pub struct PostAnswerJob {
    pub response_id: String,
    pub user_id: Option<String>,
    pub agent_id: String,
    pub query: String,
    pub response: String,
    pub query_embedding: Option<Vec<f32>>,
}

/// What one job did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    /// Interaction sequence id, `None` when the response was already recorded
    pub interaction_id: Option<i64>,
    pub overall_score: Option<f64>,
    pub reflected: bool,
    pub pruned: u64,
}

/// Runs post-answer jobs
pub struct PostAnswerWorker {
    store: Arc<RewardStore>,
    evaluator: Arc<Evaluator>,
    embeddings: EmbeddingClient,
    reflection: SelfReflection,
    learning: LearningConfig,
}

impl PostAnswerWorker {
    pub fn new(
        store: Arc<RewardStore>,
        evaluator: Arc<Evaluator>,
        embeddings: EmbeddingClient,
        reflection: SelfReflection,
        learning: LearningConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            embeddings,
            reflection,
            learning,
        }
    }

    pub async fn process(&self, job: &PostAnswerJob) -> Result<JobOutcome> {
        let scores = self.evaluator.evaluate(&job.query, &job.response).await;
        let overall = scores.overall();

        let response_embedding = self
            .embeddings
            .embed(truncate_chars(&job.response, EMBED_MAX_CHARS))
            .await;
        let query_embedding = match &job.query_embedding {
            Some(embedding) => Some(embedding.clone()),
            None => self.embeddings.embed(&job.query).await,
        };

        let interaction = NewInteraction {
            response_id: Some(job.response_id.clone()),
            user_id: job.user_id.clone(),
            agent_id: job.agent_id.clone(),
            query: job.query.clone(),
            response: job.response.clone(),
            query_embedding,
            response_embedding,
            relevance: scores.relevance,
            accuracy: scores.accuracy,
            clarity: scores.clarity,
            usefulness: scores.usefulness,
            overall_score: overall,
        };
        let mut outcome = JobOutcome {
            overall_score: overall,
            ..Default::default()
        };

        let Some(id) = self.store.insert_interaction(&interaction).await? else {
            return Ok(outcome);
        };
        outcome.interaction_id = Some(id);

        if let Some(reward) = overall
            && let Err(e) = self.store.upsert_agent_stat(&job.agent_id, reward).await
        {
            warn!(agent = %job.agent_id, error = %e, "Failed to apply judge reward");
        }

        if self.reflection.is_due(id) {
            match self.reflection.reflect().await {
                Ok(_) => outcome.reflected = true,
                Err(e) => warn!(error = %e, "Self-reflection failed"),
            }
        }

        match self
            .store
            .prune_interactions(self.learning.max_interactions, self.learning.prune_headroom)
            .await
        {
            Ok(pruned) => outcome.pruned = pruned,
            Err(e) => warn!(error = %e, "Pruning interactions failed"),
        }

        debug!(
            response_id = %job.response_id,
            agent = %job.agent_id,
            interaction_id = id,
            overall = ?overall,
            notes = %scores.notes,
            "Post-answer job done"
        );
        Ok(outcome)
    }

    /// Process with up to [`MAX_ATTEMPTS`] attempts
    pub async fn run(&self, job: PostAnswerJob) -> Option<JobOutcome> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.process(&job).await {
                Ok(outcome) => return Some(outcome),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(response_id = %job.response_id, attempt, error = %e, "Post-answer job failed, retrying");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    warn!(response_id = %job.response_id, attempt, error = %e, "Post-answer job dropped");
                }
            }
        }
        None
    }
}

/// Single-worker job queue
pub struct TaskQueue {
    sender: Mutex<Option<mpsc::Sender<PostAnswerJob>>>,
    tracker: TaskTracker,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("open", &self.is_open())
            .field("tracked", &self.tracker.len())
            .finish()
    }
}

impl TaskQueue {
    /// Spawn the worker; must be called inside a tokio runtime
    pub fn start(worker: PostAnswerWorker) -> Self {
        let (sender, mut receiver) = mpsc::channel::<PostAnswerJob>(QUEUE_CAPACITY);
        let tracker = TaskTracker::new();

        tracker.spawn(async move {
            while let Some(job) = receiver.recv().await {
                worker.run(job).await;
            }
            debug!("Task queue drained");
        });
        tracker.close();

        Self {
            sender: Mutex::new(Some(sender)),
            tracker,
        }
    }

    pub fn is_open(&self) -> bool {
        self.sender
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Queue a job; returns false when the queue is full or shut down
    pub fn enqueue(&self, job: PostAnswerJob) -> bool {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            warn!(response_id = %job.response_id, "Task queue closed, job dropped");
            return false;
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(response_id = %job.response_id, "Task queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(response_id = %job.response_id, "Task queue closed, job dropped");
                false
            }
        }
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
        self.tracker.wait().await;
        info!("Background tasks finished");
    }
}
