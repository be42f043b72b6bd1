//! Durable "run one iteration" job queue.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::types::IterationJob;
use crate::io::state_file::{load_json_or_default, to_json_document, write_atomic_async};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    New,
    /// The dedup key was seen before; nothing was added.
    Duplicate,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make `job` deliverable after `delay`. Re-using a dedup key is a no-op.
    async fn enqueue(&self, job: IterationJob, delay: Duration, dedup_key: &str)
    -> Result<Enqueued>;
}

/// A job handed to a worker. Must be acknowledged or it is redelivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: String,
    pub job: IterationJob,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedJob {
    id: String,
    job: IterationJob,
    dedup_key: String,
    visible_at: DateTime<Utc>,
    attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct QueueState {
    jobs: Vec<QueuedJob>,
    seen_keys: BTreeSet<String>,
}

/// JSON-file queue at `.homework/state/queue.json` with at-least-once delivery.
pub struct FileQueue {
    path: PathBuf,
    visibility_timeout: Duration,
    lock: Mutex<()>,
}

impl FileQueue {
    pub fn open(path: impl Into<PathBuf>, visibility_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            visibility_timeout,
            lock: Mutex::new(()),
        }
    }

    async fn mutate<R: Send>(&self, f: impl FnOnce(&mut QueueState) -> R + Send) -> Result<R> {
        let _guard = self.lock.lock().await;
        let mut state: QueueState = load_json_or_default(&self.path)?;
        let out = f(&mut state);
        let doc = to_json_document(&state)?;
        write_atomic_async(&self.path, doc)
            .await
            .with_context(|| format!("persist queue {}", self.path.display()))?;
        Ok(out)
    }

    /// Claim up to `limit` visible jobs, hiding each for the visibility timeout.
    pub async fn claim_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedJob>> {
        let hidden_until = now + to_chrono(self.visibility_timeout);
        self.mutate(|state| {
            let mut ready: Vec<&mut QueuedJob> = state
                .jobs
                .iter_mut()
                .filter(|queued| queued.visible_at <= now)
                .collect();
            ready.sort_by_key(|queued| queued.visible_at);
            ready
                .into_iter()
                .take(limit)
                .map(|queued| {
                    queued.visible_at = hidden_until;
                    queued.attempts += 1;
                    ClaimedJob {
                        id: queued.id.clone(),
                        job: queued.job.clone(),
                        attempts: queued.attempts,
                    }
                })
                .collect()
        })
        .await
    }

    /// Remove a delivered job for good. Unknown ids are ignored.
    pub async fn ack(&self, id: &str) -> Result<()> {
        self.mutate(|state| state.jobs.retain(|queued| queued.id != id))
            .await
    }

    pub async fn pending(&self) -> Result<Vec<IterationJob>> {
        let _guard = self.lock.lock().await;
        let state: QueueState = load_json_or_default(&self.path)?;
        Ok(state.jobs.into_iter().map(|queued| queued.job).collect())
    }
}

#[async_trait]
impl JobQueue for FileQueue {
    async fn enqueue(
        &self,
        job: IterationJob,
        delay: Duration,
        dedup_key: &str,
    ) -> Result<Enqueued> {
        let visible_at = Utc::now() + to_chrono(delay);
        let outcome = self
            .mutate(|state| {
                if !state.seen_keys.insert(dedup_key.to_string()) {
                    return Enqueued::Duplicate;
                }
                state.jobs.push(QueuedJob {
                    id: Uuid::new_v4().to_string(),
                    job,
                    dedup_key: dedup_key.to_string(),
                    visible_at,
                    attempts: 0,
                });
                Enqueued::New
            })
            .await?;
        match outcome {
            Enqueued::New => info!(dedup_key, delay_ms = delay.as_millis() as u64, "job enqueued"),
            Enqueued::Duplicate => debug!(dedup_key, "duplicate enqueue ignored"),
        }
        Ok(outcome)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(iteration: u32) -> IterationJob {
        IterationJob {
            run_id: "run-1".to_string(),
            iteration,
            budgets: None,
        }
    }

    fn queue(temp: &tempfile::TempDir) -> FileQueue {
        FileQueue::open(temp.path().join("queue.json"), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn dedup_key_makes_enqueue_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        let first = queue
            .enqueue(job(2), Duration::ZERO, "run-1:2")
            .await
            .expect("enqueue");
        let second = queue
            .enqueue(job(2), Duration::ZERO, "run-1:2")
            .await
            .expect("enqueue");

        assert_eq!(first, Enqueued::New);
        assert_eq!(second, Enqueued::Duplicate);
        assert_eq!(queue.pending().await.expect("pending").len(), 1);
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimable_yet() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        queue
            .enqueue(job(1), Duration::from_secs(30), "run-1:1")
            .await
            .expect("enqueue");

        assert!(queue.claim_ready(Utc::now(), 10).await.expect("claim").is_empty());
        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(queue.claim_ready(later, 10).await.expect("claim").len(), 1);
    }

    /// Unacknowledged jobs come back after the visibility timeout.
    #[tokio::test]
    async fn unacked_jobs_are_redelivered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        queue
            .enqueue(job(1), Duration::ZERO, "run-1:1")
            .await
            .expect("enqueue");

        let now = Utc::now();
        let claimed = queue.claim_ready(now, 10).await.expect("claim");
        assert_eq!(claimed.len(), 1);
        assert!(queue.claim_ready(now, 10).await.expect("claim").is_empty());

        let after_timeout = now + chrono::Duration::seconds(61);
        let again = queue.claim_ready(after_timeout, 10).await.expect("claim");
        assert_eq!(again[0].attempts, 2);

        queue.ack(&again[0].id).await.expect("ack");
        assert!(queue.pending().await.expect("pending").is_empty());
    }
}
