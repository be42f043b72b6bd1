//! Queue consumer: claims iteration jobs and hands them to the controller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::controller::{HandleOutcome, RunController};
use crate::io::queue::FileQueue;

/// Jobs claimed per poll. Deliveries are handled one at a time.
const CLAIM_BATCH: usize = 4;

pub struct Worker {
    queue: Arc<FileQueue>,
    controller: RunController,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: Arc<FileQueue>, controller: RunController, poll_interval: Duration) -> Self {
        Self {
            queue,
            controller,
            poll_interval,
        }
    }

    pub fn controller(&self) -> &RunController {
        &self.controller
    }

    /// Handle every job visible now. Returns how many were claimed.
    ///
    /// A job is acknowledged only when the controller returns `Ok`; otherwise
    /// it reappears after the queue's visibility timeout.
    pub async fn run_once(&self) -> Result<usize> {
        let claimed = self.queue.claim_ready(Utc::now(), CLAIM_BATCH).await?;
        for delivery in &claimed {
            match self.controller.handle(&delivery.job).await {
                Ok(outcome) => {
                    log_outcome(&delivery.job.run_id, delivery.job.iteration, &outcome);
                    self.queue.ack(&delivery.id).await?;
                }
                Err(err) => {
                    warn!(
                        run_id = %delivery.job.run_id,
                        iteration = delivery.job.iteration,
                        attempts = delivery.attempts,
                        error = %format!("{err:#}"),
                        "delivery failed; leaving job for redelivery"
                    );
                }
            }
        }
        Ok(claimed.len())
    }

    /// Keep polling until no job is pending at all (delayed jobs included).
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let claimed = self.run_once().await?;
            handled += claimed;
            if claimed == 0 {
                if self.queue.pending().await?.is_empty() {
                    return Ok(handled);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Poll forever.
    pub async fn run_forever(&self) -> Result<()> {
        info!(poll_ms = self.poll_interval.as_millis(), "worker started");
        loop {
            if self.run_once().await? == 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

fn log_outcome(run_id: &str, iteration: u32, outcome: &HandleOutcome) {
    match outcome {
        HandleOutcome::Terminal(status) => {
            debug!(run_id, iteration, status = status.as_str(), "skipped terminal run");
        }
        HandleOutcome::Duplicate => debug!(run_id, iteration, "skipped duplicate delivery"),
        HandleOutcome::Ran {
            status,
            stop_reason,
        } => info!(
            run_id,
            iteration,
            status = status.as_str(),
            stop_reason = stop_reason.as_ref().map(|reason| reason.kind.as_str()),
            "iteration handled"
        ),
    }
}
