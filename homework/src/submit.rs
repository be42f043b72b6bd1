//! Creating a run and queuing its first iteration.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::core::types::{
    Budgets, IterationJob, Run, RunEventKind, RunMetrics, RunPatch, RunScope, RunStatus,
    StopKind, StopReason,
};
use crate::io::queue::JobQueue;
use crate::io::store::Datastore;

/// What a caller provides to start a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitRequest {
    pub user_id: String,
    pub objective: String,
    pub scope: RunScope,
    pub project_ids: Vec<String>,
    pub budgets: Budgets,
}

/// Insert a `queued` run and enqueue iteration 1.
///
/// If the first job cannot be enqueued the run is marked `failed` and the
/// error is returned, so no run sits in `queued` without a job.
pub async fn submit_run(
    store: &dyn Datastore,
    queue: &dyn JobQueue,
    request: SubmitRequest,
) -> Result<Run> {
    let objective = request.objective.trim().to_string();
    if objective.is_empty() {
        return Err(anyhow!("objective must not be empty"));
    }
    let user_id = request.user_id.trim().to_string();
    if user_id.is_empty() {
        return Err(anyhow!("user id must not be empty"));
    }

    let now = Utc::now();
    let run = Run {
        id: format!("run-{}", Uuid::new_v4().simple()),
        user_id,
        objective: objective.clone(),
        scope: request.scope,
        project_ids: request.project_ids,
        iteration: 0,
        status: RunStatus::Queued,
        budgets: request.budgets,
        metrics: RunMetrics::default(),
        workspace: None,
        stop_reason: None,
        final_report: None,
        created_at: now,
        updated_at: now,
    };
    store.insert_run(run.clone()).await.context("insert run")?;
    store
        .append_event(&run.id, 0, RunEventKind::RunStarted { objective })
        .await?;

    let job = IterationJob {
        run_id: run.id.clone(),
        iteration: 1,
        budgets: None,
    };
    let key = job.dedup_key();
    if let Err(err) = queue.enqueue(job, Duration::ZERO, &key).await {
        error!(run_id = %run.id, error = %format!("{err:#}"), "first iteration not enqueued");
        let reason = StopReason::new(StopKind::EnqueueFailed, format!("enqueue iteration 1: {err:#}"));
        store
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(RunStatus::Failed),
                    stop_reason: Some(reason.clone()),
                    ..RunPatch::default()
                },
            )
            .await?;
        store
            .append_event(&run.id, 0, RunEventKind::RunFailed { reason })
            .await?;
        return Err(err.context(format!("submit run {}", run.id)));
    }
    info!(run_id = %run.id, "run submitted");
    Ok(run)
}
