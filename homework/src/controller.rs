//! Queue-driven run state machine.
//!
//! Each delivery of an [`IterationJob`] is handled to completion by
//! [`RunController::handle`]: load the run, claim the iteration row, run the
//! engine under a [`UsageTracker`], then carry out the [`NextAction`] chosen by
//! [`advance`]. No run state lives in memory between deliveries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::agents::AgentSettings;
use crate::agents::reporter::ReporterAgent;
use crate::core::budget::resolve_for;
use crate::core::decision::{IterationInput, NextAction, advance, fail};
use crate::core::types::{
    FinishedIteration, Iteration, IterationJob, IterationStatus, Run, RunEventKind, RunMetrics,
    RunPatch, RunStatus, StopKind, StopReason, Usage, UsageTotals, WorkspaceRefs,
};
use crate::io::completion::{CallerIds, CompletionService, UsageSink};
use crate::io::config::EngineConfig;
use crate::io::notify::{Notification, Notifier};
use crate::io::queue::JobQueue;
use crate::io::store::{Datastore, DuplicateIteration};
use crate::iteration::{EngineSettings, IterationEngine};
use crate::workspace::WorkspaceProvisioner;

/// Branch id of the planner's own iteration row.
pub const MAIN_BRANCH: &str = "main";

/// What one delivery did.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// The run was already terminal; nothing happened.
    Terminal(RunStatus),
    /// The iteration row was already finished by an earlier delivery.
    Duplicate,
    /// The iteration ran and the run moved to `status`.
    Ran {
        status: RunStatus,
        stop_reason: Option<StopReason>,
    },
}

/// Accumulates usage for one invocation and persists it after every call.
pub struct UsageTracker {
    store: Arc<dyn Datastore>,
    run_id: String,
    iteration: u32,
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    totals: UsageTotals,
    iteration_tokens: u64,
    iteration_cost: f64,
}

impl UsageTracker {
    pub fn new(
        store: Arc<dyn Datastore>,
        run_id: impl Into<String>,
        iteration: u32,
        totals: UsageTotals,
    ) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            iteration,
            state: Mutex::new(TrackerState {
                totals,
                ..TrackerState::default()
            }),
        }
    }

    pub async fn totals(&self) -> UsageTotals {
        self.state.lock().await.totals.clone()
    }

    /// Tokens and cost spent by this invocation alone.
    pub async fn iteration_usage(&self) -> (u64, f64) {
        let state = self.state.lock().await;
        (state.iteration_tokens, state.iteration_cost)
    }
}

#[async_trait]
impl UsageSink for UsageTracker {
    async fn record(&self, caller: &CallerIds, usage: &Usage) {
        // Held across the writes so persisted totals never go backwards.
        let mut state = self.state.lock().await;
        state.totals.add(usage);
        state.iteration_tokens += usage.total_tokens();
        state.iteration_cost += usage.cost.max(0.0);

        let patch = RunPatch {
            usage: Some(state.totals.clone()),
            ..RunPatch::default()
        };
        if let Err(err) = self.store.update_run(&self.run_id, patch).await {
            warn!(run_id = %self.run_id, label = %caller.label, error = %format!("{err:#}"), "persist usage failed");
        }
        let event = RunEventKind::IterationCostUpdate {
            model: usage.model.clone(),
            tokens: usage.total_tokens(),
            cost: usage.cost,
            total_tokens: state.totals.total_tokens,
            total_cost: state.totals.total_cost,
        };
        if let Err(err) = self
            .store
            .append_event(&self.run_id, self.iteration, event)
            .await
        {
            warn!(run_id = %self.run_id, error = %format!("{err:#}"), "cost update event failed");
        }
    }
}

pub struct RunController {
    store: Arc<dyn Datastore>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    service: Arc<dyn CompletionService>,
    engine: IterationEngine,
    config: EngineConfig,
}

impl RunController {
    pub fn new(
        store: Arc<dyn Datastore>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        service: Arc<dyn CompletionService>,
        config: EngineConfig,
    ) -> Self {
        let engine = IterationEngine::new(
            store.clone(),
            service.clone(),
            EngineSettings::from_config(&config),
        );
        Self {
            store,
            queue,
            notifier,
            service,
            engine,
            config,
        }
    }

    fn agent_settings(&self) -> AgentSettings {
        EngineSettings::from_config(&self.config).agents
    }

    /// Process one job delivery. Errors are datastore failures; the job should
    /// then stay unacknowledged so it is redelivered.
    #[instrument(skip_all, fields(run_id = %job.run_id, iteration = job.iteration))]
    pub async fn handle(&self, job: &IterationJob) -> Result<HandleOutcome> {
        let run = self.store.get_run(&job.run_id).await?;
        if run.status.is_terminal() {
            info!(status = run.status.as_str(), "run already terminal; skipping");
            return Ok(HandleOutcome::Terminal(run.status));
        }
        let number = job.iteration;

        if !self.claim_iteration(&run, number).await? {
            return Ok(HandleOutcome::Duplicate);
        }
        let run = self
            .store
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(RunStatus::Running),
                    iteration: Some(number),
                    ..RunPatch::default()
                },
            )
            .await?;
        self.store
            .append_event(
                &run.id,
                number,
                RunEventKind::IterationStarted {
                    branch_id: MAIN_BRANCH.to_string(),
                },
            )
            .await?;

        let budgets = resolve_for(job, &run, self.config.default_max_wall_clock_ms);
        let tracker = Arc::new(UsageTracker::new(
            self.store.clone(),
            run.id.clone(),
            number,
            run.metrics.usage.clone(),
        ));
        let started = Instant::now();
        let result = self.engine.run(&run, number, tracker.clone()).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut metrics = run.metrics.clone();
        metrics.usage = tracker.totals().await;
        let (tokens, cost) = tracker.iteration_usage().await;

        let outcome = match result {
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "iteration failed");
                self.store
                    .finish_iteration(
                        &run.id,
                        number,
                        FinishedIteration {
                            status: IterationStatus::Failed,
                            summary: message.clone(),
                            artifacts: json!({ "error": message }),
                            tokens,
                            cost,
                        },
                    )
                    .await?;
                self.store
                    .append_event(
                        &run.id,
                        number,
                        RunEventKind::IterationFailed {
                            error: message.clone(),
                        },
                    )
                    .await?;
                let transition = fail(&metrics, latency_ms, &message);
                self.apply(&run, job, transition.metrics, transition.action, None)
                    .await?
            }
            Ok(outcome) => {
                let iteration_status = if outcome.status.needs_user_input {
                    IterationStatus::WaitingOnUser
                } else {
                    IterationStatus::Success
                };
                let artifacts = serde_json::to_value(&outcome.artifacts)
                    .context("serialize iteration artifacts")?;
                self.store
                    .finish_iteration(
                        &run.id,
                        number,
                        FinishedIteration {
                            status: iteration_status,
                            summary: outcome.summary.clone(),
                            artifacts,
                            tokens,
                            cost,
                        },
                    )
                    .await?;
                self.store
                    .append_event(
                        &run.id,
                        number,
                        RunEventKind::IterationCompleted {
                            status: iteration_status,
                            progress_made: outcome.progress_made,
                            summary: outcome.summary.clone(),
                        },
                    )
                    .await?;

                let transition = advance(
                    &metrics,
                    &budgets,
                    IterationInput {
                        iteration: number,
                        needs_user_input: outcome.status.needs_user_input,
                        exit_signal: outcome.status.exit_signal,
                        completion_evidence: outcome.status.completion_evidence.clone(),
                        blocking_questions: outcome.status.blocking_questions.clone(),
                        progress_made: outcome.progress_made,
                        latency_ms,
                        plan: outcome.plan.clone(),
                    },
                );
                self.apply(
                    &run,
                    job,
                    transition.metrics,
                    transition.action,
                    Some(outcome.workspace),
                )
                .await?
            }
        };
        Ok(outcome)
    }

    /// Insert the iteration row, or recover one left `running` by a crashed
    /// delivery. Returns false when the row already finished.
    async fn claim_iteration(&self, run: &Run, number: u32) -> Result<bool> {
        let row = Iteration {
            run_id: run.id.clone(),
            number,
            branch_id: MAIN_BRANCH.to_string(),
            status: IterationStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            summary: String::new(),
            artifacts: json!({}),
            tokens: 0,
            cost: 0.0,
        };
        match self.store.insert_iteration(row).await {
            Ok(()) => Ok(true),
            Err(err) if err.is::<DuplicateIteration>() => {
                let existing = self
                    .store
                    .get_iteration(&run.id, number)
                    .await?
                    .ok_or_else(|| anyhow!("iteration {number} of run {} vanished", run.id))?;
                if existing.is_finished() {
                    info!(status = ?existing.status, "iteration already finished; skipping redelivery");
                    self.store
                        .append_event(&run.id, number, RunEventKind::IterationDuplicate)
                        .await?;
                    return Ok(false);
                }
                warn!("recovering unfinished iteration row");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Carry out `action`, persisting the folded metrics with the new status.
    ///
    /// If the run reached a terminal status in the meantime, only the metrics
    /// are written and nothing is enqueued.
    async fn apply(
        &self,
        run: &Run,
        job: &IterationJob,
        metrics: RunMetrics,
        action: NextAction,
        workspace: Option<WorkspaceRefs>,
    ) -> Result<HandleOutcome> {
        let patch = RunPatch {
            usage: Some(metrics.usage),
            running_time_ms: Some(metrics.running_time_ms),
            no_progress_streak: Some(metrics.no_progress_streak),
            last_plan: Some(metrics.last_plan),
            workspace,
            ..RunPatch::default()
        };
        let number = job.iteration;

        // A cancel can land while the iteration runs; it wins over `action`.
        let current = self.store.get_run(&run.id).await?;
        if current.status.is_terminal() {
            info!(
                status = current.status.as_str(),
                "run ended during the iteration; keeping its status"
            );
            let current = self.store.update_run(&run.id, patch).await?;
            return Ok(HandleOutcome::Ran {
                status: current.status,
                stop_reason: current.stop_reason,
            });
        }

        let (status, stop_reason) = match action {
            NextAction::Enqueue { iteration } => {
                let next = IterationJob {
                    run_id: run.id.clone(),
                    iteration,
                    budgets: job.budgets.clone(),
                };
                let key = next.dedup_key();
                let delay = Duration::from_millis(self.config.continue_delay_ms);
                // The job must exist before the run says `queued`.
                match self.queue.enqueue(next, delay, &key).await {
                    Ok(enqueued) => {
                        info!(next = iteration, ?enqueued, "next iteration enqueued");
                        self.store
                            .update_run(
                                &run.id,
                                RunPatch {
                                    status: Some(RunStatus::Queued),
                                    ..patch
                                },
                            )
                            .await?;
                        (RunStatus::Queued, None)
                    }
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "enqueue failed; failing run");
                        let reason = StopReason::new(
                            StopKind::EnqueueFailed,
                            format!("enqueue iteration {iteration}: {err:#}"),
                        );
                        self.terminate(&run.id, number, RunStatus::Failed, reason.clone(), patch)
                            .await?;
                        (RunStatus::Failed, Some(reason))
                    }
                }
            }
            NextAction::Pause { questions } => {
                self.store
                    .update_run(
                        &run.id,
                        RunPatch {
                            status: Some(RunStatus::WaitingOnUser),
                            ..patch
                        },
                    )
                    .await?;
                self.store
                    .append_event(
                        &run.id,
                        number,
                        RunEventKind::RunWaitingOnUser {
                            questions,
                            budgets: job.budgets.clone(),
                        },
                    )
                    .await?;
                info!("run waiting on user");
                (RunStatus::WaitingOnUser, None)
            }
            NextAction::Finalize { status, reason } => {
                self.terminate(&run.id, number, status, reason.clone(), patch)
                    .await?;
                (status, Some(reason))
            }
            NextAction::Fail { reason } => {
                self.terminate(&run.id, number, RunStatus::Failed, reason.clone(), patch)
                    .await?;
                (RunStatus::Failed, Some(reason))
            }
        };
        Ok(HandleOutcome::Ran {
            status,
            stop_reason,
        })
    }

    /// Move to a terminal status, log it, then report and notify.
    async fn terminate(
        &self,
        run_id: &str,
        number: u32,
        status: RunStatus,
        reason: StopReason,
        patch: RunPatch,
    ) -> Result<()> {
        self.store
            .update_run(
                run_id,
                RunPatch {
                    status: Some(status),
                    stop_reason: Some(reason.clone()),
                    ..patch
                },
            )
            .await?;
        let event = match status {
            RunStatus::Completed => RunEventKind::RunCompleted {
                detail: reason.detail.clone(),
            },
            RunStatus::Failed => RunEventKind::RunFailed {
                reason: reason.clone(),
            },
            RunStatus::Canceled => RunEventKind::RunCanceled,
            _ => RunEventKind::RunStopped {
                reason: reason.clone(),
            },
        };
        self.store.append_event(run_id, number, event).await?;
        info!(run_id, status = status.as_str(), reason = reason.kind.as_str(), "run finished");
        self.finalize(run_id).await
    }

    /// Write the final report once, then notify. No-op for non-terminal runs.
    async fn finalize(&self, run_id: &str) -> Result<()> {
        let run = self.store.get_run(run_id).await?;
        if !run.status.is_terminal() {
            return Ok(());
        }
        let report_title = match &run.final_report {
            Some(report) => Some(report.title.clone()),
            None => self.write_report(&run).await?,
        };
        self.notify(&run, report_title).await;
        Ok(())
    }

    async fn write_report(&self, run: &Run) -> Result<Option<String>> {
        let scratchpad = match &run.workspace {
            Some(refs) => WorkspaceProvisioner::new(self.store.clone())
                .read_document(&refs.scratchpad_document_id)
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %format!("{err:#}"), "scratchpad unreadable; reporting without it");
                    String::new()
                }),
            None => String::new(),
        };
        let tracker = UsageTracker::new(
            self.store.clone(),
            run.id.clone(),
            run.iteration,
            run.metrics.usage.clone(),
        );
        let caller = CallerIds {
            run_id: run.id.clone(),
            iteration: run.iteration,
            label: "report".to_string(),
        };
        let synthesized = ReporterAgent::new(self.agent_settings())
            .synthesize(
                self.service.as_ref(),
                &tracker,
                caller,
                run,
                &scratchpad,
                Utc::now(),
            )
            .await;
        match synthesized {
            Ok(report) => {
                let title = report.title.clone();
                self.store
                    .update_run(
                        &run.id,
                        RunPatch {
                            final_report: Some(report),
                            ..RunPatch::default()
                        },
                    )
                    .await?;
                self.store
                    .append_event(
                        &run.id,
                        run.iteration,
                        RunEventKind::RunReportCreated {
                            title: title.clone(),
                        },
                    )
                    .await?;
                info!(title = %title, "final report written");
                Ok(Some(title))
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "final report failed");
                self.store
                    .append_event(
                        &run.id,
                        run.iteration,
                        RunEventKind::RunReportFailed { error: message },
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    async fn notify(&self, run: &Run, report_title: Option<String>) {
        let Some(notification) = notification_for(run, report_title) else {
            return;
        };
        if let Err(err) = self.notifier.notify(notification).await {
            warn!(run_id = %run.id, error = %format!("{err:#}"), "notification failed");
        }
    }

    /// Record the user's answer and resume a run parked on questions.
    ///
    /// The resumed job keeps the budget override of the job that paused.
    #[instrument(skip(self, answer))]
    pub async fn answer(&self, run_id: &str, answer: &str) -> Result<u32> {
        let run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::WaitingOnUser {
            return Err(anyhow!(
                "run {run_id} is {}, not waiting on user input",
                run.status.as_str()
            ));
        }
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(anyhow!("answer must not be empty"));
        }
        self.store
            .append_event(
                run_id,
                run.iteration,
                RunEventKind::UserAnswered {
                    answer: answer.to_string(),
                },
            )
            .await?;

        let budgets = self
            .store
            .list_events(run_id)
            .await?
            .into_iter()
            .rev()
            .find_map(|event| match event.kind {
                RunEventKind::RunWaitingOnUser { budgets, .. } => Some(budgets),
                _ => None,
            })
            .flatten();
        let next = IterationJob {
            run_id: run_id.to_string(),
            iteration: run.iteration + 1,
            budgets,
        };
        let iteration = next.iteration;
        let key = next.dedup_key();
        self.queue
            .enqueue(next, Duration::ZERO, &key)
            .await
            .with_context(|| format!("enqueue iteration {iteration} of run {run_id}"))?;
        self.store
            .update_run(run_id, RunPatch::status(RunStatus::Queued))
            .await?;
        info!(next = iteration, "run resumed");
        Ok(iteration)
    }

    /// Mark a run canceled. Already-terminal runs are left as they are.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: &str) -> Result<RunStatus> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        self.terminate(
            run_id,
            run.iteration,
            RunStatus::Canceled,
            StopReason::new(StopKind::Canceled, "canceled by user"),
            RunPatch::default(),
        )
        .await?;
        Ok(RunStatus::Canceled)
    }
}

fn notification_for(run: &Run, report_title: Option<String>) -> Option<Notification> {
    let (title, message) = match run.status {
        RunStatus::Completed => (
            "Homework run completed",
            "Your homework run finished. The final report is ready.".to_string(),
        ),
        RunStatus::Stopped => (
            "Homework run stopped",
            format!(
                "Your homework run stopped early: {}.",
                stop_detail(run).unwrap_or("limit reached")
            ),
        ),
        RunStatus::Failed => (
            "Homework run failed",
            format!(
                "Your homework run failed: {}.",
                stop_detail(run).unwrap_or("unknown error")
            ),
        ),
        RunStatus::Canceled => (
            "Homework run canceled",
            "Your homework run was canceled.".to_string(),
        ),
        RunStatus::Queued | RunStatus::Running | RunStatus::WaitingOnUser => return None,
    };
    Some(Notification {
        recipient: run.user_id.clone(),
        kind: format!("homework_run_{}", run.status.as_str()),
        title: title.to_string(),
        message,
        action_target: format!("homework/runs/{}", run.id),
        payload: json!({
            "run_id": run.id,
            "status": run.status,
            "stop_reason": run.stop_reason,
            "report_title": report_title,
        }),
    })
}

fn stop_detail(run: &Run) -> Option<&str> {
    run.stop_reason
        .as_ref()
        .map(|reason| reason.detail.as_str())
        .filter(|detail| !detail.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_run;

    #[test]
    fn notification_copy_depends_on_status() {
        let mut run = sample_run("run-1");
        run.status = RunStatus::Stopped;
        run.stop_reason = Some(StopReason::new(StopKind::BudgetCost, "cost 2.0 reached budget 1.0"));

        let notification = notification_for(&run, Some("Essay plan".to_string())).expect("stopped");
        assert_eq!(notification.kind, "homework_run_stopped");
        assert_eq!(notification.recipient, run.user_id);
        assert!(notification.message.contains("cost 2.0 reached budget 1.0"));
        assert_eq!(notification.payload["report_title"], "Essay plan");
        assert_eq!(notification.action_target, "homework/runs/run-1");

        run.status = RunStatus::Completed;
        let notification = notification_for(&run, None).expect("completed");
        assert_eq!(notification.title, "Homework run completed");

        run.status = RunStatus::WaitingOnUser;
        assert!(notification_for(&run, None).is_none());
    }
}
