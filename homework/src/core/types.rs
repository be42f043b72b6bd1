//! Run, iteration and event records shared by the controller and the engine.
//!
//! These types are the persisted contract between independent queue deliveries:
//! everything one invocation needs from the previous one must be reachable from
//! a [`Run`], its [`Iteration`] rows, or its [`RunEvent`] log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::plan::PlanStep;

/// Lifecycle status of a run.
///
/// `waiting_on_user` is re-enterable; the four terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Stopped,
    Failed,
    Canceled,
    WaitingOnUser,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed | RunStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::WaitingOnUser => "waiting_on_user",
        }
    }
}

/// Which projects a run may touch beyond its own workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunScope {
    /// Workspace, allowlisted projects, and every project the actor is a member of.
    #[default]
    RunWide,
    /// Workspace and allowlisted projects only.
    ProjectScoped,
}

/// Caller- or run-configured ceilings. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    pub max_wall_clock_ms: Option<u64>,
    pub max_cost: Option<f64>,
    pub max_total_tokens: Option<u64>,
    pub max_iterations: Option<u32>,
}

/// Usage reported for a single completion-service call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-model slice of [`UsageTotals`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelUsage {
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Accumulated usage for a run. Totals only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageTotals {
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub by_model: BTreeMap<String, ModelUsage>,
}

impl UsageTotals {
    pub fn add(&mut self, usage: &Usage) {
        self.calls += 1;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens += usage.total_tokens();
        // Negative prices are a config mistake; never let them shrink the total.
        self.total_cost += usage.cost.max(0.0);

        let model = if usage.model.is_empty() {
            "unknown".to_string()
        } else {
            usage.model.clone()
        };
        let entry = self.by_model.entry(model).or_default();
        entry.calls += 1;
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.cost += usage.cost.max(0.0);
    }
}

/// Accumulated metrics persisted on the run row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetrics {
    pub usage: UsageTotals,
    /// Sum of per-iteration processing latency, not wall-clock since submission.
    pub running_time_ms: u64,
    pub no_progress_streak: u32,
    pub last_plan: Vec<PlanStep>,
}

/// Why a run left the `running`/`queued` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Completed,
    BudgetWallClock,
    BudgetCost,
    BudgetTokens,
    MaxIterations,
    NoProgress,
    Error,
    EnqueueFailed,
    Canceled,
}

impl StopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StopKind::Completed => "completed",
            StopKind::BudgetWallClock => "budget_wall_clock",
            StopKind::BudgetCost => "budget_cost",
            StopKind::BudgetTokens => "budget_tokens",
            StopKind::MaxIterations => "max_iterations",
            StopKind::NoProgress => "no_progress",
            StopKind::Error => "error",
            StopKind::EnqueueFailed => "enqueue_failed",
            StopKind::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReason {
    #[serde(rename = "type")]
    pub kind: StopKind,
    pub detail: String,
}

impl StopReason {
    pub fn new(kind: StopKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Ids of the documents and container provisioned for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRefs {
    pub actor_id: String,
    pub container_id: String,
    pub root_document_id: String,
    pub scratchpad_document_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportEntities {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub linked: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub iterations: u32,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub running_time_ms: u64,
}

/// Structured summary written once when a run reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub title: String,
    pub objective: String,
    pub status: RunStatus,
    pub summary: String,
    pub entities: ReportEntities,
    pub artifacts: Vec<String>,
    pub metrics: MetricsSnapshot,
    pub stop_reason: Option<StopReason>,
    pub created_at: DateTime<Utc>,
}

/// One top-level objective-driven execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub user_id: String,
    pub objective: String,
    pub scope: RunScope,
    pub project_ids: Vec<String>,
    /// Number of the most recently started iteration (0 before the first one).
    pub iteration: u32,
    pub status: RunStatus,
    pub budgets: Budgets,
    pub metrics: RunMetrics,
    pub workspace: Option<WorkspaceRefs>,
    pub stop_reason: Option<StopReason>,
    pub final_report: Option<FinalReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied atomically by the datastore.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub iteration: Option<u32>,
    pub usage: Option<UsageTotals>,
    pub running_time_ms: Option<u64>,
    pub no_progress_streak: Option<u32>,
    pub last_plan: Option<Vec<PlanStep>>,
    pub workspace: Option<WorkspaceRefs>,
    pub stop_reason: Option<StopReason>,
    pub final_report: Option<FinalReport>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Fold the patch into `run`. A terminal status, and the stop reason that
    /// came with it, are final: later status changes are dropped.
    pub fn apply(self, run: &mut Run, now: DateTime<Utc>) {
        let settled = run.status.is_terminal();
        if let Some(status) = self.status
            && !settled
        {
            run.status = status;
        }
        if let Some(iteration) = self.iteration {
            run.iteration = iteration;
        }
        if let Some(usage) = self.usage {
            run.metrics.usage = usage;
        }
        if let Some(ms) = self.running_time_ms {
            run.metrics.running_time_ms = ms;
        }
        if let Some(streak) = self.no_progress_streak {
            run.metrics.no_progress_streak = streak;
        }
        if let Some(plan) = self.last_plan {
            run.metrics.last_plan = plan;
        }
        if let Some(workspace) = self.workspace {
            run.workspace = Some(workspace);
        }
        if let Some(reason) = self.stop_reason
            && !settled
        {
            run.stop_reason = Some(reason);
        }
        // Reports are written once and never regenerated.
        if let Some(report) = self.final_report
            && run.final_report.is_none()
        {
            run.final_report = Some(report);
        }
        run.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// Row created, engine not finished (or the worker crashed mid-flight).
    Running,
    Success,
    Failed,
    WaitingOnUser,
}

/// One bounded planner pass, keyed by `(run_id, number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub run_id: String,
    pub number: u32,
    pub branch_id: String,
    pub status: IterationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: String,
    pub artifacts: Value,
    pub tokens: u64,
    pub cost: f64,
}

impl Iteration {
    pub fn is_finished(&self) -> bool {
        self.status != IterationStatus::Running
    }
}

/// The single end-of-invocation update to an iteration row.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedIteration {
    pub status: IterationStatus,
    pub summary: String,
    pub artifacts: Value,
    pub tokens: u64,
    pub cost: f64,
}

/// Append-only audit record, ordered by `(iteration, sequence)` within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub iteration: u32,
    pub sequence: u32,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted {
        objective: String,
    },
    IterationStarted {
        branch_id: String,
    },
    IterationCostUpdate {
        model: String,
        tokens: u64,
        cost: f64,
        total_tokens: u64,
        total_cost: f64,
    },
    IterationCompleted {
        status: IterationStatus,
        progress_made: bool,
        summary: String,
    },
    IterationFailed {
        error: String,
    },
    IterationDuplicate,
    RunWaitingOnUser {
        questions: Vec<String>,
        /// Budget override of the job that paused, carried to the resumed job.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        budgets: Option<Budgets>,
    },
    RunCompleted {
        detail: String,
    },
    RunStopped {
        reason: StopReason,
    },
    RunFailed {
        reason: StopReason,
    },
    RunCanceled,
    RunReportCreated {
        title: String,
    },
    RunReportFailed {
        error: String,
    },
    UserAnswered {
        answer: String,
    },
}

/// Payload of one "run one iteration" queue job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationJob {
    pub run_id: String,
    pub iteration: u32,
    #[serde(default)]
    pub budgets: Option<Budgets>,
}

impl IterationJob {
    /// Key that makes redelivery of the same `(run, iteration)` enqueue idempotent.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.run_id, self.iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> Run {
        let now = Utc::now();
        Run {
            id: "run-1".to_string(),
            user_id: "user-1".to_string(),
            objective: "objective".to_string(),
            scope: RunScope::RunWide,
            project_ids: Vec::new(),
            iteration: 0,
            status: RunStatus::Queued,
            budgets: Budgets::default(),
            metrics: RunMetrics::default(),
            workspace: None,
            stop_reason: None,
            final_report: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn report(title: &str) -> FinalReport {
        FinalReport {
            title: title.to_string(),
            objective: "objective".to_string(),
            status: RunStatus::Completed,
            summary: String::new(),
            entities: ReportEntities::default(),
            artifacts: Vec::new(),
            metrics: MetricsSnapshot::default(),
            stop_reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::WaitingOnUser.is_terminal());
    }

    #[test]
    fn usage_totals_accumulate_per_model() {
        let mut totals = UsageTotals::default();
        totals.add(&Usage {
            model: "a".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            cost: 0.5,
        });
        totals.add(&Usage {
            model: "a".to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost: 0.25,
        });
        totals.add(&Usage {
            model: String::new(),
            input_tokens: 3,
            output_tokens: 0,
            cost: -1.0,
        });

        assert_eq!(totals.calls, 3);
        assert_eq!(totals.total_tokens, 20);
        assert!((totals.total_cost - 0.75).abs() < f64::EPSILON);
        assert_eq!(totals.by_model["a"].calls, 2);
        assert_eq!(totals.by_model["unknown"].input_tokens, 3);
    }

    #[test]
    fn patch_never_replaces_existing_report() {
        let mut run = sample_run();
        let first = RunPatch {
            final_report: Some(report("first")),
            ..RunPatch::default()
        };
        first.apply(&mut run, Utc::now());
        let second = RunPatch {
            final_report: Some(report("second")),
            status: Some(RunStatus::Stopped),
            ..RunPatch::default()
        };
        second.apply(&mut run, Utc::now());

        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(
            run.final_report.as_ref().map(|r| r.title.as_str()),
            Some("first")
        );
    }

    /// Verifies a canceled run keeps its status when a late writer patches it.
    #[test]
    fn terminal_status_is_final() {
        let mut run = sample_run();
        RunPatch {
            status: Some(RunStatus::Canceled),
            stop_reason: Some(StopReason::new(StopKind::Canceled, "canceled by user")),
            ..RunPatch::default()
        }
        .apply(&mut run, Utc::now());

        RunPatch {
            status: Some(RunStatus::Queued),
            stop_reason: Some(StopReason::new(StopKind::Error, "late")),
            running_time_ms: Some(40),
            ..RunPatch::default()
        }
        .apply(&mut run, Utc::now());

        assert_eq!(run.status, RunStatus::Canceled);
        assert_eq!(run.stop_reason.as_ref().map(|r| r.kind), Some(StopKind::Canceled));
        assert_eq!(run.metrics.running_time_ms, 40);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = RunEvent {
            run_id: "run-1".to_string(),
            iteration: 2,
            sequence: 0,
            at: Utc::now(),
            kind: RunEventKind::RunStopped {
                reason: StopReason::new(StopKind::NoProgress, "two idle iterations"),
            },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "run_stopped");
        assert_eq!(value["reason"]["type"], "no_progress");

        let back: RunEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn dedup_key_is_run_and_iteration() {
        let job = IterationJob {
            run_id: "run-7".to_string(),
            iteration: 3,
            budgets: None,
        };
        assert_eq!(job.dedup_key(), "run-7:3");
    }
}
