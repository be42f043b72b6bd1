//! The run controller's decision after one iteration, as a pure function.
//!
//! [`advance`] maps the run's accumulated metrics plus this iteration's outcome
//! to the next metrics and a [`NextAction`]. Stop conditions are checked in a
//! fixed priority order; the queue, datastore, and notifier only ever act on
//! the returned action.

use crate::core::budget::ResolvedBudgets;
use crate::core::plan::PlanStep;
use crate::core::types::{RunMetrics, RunStatus, StopKind, StopReason};

/// Consecutive idle iterations that stop a run.
pub const NO_PROGRESS_STOP_STREAK: u32 = 2;

/// What one finished iteration contributes to the decision.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationInput {
    pub iteration: u32,
    pub needs_user_input: bool,
    pub exit_signal: bool,
    pub completion_evidence: Vec<String>,
    pub blocking_questions: Vec<String>,
    pub progress_made: bool,
    /// Processing latency of this invocation.
    pub latency_ms: u64,
    pub plan: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Enqueue this iteration number, then mark the run `queued`.
    Enqueue { iteration: u32 },
    /// Park in `waiting_on_user` until an answer arrives.
    Pause { questions: Vec<String> },
    /// Terminal transition; the run gets a report and a notification.
    Finalize { status: RunStatus, reason: StopReason },
    /// The iteration itself failed.
    Fail { reason: StopReason },
}

impl NextAction {
    /// Status the run row should end up in once the action is carried out.
    pub fn run_status(&self) -> RunStatus {
        match self {
            NextAction::Enqueue { .. } => RunStatus::Queued,
            NextAction::Pause { .. } => RunStatus::WaitingOnUser,
            NextAction::Finalize { status, .. } => *status,
            NextAction::Fail { .. } => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub metrics: RunMetrics,
    pub action: NextAction,
}

/// Fold one successful iteration into the run and decide what happens next.
pub fn advance(
    metrics: &RunMetrics,
    budgets: &ResolvedBudgets,
    input: IterationInput,
) -> Transition {
    let mut next = metrics.clone();
    next.running_time_ms = next.running_time_ms.saturating_add(input.latency_ms);
    next.no_progress_streak = if input.progress_made {
        0
    } else {
        next.no_progress_streak.saturating_add(1)
    };
    let action = evaluate_stop(&next, budgets, &input);
    next.last_plan = input.plan;
    Transition {
        metrics: next,
        action,
    }
}

/// Record a failed iteration: latency still counts, the run fails.
pub fn fail(metrics: &RunMetrics, latency_ms: u64, error: &str) -> Transition {
    let mut next = metrics.clone();
    next.running_time_ms = next.running_time_ms.saturating_add(latency_ms);
    Transition {
        metrics: next,
        action: NextAction::Fail {
            reason: StopReason::new(StopKind::Error, error),
        },
    }
}

fn evaluate_stop(
    metrics: &RunMetrics,
    budgets: &ResolvedBudgets,
    input: &IterationInput,
) -> NextAction {
    let iteration = input.iteration;
    if input.needs_user_input {
        return NextAction::Pause {
            questions: input.blocking_questions.clone(),
        };
    }
    if input.exit_signal && !input.completion_evidence.is_empty() {
        return NextAction::Finalize {
            status: RunStatus::Completed,
            reason: StopReason::new(StopKind::Completed, input.completion_evidence.join("; ")),
        };
    }

    let stop = |kind, detail: String| NextAction::Finalize {
        status: RunStatus::Stopped,
        reason: StopReason::new(kind, detail),
    };

    if metrics.running_time_ms >= budgets.max_wall_clock_ms {
        return stop(
            StopKind::BudgetWallClock,
            format!(
                "running time {}ms reached budget {}ms",
                metrics.running_time_ms, budgets.max_wall_clock_ms
            ),
        );
    }
    if let Some(max_cost) = budgets.max_cost
        && metrics.usage.total_cost >= max_cost
    {
        return stop(
            StopKind::BudgetCost,
            format!(
                "cost {:.4} reached budget {:.4}",
                metrics.usage.total_cost, max_cost
            ),
        );
    }
    if let Some(max_tokens) = budgets.max_total_tokens
        && metrics.usage.total_tokens >= max_tokens
    {
        return stop(
            StopKind::BudgetTokens,
            format!(
                "{} tokens reached budget {}",
                metrics.usage.total_tokens, max_tokens
            ),
        );
    }
    // Strict comparison: with max_iterations = N the run stops after iteration N + 1.
    if let Some(max_iterations) = budgets.max_iterations
        && iteration > max_iterations
    {
        return stop(
            StopKind::MaxIterations,
            format!("iteration {iteration} exceeded max_iterations {max_iterations}"),
        );
    }
    if metrics.no_progress_streak >= NO_PROGRESS_STOP_STREAK {
        return stop(
            StopKind::NoProgress,
            format!(
                "no progress for {} consecutive iterations",
                metrics.no_progress_streak
            ),
        );
    }

    NextAction::Enqueue {
        iteration: iteration + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UsageTotals;

    fn unbounded() -> ResolvedBudgets {
        ResolvedBudgets {
            max_wall_clock_ms: 3_600_000,
            max_cost: None,
            max_total_tokens: None,
            max_iterations: None,
        }
    }

    fn idle(iteration: u32) -> IterationInput {
        IterationInput {
            iteration,
            needs_user_input: false,
            exit_signal: false,
            completion_evidence: Vec::new(),
            blocking_questions: Vec::new(),
            progress_made: false,
            latency_ms: 10,
            plan: Vec::new(),
        }
    }

    fn stop_kind(action: &NextAction) -> Option<StopKind> {
        match action {
            NextAction::Finalize { reason, .. } | NextAction::Fail { reason } => Some(reason.kind),
            _ => None,
        }
    }

    #[test]
    fn user_input_dominates_exit_signal() {
        let input = IterationInput {
            needs_user_input: true,
            exit_signal: true,
            completion_evidence: vec!["done".to_string()],
            blocking_questions: vec!["Which class?".to_string()],
            progress_made: true,
            ..idle(1)
        };
        let transition = advance(&RunMetrics::default(), &unbounded(), input);
        assert_eq!(
            transition.action,
            NextAction::Pause {
                questions: vec!["Which class?".to_string()]
            }
        );
        assert_eq!(transition.action.run_status(), RunStatus::WaitingOnUser);
    }

    #[test]
    fn exit_signal_needs_evidence() {
        let without = IterationInput {
            exit_signal: true,
            progress_made: true,
            ..idle(1)
        };
        let transition = advance(&RunMetrics::default(), &unbounded(), without);
        assert_eq!(transition.action, NextAction::Enqueue { iteration: 2 });

        let with = IterationInput {
            exit_signal: true,
            completion_evidence: vec!["essay saved as note_1".to_string()],
            ..idle(1)
        };
        let transition = advance(&RunMetrics::default(), &unbounded(), with);
        assert_eq!(transition.action.run_status(), RunStatus::Completed);
    }

    #[test]
    fn budgets_checked_in_priority_order() {
        let metrics = RunMetrics {
            usage: UsageTotals {
                total_cost: 2.0,
                total_tokens: 5_000,
                ..UsageTotals::default()
            },
            running_time_ms: 1_000,
            ..RunMetrics::default()
        };
        let mut budgets = ResolvedBudgets {
            max_wall_clock_ms: 500,
            max_cost: Some(1.0),
            max_total_tokens: Some(100),
            max_iterations: Some(0),
        };
        let progress = IterationInput {
            progress_made: true,
            ..idle(1)
        };

        let kind = |b: &ResolvedBudgets| stop_kind(&advance(&metrics, b, progress.clone()).action);
        assert_eq!(kind(&budgets), Some(StopKind::BudgetWallClock));
        budgets.max_wall_clock_ms = 60_000;
        assert_eq!(kind(&budgets), Some(StopKind::BudgetCost));
        budgets.max_cost = None;
        assert_eq!(kind(&budgets), Some(StopKind::BudgetTokens));
        budgets.max_total_tokens = None;
        assert_eq!(kind(&budgets), Some(StopKind::MaxIterations));
        budgets.max_iterations = None;
        assert_eq!(kind(&budgets), None);
    }

    #[test]
    fn wall_clock_includes_this_iterations_latency() {
        let metrics = RunMetrics {
            running_time_ms: 990,
            ..RunMetrics::default()
        };
        let budgets = ResolvedBudgets {
            max_wall_clock_ms: 1_000,
            ..unbounded()
        };
        let transition = advance(&metrics, &budgets, idle(1));
        assert_eq!(transition.metrics.running_time_ms, 1_000);
        assert_eq!(stop_kind(&transition.action), Some(StopKind::BudgetWallClock));
    }

    /// `iteration > max_iterations` is strict: iteration 1 of a one-iteration
    /// budget continues, iteration 2 stops.
    #[test]
    fn max_iterations_boundary_is_strict() {
        let budgets = ResolvedBudgets {
            max_iterations: Some(1),
            ..unbounded()
        };

        let first = advance(&RunMetrics::default(), &budgets, idle(1));
        assert_eq!(first.action, NextAction::Enqueue { iteration: 2 });
        assert_eq!(first.metrics.no_progress_streak, 1);

        let second = advance(&first.metrics, &budgets, idle(2));
        assert_eq!(stop_kind(&second.action), Some(StopKind::MaxIterations));
    }

    #[test]
    fn no_progress_stops_on_second_consecutive_iteration() {
        let first = advance(&RunMetrics::default(), &unbounded(), idle(1));
        assert_eq!(first.action, NextAction::Enqueue { iteration: 2 });

        let second = advance(&first.metrics, &unbounded(), idle(2));
        assert_eq!(stop_kind(&second.action), Some(StopKind::NoProgress));
        assert_eq!(second.metrics.no_progress_streak, 2);
    }

    #[test]
    fn progress_resets_streak() {
        let first = advance(&RunMetrics::default(), &unbounded(), idle(1));
        let second = advance(
            &first.metrics,
            &unbounded(),
            IterationInput {
                progress_made: true,
                ..idle(2)
            },
        );
        assert_eq!(second.metrics.no_progress_streak, 0);
        let third = advance(&second.metrics, &unbounded(), idle(3));
        assert_eq!(third.action, NextAction::Enqueue { iteration: 4 });
    }

    #[test]
    fn failure_keeps_running_time() {
        let metrics = RunMetrics {
            running_time_ms: 100,
            ..RunMetrics::default()
        };
        let transition = fail(&metrics, 50, "planner output unparseable");
        assert_eq!(transition.metrics.running_time_ms, 150);
        assert_eq!(stop_kind(&transition.action), Some(StopKind::Error));
        assert_eq!(transition.action.run_status(), RunStatus::Failed);
    }
}
