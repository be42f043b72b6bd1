//! Budget resolution for one iteration.

use crate::core::types::{Budgets, IterationJob, Run};

/// Budgets in force for one invocation after precedence is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBudgets {
    pub max_wall_clock_ms: u64,
    pub max_cost: Option<f64>,
    pub max_total_tokens: Option<u64>,
    pub max_iterations: Option<u32>,
}

/// Resolve each ceiling independently: job override, then run, then default.
///
/// Only wall-clock has a default; the others stay unbounded unless set.
pub fn resolve(job: Option<&Budgets>, run: &Budgets, default_wall_clock_ms: u64) -> ResolvedBudgets {
    let pick_u64 = |f: fn(&Budgets) -> Option<u64>| job.and_then(f).or_else(|| f(run));
    ResolvedBudgets {
        max_wall_clock_ms: pick_u64(|b| b.max_wall_clock_ms).unwrap_or(default_wall_clock_ms),
        max_cost: job.and_then(|b| b.max_cost).or(run.max_cost),
        max_total_tokens: pick_u64(|b| b.max_total_tokens),
        max_iterations: job.and_then(|b| b.max_iterations).or(run.max_iterations),
    }
}

/// Convenience wrapper resolving against a job and its run.
pub fn resolve_for(job: &IterationJob, run: &Run, default_wall_clock_ms: u64) -> ResolvedBudgets {
    resolve(job.budgets.as_ref(), &run.budgets, default_wall_clock_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_overrides_run_per_field() {
        let job = Budgets {
            max_cost: Some(1.0),
            ..Budgets::default()
        };
        let run = Budgets {
            max_cost: Some(5.0),
            max_total_tokens: Some(10_000),
            max_wall_clock_ms: Some(1_000),
            max_iterations: None,
        };

        let resolved = resolve(Some(&job), &run, 3_600_000);
        assert_eq!(resolved.max_cost, Some(1.0));
        assert_eq!(resolved.max_total_tokens, Some(10_000));
        assert_eq!(resolved.max_wall_clock_ms, 1_000);
        assert_eq!(resolved.max_iterations, None);
    }

    #[test]
    fn wall_clock_falls_back_to_default() {
        let resolved = resolve(None, &Budgets::default(), 3_600_000);
        assert_eq!(resolved.max_wall_clock_ms, 3_600_000);
        assert_eq!(resolved.max_cost, None);
        assert_eq!(resolved.max_total_tokens, None);
    }
}
