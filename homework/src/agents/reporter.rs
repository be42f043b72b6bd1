//! Final report synthesis for a run that reached a terminal status.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::types::{FinalReport, MetricsSnapshot, ReportEntities, Run};
use crate::io::completion::{CallerIds, CompletionService, Profile, UsageSink, request_json};
use crate::io::prompt::{PromptBuilder, ReportPrompt};

use super::{AgentSettings, completion_request};

const FINAL_REPORT_SCHEMA: &str = include_str!("../../schemas/final_report.schema.json");

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReportDraft {
    title: String,
    objective: String,
    summary: String,
    entities: ReportEntities,
    artifacts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReporterAgent {
    settings: AgentSettings,
}

impl ReporterAgent {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    /// Ask for a report written from `scratchpad` alone, then stamp the run's
    /// own status, stop reason and metrics onto it.
    pub async fn synthesize(
        &self,
        service: &dyn CompletionService,
        usage: &dyn UsageSink,
        caller: CallerIds,
        run: &Run,
        scratchpad: &str,
        now: DateTime<Utc>,
    ) -> Result<FinalReport> {
        let input = ReportPrompt {
            objective: run.objective.clone(),
            status: run.status.as_str().to_string(),
            stop_reason: run
                .stop_reason
                .as_ref()
                .map(|reason| format!("{}: {}", reason.kind.as_str(), reason.detail)),
            scratchpad: scratchpad.to_string(),
        };
        let pack = PromptBuilder::new(self.settings.prompt_budget_bytes).build_report(&input)?;
        let request = completion_request(
            pack,
            caller,
            Profile::Report,
            FINAL_REPORT_SCHEMA,
            self.settings,
        );
        let draft: ReportDraft = request_json(service, usage, request).await?;
        Ok(stamp(draft, run, now))
    }
}

fn stamp(draft: ReportDraft, run: &Run, now: DateTime<Utc>) -> FinalReport {
    let title = match draft.title.trim() {
        "" => format!("Homework run {}", run.id),
        title => title.to_string(),
    };
    let objective = match draft.objective.trim() {
        "" => run.objective.clone(),
        objective => objective.to_string(),
    };
    FinalReport {
        title,
        objective,
        status: run.status,
        summary: draft.summary.trim().to_string(),
        entities: draft.entities,
        artifacts: draft.artifacts,
        metrics: MetricsSnapshot {
            iterations: run.iteration,
            total_tokens: run.metrics.usage.total_tokens,
            total_cost: run.metrics.usage.total_cost,
            running_time_ms: run.metrics.running_time_ms,
        },
        stop_reason: run.stop_reason.clone(),
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RunStatus, StopKind, StopReason};
    use crate::test_support::sample_run;

    /// Verifies the run, not the model, decides status, metrics and stop reason.
    #[test]
    fn stamp_uses_run_facts() {
        let mut run = sample_run("run-9");
        run.status = RunStatus::Stopped;
        run.iteration = 4;
        run.metrics.usage.total_tokens = 1_200;
        run.metrics.running_time_ms = 9_000;
        run.stop_reason = Some(StopReason::new(StopKind::NoProgress, "idle"));

        let draft = ReportDraft {
            title: "  ".to_string(),
            summary: " Wrote an outline. ".to_string(),
            ..ReportDraft::default()
        };
        let report = stamp(draft, &run, Utc::now());

        assert_eq!(report.title, "Homework run run-9");
        assert_eq!(report.objective, run.objective);
        assert_eq!(report.status, RunStatus::Stopped);
        assert_eq!(report.summary, "Wrote an outline.");
        assert_eq!(report.metrics.iterations, 4);
        assert_eq!(report.metrics.total_tokens, 1_200);
        assert_eq!(report.metrics.running_time_ms, 9_000);
        assert_eq!(
            report.stop_reason.map(|reason| reason.kind),
            Some(StopKind::NoProgress)
        );
    }
}
