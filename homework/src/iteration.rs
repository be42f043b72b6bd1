//! One bounded planner pass over a run.
//!
//! [`IterationEngine::run`] provisions the workspace, rebuilds continuity from
//! the datastore, asks the planner for a decision, executes its tool calls
//! (with one repair pass), fans delegated tasks out to executors, and writes a
//! scratchpad section. It never changes the run row; the controller owns that.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::agents::AgentSettings;
use crate::agents::executor::{Assignment, ExecutorAgent, ExecutorDeps, ExecutorResult};
use crate::agents::planner::{DelegatedTask, PlannerAgent};
use crate::agents::repair::RepairAgent;
use crate::core::artifacts::{Artifacts, progress_made};
use crate::core::plan::{PlanStep, build_snapshot};
use crate::core::status_block::StatusBlock;
use crate::core::tools::{PLANNER_CALL_CAP, REPAIR_CALL_CAP, ToolResult};
use crate::core::types::{Iteration, Run, RunEventKind, WorkspaceRefs};
use crate::io::completion::{CallerIds, CompletionService, UsageSink};
use crate::io::config::EngineConfig;
use crate::io::prompt::{ExecutorNote, PlannerPrompt, PreviousIteration, tail};
use crate::io::store::Datastore;
use crate::tools::{AuthzScope, ToolDispatcher};
use crate::workspace::{BRANCH_PROP, WorkspaceProvisioner};

/// Executor scratchpads summarized for the planner.
const EXECUTOR_NOTE_LIMIT: usize = 6;
const EXECUTOR_NOTE_BYTES: usize = 600;
/// Most recent user answers shown to the planner.
const USER_ANSWER_LIMIT: usize = 3;
const BRANCH_SLUG_CHARS: usize = 40;

/// Knobs the engine reads from [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub agents: AgentSettings,
    pub scratchpad_tail_bytes: usize,
    pub max_concurrent_executors: usize,
}

impl EngineSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            agents: AgentSettings {
                prompt_budget_bytes: cfg.prompt_budget_bytes,
                max_retries: cfg.completion.max_retries,
            },
            scratchpad_tail_bytes: cfg.scratchpad_tail_bytes,
            max_concurrent_executors: cfg.max_concurrent_executors.max(1),
        }
    }
}

/// Everything recorded on the iteration row, and read back by the next one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationArtifacts {
    pub progress_made: bool,
    pub tool_results: Vec<ToolResult>,
    pub executors: Vec<ExecutorResult>,
    /// Union of every bucket reported by planner, repair and executor calls.
    pub entities: Artifacts,
    pub plan: Vec<PlanStep>,
}

impl IterationArtifacts {
    /// Lenient read of a stored row; malformed artifacts read as empty.
    pub fn from_row(row: &Iteration) -> Self {
        serde_json::from_value(row.artifacts.clone()).unwrap_or_default()
    }

    fn previous_context(&self, row: &Iteration) -> PreviousIteration {
        PreviousIteration {
            number: row.number,
            progress_made: self.progress_made,
            tool_calls: self
                .tool_results
                .iter()
                .map(|result| format!("{}({})", result.name, result.args))
                .collect(),
            tasks: self
                .executors
                .iter()
                .map(|executor| executor.title.clone())
                .collect(),
            summary: row.summary.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutcome {
    pub workspace: WorkspaceRefs,
    pub status: StatusBlock,
    pub summary: String,
    pub artifacts: IterationArtifacts,
    pub progress_made: bool,
    pub plan: Vec<PlanStep>,
}

#[derive(Clone)]
pub struct IterationEngine {
    store: Arc<dyn Datastore>,
    service: Arc<dyn CompletionService>,
    provisioner: WorkspaceProvisioner,
    settings: EngineSettings,
}

impl IterationEngine {
    pub fn new(
        store: Arc<dyn Datastore>,
        service: Arc<dyn CompletionService>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            provisioner: WorkspaceProvisioner::new(store.clone()),
            store,
            service,
            settings,
        }
    }

    /// Run iteration `number` of `run`, reporting every model call to `usage`.
    #[instrument(skip_all, fields(run_id = %run.id, iteration = number))]
    pub async fn run(
        &self,
        run: &Run,
        number: u32,
        usage: Arc<dyn UsageSink>,
    ) -> Result<IterationOutcome> {
        let refs = self
            .provisioner
            .ensure(run)
            .await
            .context("provision workspace")?;
        let scope = AuthzScope::resolve(self.store.as_ref(), run, &refs)
            .await
            .context("resolve authorization scope")?;
        let dispatcher = ToolDispatcher::new(self.store.clone(), scope, refs.clone());

        let prompt = self
            .planner_context(run, number, &refs, &dispatcher)
            .await
            .context("rebuild iteration context")?;
        let previous_plan = prompt.plan.clone();

        let decision = PlannerAgent::new(self.settings.agents)
            .decide(
                self.service.as_ref(),
                usage.as_ref(),
                caller(run, number, "planner"),
                &prompt,
            )
            .await
            .context("planner")?;
        let status = decision.status;

        let mut tool_results = dispatcher
            .execute_batch(&decision.tool_calls, PLANNER_CALL_CAP)
            .await;
        let repaired = self
            .repair_pass(run, number, &refs, &dispatcher, usage.as_ref(), &tool_results)
            .await;
        tool_results.extend(repaired);

        let executors = self
            .fan_out(run, number, &refs, &dispatcher, usage, decision.tasks)
            .await;

        let mut entities = Artifacts::default();
        for result in &tool_results {
            entities.merge(&result.artifacts);
        }
        for executor in &executors {
            entities.merge(&executor.artifacts);
        }
        let any_ok = tool_results.iter().any(|result| result.ok)
            || executors.iter().any(ExecutorResult::any_succeeded);
        let progress = progress_made(any_ok, &status.completion_evidence, &entities);

        let section = scratchpad_section(&status, &tool_results, &executors);
        self.provisioner
            .append_section(
                &refs.scratchpad_document_id,
                &format!("Iteration {number}"),
                &section,
            )
            .await
            .context("append scratchpad section")?;

        let plan = build_snapshot(
            decision.plan,
            &status.remaining_work,
            &previous_plan,
            number,
        );
        let summary = summarize(&status, &tool_results, &executors);
        info!(
            calls = tool_results.len(),
            executors = executors.len(),
            progress_made = progress,
            exit_signal = status.exit_signal,
            needs_user_input = status.needs_user_input,
            "iteration finished"
        );

        Ok(IterationOutcome {
            workspace: refs,
            summary,
            progress_made: progress,
            artifacts: IterationArtifacts {
                progress_made: progress,
                tool_results,
                executors,
                entities,
                plan: plan.clone(),
            },
            plan,
            status,
        })
    }

    async fn planner_context(
        &self,
        run: &Run,
        number: u32,
        refs: &WorkspaceRefs,
        dispatcher: &ToolDispatcher,
    ) -> Result<PlannerPrompt> {
        let previous_row = match number.checked_sub(1).filter(|n| *n > 0) {
            Some(previous) => self.store.get_iteration(&run.id, previous).await?,
            None => None,
        };
        let (previous, plan) = match &previous_row {
            Some(row) => {
                let artifacts = IterationArtifacts::from_row(row);
                let plan = if artifacts.plan.is_empty() {
                    run.metrics.last_plan.clone()
                } else {
                    artifacts.plan.clone()
                };
                (Some(artifacts.previous_context(row)), plan)
            }
            None => (None, run.metrics.last_plan.clone()),
        };

        let executor_notes = self
            .provisioner
            .recent_executor_scratchpads(refs, &run.id, EXECUTOR_NOTE_LIMIT)
            .await?
            .into_iter()
            .map(|doc| ExecutorNote {
                branch_id: doc.prop_str(BRANCH_PROP).unwrap_or_default().to_string(),
                summary: tail(&doc.body, EXECUTOR_NOTE_BYTES).trim().to_string(),
                title: doc.title,
            })
            .collect();

        let mut user_answers: Vec<String> = self
            .store
            .list_events(&run.id)
            .await?
            .into_iter()
            .filter_map(|event| match event.kind {
                RunEventKind::UserAnswered { answer } => Some(answer),
                _ => None,
            })
            .collect();
        let skip = user_answers.len().saturating_sub(USER_ANSWER_LIMIT);
        user_answers.drain(..skip);

        let scratchpad = self
            .provisioner
            .read_document(&refs.scratchpad_document_id)
            .await?;

        Ok(PlannerPrompt {
            objective: run.objective.clone(),
            run_id: run.id.clone(),
            iteration: number,
            workspace: refs.clone(),
            authorized_projects: dispatcher.scope().project_ids(),
            previous,
            plan,
            executor_notes,
            user_answers,
            scratchpad_tail: tail(&scratchpad, self.settings.scratchpad_tail_bytes).to_string(),
        })
    }

    /// One repair attempt for calls that failed with a fixable error.
    ///
    /// A failed repair request leaves the original failures as they are.
    async fn repair_pass(
        &self,
        run: &Run,
        number: u32,
        refs: &WorkspaceRefs,
        dispatcher: &ToolDispatcher,
        usage: &dyn UsageSink,
        results: &[ToolResult],
    ) -> Vec<ToolResult> {
        let failed: Vec<ToolResult> = results
            .iter()
            .filter(|result| result.is_repairable())
            .take(REPAIR_CALL_CAP)
            .cloned()
            .collect();
        if failed.is_empty() {
            return Vec::new();
        }
        let calls = match RepairAgent::new(self.settings.agents)
            .repair(
                self.service.as_ref(),
                usage,
                caller(run, number, "repair"),
                &run.objective,
                refs,
                &failed,
            )
            .await
        {
            Ok(calls) => calls,
            Err(err) => {
                warn!(error = %format!("{err:#}"), failed = failed.len(), "repair pass failed");
                return Vec::new();
            }
        };
        let mut repaired = dispatcher.execute_batch(&calls, REPAIR_CALL_CAP).await;
        for result in &mut repaired {
            result.repaired = true;
        }
        debug!(
            failed = failed.len(),
            repaired_ok = repaired.iter().filter(|result| result.ok).count(),
            "repair pass finished"
        );
        repaired
    }

    /// Run delegated tasks concurrently, returning results in task order.
    async fn fan_out(
        &self,
        run: &Run,
        number: u32,
        refs: &WorkspaceRefs,
        dispatcher: &ToolDispatcher,
        usage: Arc<dyn UsageSink>,
        tasks: Vec<DelegatedTask>,
    ) -> Vec<ExecutorResult> {
        if tasks.is_empty() {
            return Vec::new();
        }
        let agent = ExecutorAgent::new(self.settings.agents, self.settings.scratchpad_tail_bytes);
        let deps = ExecutorDeps {
            service: self.service.clone(),
            usage,
            dispatcher: dispatcher.clone(),
            provisioner: self.provisioner.clone(),
        };
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_executors));

        let branch_ids = branch_ids(&tasks);
        let assignments: Vec<Assignment> = tasks
            .into_iter()
            .zip(branch_ids)
            .map(|(task, branch_id)| Assignment {
                run_id: run.id.clone(),
                iteration: number,
                objective: run.objective.clone(),
                branch_id,
                workspace: refs.clone(),
                task,
            })
            .collect();

        let mut join_set: JoinSet<(usize, ExecutorResult)> = JoinSet::new();
        for (index, assignment) in assignments.iter().cloned().enumerate() {
            let agent = agent.clone();
            let deps = deps.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => agent.run(deps, assignment).await,
                    Err(err) => ExecutorResult::failed(&assignment, None, err.to_string()),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<ExecutorResult>> = vec![None; assignments.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => warn!(error = %err, "executor task aborted"),
            }
        }
        slots
            .into_iter()
            .zip(&assignments)
            .map(|(slot, assignment)| {
                slot.unwrap_or_else(|| {
                    ExecutorResult::failed(assignment, None, "executor task aborted".to_string())
                })
            })
            .collect()
    }
}

fn caller(run: &Run, number: u32, label: &str) -> CallerIds {
    CallerIds {
        run_id: run.id.clone(),
        iteration: number,
        label: label.to_string(),
    }
}

/// `task-<slug>` per task, suffixed `-2`, `-3`, ... when titles collide.
fn branch_ids(tasks: &[DelegatedTask]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            let slug = slug(&task.title);
            let base = if slug.is_empty() {
                format!("task-{}", index + 1)
            } else {
                format!("task-{slug}")
            };
            let mut id = base.clone();
            let mut n = 2;
            while !seen.insert(id.clone()) {
                id = format!("{base}-{n}");
                n += 1;
            }
            id
        })
        .collect()
}

fn slug(title: &str) -> String {
    let mut out = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
        if out.len() >= BRANCH_SLUG_CHARS {
            break;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn bullet_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n{heading}:\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
}

fn scratchpad_section(
    status: &StatusBlock,
    tool_results: &[ToolResult],
    executors: &[ExecutorResult],
) -> String {
    let progress = match status.progress_summary.trim() {
        "" => "(no summary)",
        summary => summary,
    };
    let mut out = format!("Progress: {progress}\n");
    bullet_list(&mut out, "Remaining work", &status.remaining_work);
    bullet_list(&mut out, "Blocking questions", &status.blocking_questions);
    bullet_list(&mut out, "Completion evidence", &status.completion_evidence);

    out.push_str("\nTool calls:\n");
    if tool_results.is_empty() {
        out.push_str("- none\n");
    }
    for result in tool_results {
        out.push_str(&result.outcome_line());
        out.push('\n');
    }
    if !executors.is_empty() {
        out.push_str("\nExecutors:\n");
        for executor in executors {
            out.push_str(&executor.summary_line());
            out.push('\n');
        }
    }
    out
}

fn summarize(
    status: &StatusBlock,
    tool_results: &[ToolResult],
    executors: &[ExecutorResult],
) -> String {
    let summary = status.progress_summary.trim();
    if !summary.is_empty() {
        return summary.to_string();
    }
    let ok = tool_results.iter().filter(|result| result.ok).count();
    format!(
        "{ok}/{} tool calls ok, {} delegated task(s)",
        tool_results.len(),
        executors.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::ToolCall;
    use serde_json::json;

    fn task(title: &str) -> DelegatedTask {
        DelegatedTask {
            title: title.to_string(),
            objective: title.to_string(),
            tool_hints: Vec::new(),
        }
    }

    #[test]
    fn branch_ids_are_slugged_and_unique() {
        let ids = branch_ids(&[
            task("Outline the essay!"),
            task("outline  the essay"),
            task("???"),
            task("Outline the essay"),
        ]);
        assert_eq!(
            ids,
            vec![
                "task-outline-the-essay",
                "task-outline-the-essay-2",
                "task-3",
                "task-outline-the-essay-3",
            ]
        );
    }

    #[test]
    fn slug_is_bounded() {
        let long = "word ".repeat(30);
        assert!(slug(&long).len() <= BRANCH_SLUG_CHARS);
        assert!(!slug(&long).ends_with('-'));
    }

    #[test]
    fn section_covers_status_calls_and_executors() {
        let status = StatusBlock {
            progress_summary: "Drafted outline".to_string(),
            remaining_work: vec!["Write intro".to_string()],
            blocking_questions: vec!["Which rubric?".to_string()],
            ..StatusBlock::default()
        };
        let call = ToolCall {
            name: "list_notes".to_string(),
            args: json!({}),
        };
        let results = vec![ToolResult::success(&call, json!({}), Artifacts::default())];

        let section = scratchpad_section(&status, &results, &[]);

        assert!(section.starts_with("Progress: Drafted outline"));
        assert!(section.contains("Remaining work:\n- Write intro"));
        assert!(section.contains("Blocking questions:\n- Which rubric?"));
        assert!(section.contains("- ok `list_notes`"));
        assert!(!section.contains("Executors:"));
        assert_eq!(summarize(&status, &results, &[]), "Drafted outline");
        assert_eq!(
            summarize(&StatusBlock::default(), &results, &[]),
            "1/1 tool calls ok, 0 delegated task(s)"
        );
    }

    #[test]
    fn previous_context_lists_calls_and_tasks() {
        let call = ToolCall {
            name: "get_note".to_string(),
            args: json!({"id": "note_1"}),
        };
        let artifacts = IterationArtifacts {
            progress_made: true,
            tool_results: vec![ToolResult::failure(&call, "note note_1 not found")],
            ..IterationArtifacts::default()
        };
        let row = Iteration {
            run_id: "run-1".to_string(),
            number: 1,
            branch_id: "main".to_string(),
            status: crate::core::types::IterationStatus::Success,
            started_at: chrono::Utc::now(),
            ended_at: None,
            summary: "looked around".to_string(),
            artifacts: serde_json::to_value(&artifacts).expect("artifacts"),
            tokens: 0,
            cost: 0.0,
        };

        let previous = IterationArtifacts::from_row(&row).previous_context(&row);

        assert_eq!(previous.number, 1);
        assert!(previous.progress_made);
        assert_eq!(previous.tool_calls, vec![r#"get_note({"id":"note_1"})"#]);
        assert_eq!(previous.summary, "looked around");
    }
}
