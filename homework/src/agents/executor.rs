//! Sub-agent executor: one bounded tool-call pass for a delegated task.
//!
//! Each assignment writes only to its own branch scratchpad, so concurrent
//! executors in one iteration never touch the same document.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::artifacts::Artifacts;
use crate::core::tools::{EXECUTOR_CALL_CAP, ToolCall, ToolResult};
use crate::core::types::WorkspaceRefs;
use crate::io::completion::{CallerIds, CompletionService, Profile, UsageSink, request_json};
use crate::io::prompt::{ExecutorPrompt, PromptBuilder, tail};
use crate::tools::ToolDispatcher;
use crate::workspace::WorkspaceProvisioner;

use super::planner::DelegatedTask;
use super::{AgentSettings, completion_request};

const EXECUTOR_OUTPUT_SCHEMA: &str = include_str!("../../schemas/executor_output.schema.json");

/// Handles an executor needs; cheap to clone into a spawned task.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub service: Arc<dyn CompletionService>,
    pub usage: Arc<dyn UsageSink>,
    pub dispatcher: ToolDispatcher,
    pub provisioner: WorkspaceProvisioner,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub run_id: String,
    pub iteration: u32,
    pub objective: String,
    pub branch_id: String,
    pub workspace: WorkspaceRefs,
    pub task: DelegatedTask,
}

/// What one executor did, recorded in the iteration artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub title: String,
    pub branch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratchpad_id: Option<String>,
    pub results: Vec<ToolResult>,
    pub artifacts: Artifacts,
    #[serde(default)]
    pub notes: String,
    /// Set when the executor itself failed; its tool results are then empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutorResult {
    pub fn any_succeeded(&self) -> bool {
        self.results.iter().any(|result| result.ok)
    }

    /// One line for the main scratchpad.
    pub fn summary_line(&self) -> String {
        if let Some(error) = &self.error {
            return format!("- `{}` {}: failed: {error}", self.branch_id, self.title);
        }
        let ok = self.results.iter().filter(|result| result.ok).count();
        format!(
            "- `{}` {}: {ok}/{} calls ok",
            self.branch_id,
            self.title,
            self.results.len()
        )
    }

    pub(crate) fn failed(assignment: &Assignment, scratchpad_id: Option<String>, error: String) -> Self {
        Self {
            title: assignment.task.title.clone(),
            branch_id: assignment.branch_id.clone(),
            scratchpad_id,
            results: Vec::new(),
            artifacts: Artifacts::default(),
            notes: String::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawExecutorOutput {
    tool_calls: Value,
    notes: String,
}

#[derive(Debug, Clone)]
pub struct ExecutorAgent {
    settings: AgentSettings,
    scratchpad_tail_bytes: usize,
}

impl ExecutorAgent {
    pub fn new(settings: AgentSettings, scratchpad_tail_bytes: usize) -> Self {
        Self {
            settings,
            scratchpad_tail_bytes,
        }
    }

    /// Run one assignment. Never fails: errors are reported in the result.
    #[instrument(skip_all, fields(run_id = %assignment.run_id, branch_id = %assignment.branch_id))]
    pub async fn run(&self, deps: ExecutorDeps, assignment: Assignment) -> ExecutorResult {
        let scratchpad = match deps
            .provisioner
            .ensure_executor_scratchpad(
                &assignment.workspace,
                &assignment.run_id,
                &assignment.branch_id,
                &assignment.task.title,
            )
            .await
        {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "executor scratchpad unavailable");
                return ExecutorResult::failed(&assignment, None, format!("{err:#}"));
            }
        };

        let input = ExecutorPrompt {
            objective: assignment.objective.clone(),
            task_title: assignment.task.title.clone(),
            task_objective: assignment.task.objective.clone(),
            tool_hints: assignment.task.tool_hints.clone(),
            branch_id: assignment.branch_id.clone(),
            workspace: assignment.workspace.clone(),
            authorized_projects: deps.dispatcher.scope().project_ids(),
            scratchpad_tail: tail(&scratchpad.body, self.scratchpad_tail_bytes).to_string(),
        };
        let caller = CallerIds {
            run_id: assignment.run_id.clone(),
            iteration: assignment.iteration,
            label: format!("executor-{}", assignment.branch_id),
        };

        let mut result = match self.propose(&deps, caller, &input).await {
            Ok(output) => {
                let calls = ToolCall::parse_list(&output.tool_calls);
                let results = deps.dispatcher.execute_batch(&calls, EXECUTOR_CALL_CAP).await;
                let mut artifacts = Artifacts::default();
                for tool_result in &results {
                    artifacts.merge(&tool_result.artifacts);
                }
                ExecutorResult {
                    title: assignment.task.title.clone(),
                    branch_id: assignment.branch_id.clone(),
                    scratchpad_id: Some(scratchpad.id.clone()),
                    results,
                    artifacts,
                    notes: output.notes.trim().to_string(),
                    error: None,
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "executor completion failed");
                ExecutorResult::failed(&assignment, Some(scratchpad.id.clone()), format!("{err:#}"))
            }
        };

        let section = scratchpad_section(&assignment, &result);
        let heading = format!("Iteration {}", assignment.iteration);
        if let Err(err) = deps
            .provisioner
            .append_section(&scratchpad.id, &heading, &section)
            .await
        {
            warn!(error = %format!("{err:#}"), "executor scratchpad append failed");
            result.notes = format!("{} (scratchpad not updated)", result.notes).trim().to_string();
        }
        info!(
            calls = result.results.len(),
            ok = result.any_succeeded(),
            failed = result.error.is_some(),
            "executor finished"
        );
        result
    }

    async fn propose(
        &self,
        deps: &ExecutorDeps,
        caller: CallerIds,
        input: &ExecutorPrompt,
    ) -> anyhow::Result<RawExecutorOutput> {
        let pack = PromptBuilder::new(self.settings.prompt_budget_bytes).build_executor(input)?;
        let request = completion_request(
            pack,
            caller,
            Profile::Executor,
            EXECUTOR_OUTPUT_SCHEMA,
            self.settings,
        );
        request_json(deps.service.as_ref(), deps.usage.as_ref(), request).await
    }
}

fn scratchpad_section(assignment: &Assignment, result: &ExecutorResult) -> String {
    let mut body = format!("Objective: {}\n", assignment.task.objective);
    if let Some(error) = &result.error {
        body.push_str(&format!("\nFailed: {error}\n"));
        return body;
    }
    if !result.notes.is_empty() {
        body.push_str(&format!("\nNotes: {}\n", result.notes));
    }
    body.push_str("\nTool calls:\n");
    if result.results.is_empty() {
        body.push_str("- none\n");
    }
    for tool_result in &result.results {
        body.push_str(&tool_result.outcome_line());
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assignment() -> Assignment {
        Assignment {
            run_id: "run-1".to_string(),
            iteration: 2,
            objective: "Organize notes".to_string(),
            branch_id: "task-outline".to_string(),
            workspace: WorkspaceRefs {
                actor_id: "actor_1".to_string(),
                container_id: "proj_1".to_string(),
                root_document_id: "note_root".to_string(),
                scratchpad_document_id: "note_pad".to_string(),
            },
            task: DelegatedTask {
                title: "Outline".to_string(),
                objective: "Draft headings".to_string(),
                tool_hints: Vec::new(),
            },
        }
    }

    #[test]
    fn section_lists_each_call() {
        let call = ToolCall {
            name: "create_note".to_string(),
            args: json!({"title": "Headings"}),
        };
        let result = ExecutorResult {
            title: "Outline".to_string(),
            branch_id: "task-outline".to_string(),
            scratchpad_id: Some("note_x".to_string()),
            results: vec![
                ToolResult::success(&call, json!({}), Artifacts::default()),
                ToolResult::failure(&call, "boom"),
            ],
            artifacts: Artifacts::default(),
            notes: "Headings first".to_string(),
            error: None,
        };

        let section = scratchpad_section(&assignment(), &result);

        assert!(section.starts_with("Objective: Draft headings"));
        assert!(section.contains("Notes: Headings first"));
        assert!(section.contains("- ok `create_note`"));
        assert!(section.contains("- failed `create_note`: boom"));
        assert_eq!(result.summary_line(), "- `task-outline` Outline: 1/2 calls ok");
    }

    #[test]
    fn failed_executor_reports_error_line() {
        let result = ExecutorResult::failed(&assignment(), None, "backend down".to_string());

        assert!(!result.any_succeeded());
        assert_eq!(
            result.summary_line(),
            "- `task-outline` Outline: failed: backend down"
        );
        assert!(scratchpad_section(&assignment(), &result).contains("Failed: backend down"));
    }
}
