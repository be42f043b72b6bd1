//! Planner agent: one structured decision per iteration.

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::core::plan::{DraftStep, parse_steps};
use crate::core::status_block::StatusBlock;
use crate::core::tools::{TOOL_NAMES, ToolCall};
use crate::io::completion::{CallerIds, CompletionService, Profile, UsageSink, request_json};
use crate::io::prompt::{MAX_DELEGATED_TASKS, PlannerPrompt, PromptBuilder};

use super::{AgentSettings, completion_request};

const PLANNER_OUTPUT_SCHEMA: &str = include_str!("../../schemas/planner_output.schema.json");

/// A sub-goal handed to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedTask {
    pub title: String,
    pub objective: String,
    pub tool_hints: Vec<String>,
}

/// The planner's output after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerDecision {
    pub status: StatusBlock,
    /// Uncapped; the dispatcher enforces the batch cap.
    pub tool_calls: Vec<ToolCall>,
    pub tasks: Vec<DelegatedTask>,
    pub plan: Vec<DraftStep>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPlannerOutput {
    status: Value,
    tool_calls: Value,
    tasks: Value,
    plan: Value,
}

impl PlannerDecision {
    fn from_raw(raw: RawPlannerOutput) -> Self {
        let mut tasks = parse_tasks(&raw.tasks);
        if tasks.len() > MAX_DELEGATED_TASKS {
            debug!(requested = tasks.len(), "dropping delegated tasks over cap");
            tasks.truncate(MAX_DELEGATED_TASKS);
        }
        Self {
            status: StatusBlock::normalize(&raw.status),
            tool_calls: ToolCall::parse_list(&raw.tool_calls),
            tasks,
            plan: parse_steps(&raw.plan),
        }
    }
}

fn parse_tasks(raw: &Value) -> Vec<DelegatedTask> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let title = item.get("title")?.as_str()?.trim();
            if title.is_empty() {
                return None;
            }
            let objective = item
                .get("objective")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(title);
            let tool_hints = item
                .get("tool_hints")
                .and_then(Value::as_array)
                .map(|hints| {
                    hints
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|hint| TOOL_NAMES.contains(hint))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(DelegatedTask {
                title: title.to_string(),
                objective: objective.to_string(),
                tool_hints,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PlannerAgent {
    settings: AgentSettings,
}

impl PlannerAgent {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    pub async fn decide(
        &self,
        service: &dyn CompletionService,
        usage: &dyn UsageSink,
        caller: CallerIds,
        input: &PlannerPrompt,
    ) -> Result<PlannerDecision> {
        let pack = PromptBuilder::new(self.settings.prompt_budget_bytes).build_planner(input)?;
        let request = completion_request(
            pack,
            caller,
            Profile::Planner,
            PLANNER_OUTPUT_SCHEMA,
            self.settings,
        );
        let raw: RawPlannerOutput = request_json(service, usage, request).await?;
        Ok(PlannerDecision::from_raw(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status_block::NextActionHint;
    use serde_json::json;

    #[test]
    fn decision_is_normalized_from_loose_output() {
        let raw: RawPlannerOutput = serde_json::from_value(json!({
            "status": {"exit_signal": "true", "remaining_work": "Write summary"},
            "tool_calls": [
                {"name": "list_notes", "arguments": "{\"limit\": 5}"},
                {"name": ""},
                "garbage"
            ],
            "tasks": [
                {"title": "Outline", "tool_hints": ["create_note", 3, "delete_note"]},
                {"title": "  "},
                {"title": "B", "objective": "b"},
                {"title": "C", "objective": "c"},
                {"title": "D", "objective": "d"}
            ]
        }))
        .expect("raw");

        let decision = PlannerDecision::from_raw(raw);

        assert!(decision.status.exit_signal);
        assert_eq!(decision.status.remaining_work, vec!["Write summary"]);
        assert_eq!(decision.status.next_action_hint, NextActionHint::Replan);
        assert_eq!(decision.tool_calls.len(), 1);
        assert_eq!(decision.tool_calls[0].args, json!({"limit": 5}));
        assert_eq!(decision.tasks.len(), MAX_DELEGATED_TASKS);
        assert_eq!(decision.tasks[0].objective, "Outline");
        assert_eq!(decision.tasks[0].tool_hints, vec!["create_note"]);
        assert!(decision.plan.is_empty());
    }

    #[test]
    fn schema_is_valid_json() {
        let schema: Value = serde_json::from_str(PLANNER_OUTPUT_SCHEMA).expect("schema json");
        assert!(jsonschema::validator_for(&schema).is_ok());
    }
}
