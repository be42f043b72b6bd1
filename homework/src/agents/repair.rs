//! Repair agent: regenerates arguments for tool calls that failed with an error.

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use crate::core::tools::{ToolCall, ToolResult};
use crate::core::types::WorkspaceRefs;
use crate::io::completion::{CallerIds, CompletionService, Profile, UsageSink, request_json};
use crate::io::prompt::{FailedCall, PromptBuilder, RepairPrompt};

use super::{AgentSettings, completion_request};

const REPAIR_OUTPUT_SCHEMA: &str = include_str!("../../schemas/repair_output.schema.json");

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRepairOutput {
    tool_calls: Value,
}

#[derive(Debug, Clone)]
pub struct RepairAgent {
    settings: AgentSettings,
}

impl RepairAgent {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    /// Corrected calls for `failed`; the dispatcher applies the repair cap.
    pub async fn repair(
        &self,
        service: &dyn CompletionService,
        usage: &dyn UsageSink,
        caller: CallerIds,
        objective: &str,
        workspace: &WorkspaceRefs,
        failed: &[ToolResult],
    ) -> Result<Vec<ToolCall>> {
        let input = RepairPrompt {
            objective: objective.to_string(),
            workspace: workspace.clone(),
            failures: failed.iter().map(failed_call).collect(),
        };
        let pack = PromptBuilder::new(self.settings.prompt_budget_bytes).build_repair(&input)?;
        let request = completion_request(
            pack,
            caller,
            Profile::Repair,
            REPAIR_OUTPUT_SCHEMA,
            self.settings,
        );
        let raw: RawRepairOutput = request_json(service, usage, request).await?;
        Ok(ToolCall::parse_list(&raw.tool_calls))
    }
}

fn failed_call(result: &ToolResult) -> FailedCall {
    FailedCall {
        name: result.name.clone(),
        args: result.args.to_string(),
        error: result.error.clone().unwrap_or_default(),
    }
}
