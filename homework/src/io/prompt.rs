//! Prompt packs for every completion-service role.
//!
//! Templates are Markdown with `<!-- section:KEY required|droppable -->`
//! markers. The `contract` section becomes the system prompt; the rest is the
//! user prompt, fitted into a byte budget by dropping droppable sections in a
//! fixed per-role order and then truncating the largest remaining section.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::plan::PlanStep;
use crate::core::tools::{EXECUTOR_CALL_CAP, PLANNER_CALL_CAP, REPAIR_CALL_CAP};
use crate::core::types::WorkspaceRefs;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const EXECUTOR_TEMPLATE: &str = include_str!("prompts/executor.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const REPORT_TEMPLATE: &str = include_str!("prompts/report.md");

/// Delegated tasks accepted from one planner call.
pub const MAX_DELEGATED_TASKS: usize = 3;

const CONTRACT_KEY: &str = "contract";
const TRUNCATION_MARK: &str = "\n[truncated]";

const PLANNER_DROP_ORDER: &[&str] = &["scratchpad", "executors", "previous", "plan", "answers"];
const EXECUTOR_DROP_ORDER: &[&str] = &["scratchpad"];
const REPAIR_DROP_ORDER: &[&str] = &["workspace", "objective"];
const REPORT_DROP_ORDER: &[&str] = &[];

static SECTION_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->"));

#[derive(Debug, Clone, Copy, Serialize)]
struct Limits {
    tool_calls: usize,
    tasks: usize,
    executor_tool_calls: usize,
    repair_tool_calls: usize,
}

const LIMITS: Limits = Limits {
    tool_calls: PLANNER_CALL_CAP,
    tasks: MAX_DELEGATED_TASKS,
    executor_tool_calls: EXECUTOR_CALL_CAP,
    repair_tool_calls: REPAIR_CALL_CAP,
};

/// What the planner is told about the iteration before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreviousIteration {
    pub number: u32,
    pub progress_made: bool,
    /// `name(args)` of each tool call, so the model can avoid exact repeats.
    pub tool_calls: Vec<String>,
    pub tasks: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorNote {
    pub branch_id: String,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerPrompt {
    pub objective: String,
    pub run_id: String,
    pub iteration: u32,
    pub workspace: WorkspaceRefs,
    pub authorized_projects: Vec<String>,
    pub previous: Option<PreviousIteration>,
    pub plan: Vec<PlanStep>,
    pub executor_notes: Vec<ExecutorNote>,
    pub user_answers: Vec<String>,
    pub scratchpad_tail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorPrompt {
    pub objective: String,
    pub task_title: String,
    pub task_objective: String,
    pub tool_hints: Vec<String>,
    pub branch_id: String,
    pub workspace: WorkspaceRefs,
    pub authorized_projects: Vec<String>,
    pub scratchpad_tail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedCall {
    pub name: String,
    /// Arguments as compact JSON.
    pub args: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairPrompt {
    pub objective: String,
    pub workspace: WorkspaceRefs,
    pub failures: Vec<FailedCall>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportPrompt {
    pub objective: String,
    pub status: String,
    pub stop_reason: Option<String>,
    pub scratchpad: String,
}

/// A rendered prompt split into the system contract and the user context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Builds prompt packs within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_planner(&self, input: &PlannerPrompt) -> Result<PromptPack> {
        self.build("planner", PLANNER_TEMPLATE, input, PLANNER_DROP_ORDER)
    }

    pub fn build_executor(&self, input: &ExecutorPrompt) -> Result<PromptPack> {
        self.build("executor", EXECUTOR_TEMPLATE, input, EXECUTOR_DROP_ORDER)
    }

    pub fn build_repair(&self, input: &RepairPrompt) -> Result<PromptPack> {
        self.build("repair", REPAIR_TEMPLATE, input, REPAIR_DROP_ORDER)
    }

    pub fn build_report(&self, input: &ReportPrompt) -> Result<PromptPack> {
        self.build("report", REPORT_TEMPLATE, input, REPORT_DROP_ORDER)
    }

    fn build<T: Serialize>(
        &self,
        name: &'static str,
        source: &'static str,
        input: &T,
        drop_order: &[&str],
    ) -> Result<PromptPack> {
        let rendered = render(name, source, input)?;
        let mut sections = parse_sections(&rendered)?;
        let system = match sections.iter().position(|s| s.key == CONTRACT_KEY) {
            Some(idx) => sections.remove(idx).content,
            None => return Err(anyhow!("{name} template has no contract section")),
        };
        apply_budget(&mut sections, self.budget_bytes, drop_order);
        Ok(PromptPack {
            system,
            user: render_sections(&sections),
        })
    }
}

fn render<T: Serialize>(name: &'static str, source: &'static str, input: &T) -> Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)
        .map_err(|err| anyhow!("invalid {name} template: {err}"))?;
    let template = env.get_template(name)?;
    let value = minijinja::Value::from_serialize(input);
    let rendered = template
        .render(minijinja::context! { limits => LIMITS, ..value })
        .map_err(|err| anyhow!("render {name} prompt: {err}"))?;
    Ok(rendered)
}

fn parse_sections(rendered: &str) -> Result<Vec<ParsedSection>> {
    let re = SECTION_RE
        .as_ref()
        .map_err(|err| anyhow!("section marker pattern: {err}"))?;
    let markers: Vec<_> = re.captures_iter(rendered).collect();

    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let Some(marker) = caps.get(0) else { continue };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let required = &caps[2] == "required";
        let content = rendered[marker.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: caps[1].to_string(),
                required,
                content,
            });
        }
    }
    Ok(sections)
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize, drop_order: &[&str]) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in drop_order {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = dropped.content.len(),
                "dropped section for budget"
            );
        }
    }

    let used = total(sections);
    if used <= budget {
        return;
    }
    let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len()) else {
        return;
    };
    let allowed = budget.saturating_sub(used - largest.content.len());
    let before_len = largest.content.len();
    if allowed > TRUNCATION_MARK.len() {
        let cut = floor_char_boundary(&largest.content, allowed - TRUNCATION_MARK.len());
        largest.content.truncate(cut);
        largest.content.push_str(TRUNCATION_MARK);
    } else {
        let cut = floor_char_boundary(&largest.content, allowed);
        largest.content.truncate(cut);
    }
    debug!(
        section = largest.key,
        before_len,
        after_len = largest.content.len(),
        "truncated section for budget"
    );
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

/// The last `max_bytes` of `text`, starting on a line boundary when possible.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let rest = &text[start..];
    match rest.find('\n') {
        Some(newline) if newline + 1 < rest.len() => &rest[newline + 1..],
        _ => rest,
    }
}
