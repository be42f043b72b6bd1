//! Tool-call vocabulary and argument coercion.
//!
//! Model output names a tool by string; it is converted once, here, into a
//! closed [`ToolOp`] so the dispatcher can match exhaustively. Unknown names
//! and unusable arguments are rejected at this boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::artifacts::Artifacts;
use crate::core::entity::TaskStatus;

pub const PLANNER_CALL_CAP: usize = 8;
pub const EXECUTOR_CALL_CAP: usize = 4;
pub const REPAIR_CALL_CAP: usize = 2;

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 50;

pub const UNAUTHORIZED: &str = "unauthorized project";
pub const UNSUPPORTED: &str = "Unsupported tool";

/// Names accepted by [`ToolOp::parse`], in prompt order.
pub const TOOL_NAMES: [&str; 10] = [
    "list_notes",
    "search_notes",
    "get_note",
    "create_note",
    "update_note",
    "list_tasks",
    "search_tasks",
    "get_task",
    "create_task",
    "update_task",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    /// Accept `{name, args}` or `{name, arguments}`, where arguments may be a JSON string.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let name = obj.get("name")?.as_str()?.trim().to_string();
        if name.is_empty() {
            return None;
        }
        let args = match obj.get("args").or_else(|| obj.get("arguments")) {
            Some(Value::String(encoded)) => {
                serde_json::from_str(encoded).unwrap_or(Value::Object(Default::default()))
            }
            Some(value @ Value::Object(_)) => value.clone(),
            _ => Value::Object(Default::default()),
        };
        Some(Self { name, args })
    }

    pub fn parse_list(raw: &Value) -> Vec<Self> {
        raw.as_array()
            .map(|items| items.iter().filter_map(Self::from_value).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolCallError {
    #[error("Unsupported tool")]
    Unsupported,
    #[error("missing required argument `{0}`")]
    MissingArg(&'static str),
    #[error("invalid value for `{field}`: {value}")]
    InvalidArg { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOp {
    ListNotes {
        project_id: Option<String>,
        limit: usize,
    },
    SearchNotes {
        query: String,
        project_id: Option<String>,
        limit: usize,
    },
    GetNote {
        id: String,
    },
    CreateNote {
        project_id: Option<String>,
        title: String,
        body: String,
        parent_id: Option<String>,
    },
    UpdateNote {
        id: String,
        title: Option<String>,
        body: Option<String>,
    },
    ListTasks {
        project_id: Option<String>,
        status: Option<TaskStatus>,
        limit: usize,
    },
    SearchTasks {
        query: String,
        project_id: Option<String>,
        limit: usize,
    },
    GetTask {
        id: String,
    },
    CreateTask {
        project_id: Option<String>,
        title: String,
        body: String,
        status: TaskStatus,
    },
    UpdateTask {
        id: String,
        title: Option<String>,
        body: Option<String>,
        status: Option<TaskStatus>,
    },
}

impl ToolOp {
    pub fn parse(call: &ToolCall) -> Result<Self, ToolCallError> {
        let args = Args(&call.args);
        let op = match call.name.as_str() {
            "list_notes" => ToolOp::ListNotes {
                project_id: args.opt_str("project_id"),
                limit: args.limit(),
            },
            "search_notes" => ToolOp::SearchNotes {
                query: args.req_str("query")?,
                project_id: args.opt_str("project_id"),
                limit: args.limit(),
            },
            "get_note" => ToolOp::GetNote {
                id: args.req_str("id")?,
            },
            "create_note" => ToolOp::CreateNote {
                project_id: args.opt_str("project_id"),
                title: args.req_str("title")?,
                body: args.opt_str("body").unwrap_or_default(),
                parent_id: args.opt_str("parent_id"),
            },
            "update_note" => ToolOp::UpdateNote {
                id: args.req_str("id")?,
                title: args.opt_str("title"),
                body: args.opt_str("body"),
            },
            "list_tasks" => ToolOp::ListTasks {
                project_id: args.opt_str("project_id"),
                status: args.opt_status()?,
                limit: args.limit(),
            },
            "search_tasks" => ToolOp::SearchTasks {
                query: args.req_str("query")?,
                project_id: args.opt_str("project_id"),
                limit: args.limit(),
            },
            "get_task" => ToolOp::GetTask {
                id: args.req_str("id")?,
            },
            "create_task" => ToolOp::CreateTask {
                project_id: args.opt_str("project_id"),
                title: args.req_str("title")?,
                body: args
                    .opt_str("body")
                    .or_else(|| args.opt_str("description"))
                    .unwrap_or_default(),
                status: args.opt_status()?.unwrap_or_default(),
            },
            "update_task" => ToolOp::UpdateTask {
                id: args.req_str("id")?,
                title: args.opt_str("title"),
                body: args
                    .opt_str("body")
                    .or_else(|| args.opt_str("description")),
                status: args.opt_status()?,
            },
            _ => return Err(ToolCallError::Unsupported),
        };
        Ok(op)
    }
}

struct Args<'a>(&'a Value);

impl Args<'_> {
    /// Strings are trimmed; numbers are accepted as ids. Blank means absent.
    fn opt_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn req_str(&self, key: &'static str) -> Result<String, ToolCallError> {
        self.opt_str(key).ok_or(ToolCallError::MissingArg(key))
    }

    fn limit(&self) -> usize {
        let raw = match self.0.get("limit") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        raw.map(|n| usize::try_from(n).unwrap_or(MAX_LIST_LIMIT))
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    fn opt_status(&self) -> Result<Option<TaskStatus>, ToolCallError> {
        match self.opt_str("status") {
            None => Ok(None),
            Some(raw) => TaskStatus::parse_loose(&raw)
                .map(Some)
                .ok_or(ToolCallError::InvalidArg {
                    field: "status",
                    value: raw,
                }),
        }
    }
}

/// Outcome of one dispatched call. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub args: Value,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Artifacts,
    /// Set on results produced by the repair pass.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub repaired: bool,
}

impl ToolResult {
    pub fn success(call: &ToolCall, result: Value, artifacts: Artifacts) -> Self {
        Self {
            name: call.name.clone(),
            args: call.args.clone(),
            ok: true,
            result: Some(result),
            error: None,
            artifacts,
            repaired: false,
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            name: call.name.clone(),
            args: call.args.clone(),
            ok: false,
            result: None,
            error: Some(error.into()),
            artifacts: Artifacts::default(),
            repaired: false,
        }
    }

    /// Failed with a real error message; authorization rejections are final.
    pub fn is_repairable(&self) -> bool {
        match (&self.ok, &self.error) {
            (false, Some(error)) => !error.trim().is_empty() && error != UNAUTHORIZED,
            _ => false,
        }
    }

    /// One scratchpad line, e.g. ``- ok `create_note` created note_1``.
    pub fn outcome_line(&self) -> String {
        let tag = if self.repaired { " (repaired)" } else { "" };
        if !self.ok {
            let error = self.error.as_deref().unwrap_or("failed");
            return format!("- failed `{}`{tag}: {error}", self.name);
        }
        let mut line = format!("- ok `{}`{tag}", self.name);
        for (label, ids) in [
            ("created", &self.artifacts.created),
            ("updated", &self.artifacts.updated),
            ("unlinked", &self.artifacts.unlinked_documents),
        ] {
            if !ids.is_empty() {
                line.push_str(&format!(" {label} {}", ids.join(", ")));
            }
        }
        line
    }

    pub fn call(&self) -> ToolCall {
        ToolCall {
            name: self.name.clone(),
            args: self.args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let err = ToolOp::parse(&call("delete_everything", json!({}))).unwrap_err();
        assert_eq!(err, ToolCallError::Unsupported);
        assert_eq!(err.to_string(), UNSUPPORTED);
    }

    #[test]
    fn limits_are_coerced_and_clamped() {
        let parse_limit = |args: Value| match ToolOp::parse(&call("list_notes", args)) {
            Ok(ToolOp::ListNotes { limit, .. }) => limit,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(parse_limit(json!({})), DEFAULT_LIST_LIMIT);
        assert_eq!(parse_limit(json!({"limit": "7"})), 7);
        assert_eq!(parse_limit(json!({"limit": 0})), 1);
        assert_eq!(parse_limit(json!({"limit": 500})), MAX_LIST_LIMIT);
        assert_eq!(parse_limit(json!({"limit": -3})), DEFAULT_LIST_LIMIT);
    }

    #[test]
    fn required_args_are_enforced() {
        let err = ToolOp::parse(&call("create_note", json!({"title": "  "}))).unwrap_err();
        assert_eq!(err, ToolCallError::MissingArg("title"));

        let err = ToolOp::parse(&call("update_task", json!({"id": 12, "status": "someday"})))
            .unwrap_err();
        assert!(matches!(err, ToolCallError::InvalidArg { field: "status", .. }));
    }

    #[test]
    fn create_task_accepts_description_alias() {
        let op = ToolOp::parse(&call(
            "create_task",
            json!({"title": "Read ch. 3", "description": "pages 40-60", "status": "in progress"}),
        ))
        .expect("parse");
        assert_eq!(
            op,
            ToolOp::CreateTask {
                project_id: None,
                title: "Read ch. 3".to_string(),
                body: "pages 40-60".to_string(),
                status: TaskStatus::InProgress,
            }
        );
    }

    #[test]
    fn from_value_decodes_string_arguments() {
        let parsed = ToolCall::parse_list(&json!([
            {"name": "get_note", "arguments": "{\"id\": \"note_1\"}"},
            {"name": ""},
            {"args": {}},
        ]));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].args["id"], "note_1");
    }

    #[test]
    fn authorization_rejections_are_not_repairable() {
        let c = call("get_note", json!({"id": "x"}));
        assert!(!ToolResult::failure(&c, UNAUTHORIZED).is_repairable());
        assert!(ToolResult::failure(&c, "note not found").is_repairable());
        assert!(!ToolResult::success(&c, json!({}), Artifacts::default()).is_repairable());
    }

    #[test]
    fn outcome_lines_name_ids_and_errors() {
        let c = call("create_note", json!({"title": "x"}));
        let ok = ToolResult::success(
            &c,
            json!({}),
            Artifacts {
                created: vec!["note_1".to_string()],
                unlinked_documents: vec!["note_1".to_string()],
                ..Artifacts::default()
            },
        );
        assert_eq!(
            ok.outcome_line(),
            "- ok `create_note` created note_1 unlinked note_1"
        );
        let mut failed = ToolResult::failure(&c, "boom");
        failed.repaired = true;
        assert_eq!(failed.outcome_line(), "- failed `create_note` (repaired): boom");
    }
}
