//! The planner's self-assessment, normalized from untrusted model output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextActionHint {
    #[default]
    Replan,
    Execute,
    AskUser,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBlock {
    pub exit_signal: bool,
    pub needs_user_input: bool,
    pub blocking_questions: Vec<String>,
    pub progress_summary: String,
    pub remaining_work: Vec<String>,
    pub completion_evidence: Vec<String>,
    pub next_action_hint: NextActionHint,
    pub confidence: Confidence,
}

impl StatusBlock {
    /// Coerce a raw status object into a well-formed block.
    ///
    /// Never fails: anything missing or mistyped takes its default.
    pub fn normalize(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::default();
        };

        let next_action_hint = match text(obj.get("next_action_hint")).as_deref() {
            Some("execute") => NextActionHint::Execute,
            Some("ask_user") => NextActionHint::AskUser,
            Some("stop") => NextActionHint::Stop,
            _ => NextActionHint::Replan,
        };
        let confidence = match text(obj.get("confidence")).as_deref() {
            Some("low") => Confidence::Low,
            Some("high") => Confidence::High,
            _ => Confidence::Medium,
        };

        Self {
            exit_signal: flag(obj.get("exit_signal")),
            needs_user_input: flag(obj.get("needs_user_input")),
            blocking_questions: strings(obj.get("blocking_questions")),
            progress_summary: obj
                .get("progress_summary")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            remaining_work: strings(obj.get("remaining_work")),
            completion_evidence: strings(obj.get("completion_evidence")),
            next_action_hint,
            confidence,
        }
    }
}

fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
}

/// Arrays keep their non-empty string items; a lone string becomes one item.
fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_take_safe_defaults() {
        let block = StatusBlock::normalize(&json!({}));
        assert_eq!(block, StatusBlock::default());
        assert_eq!(block.next_action_hint, NextActionHint::Replan);
        assert_eq!(block.confidence, Confidence::Medium);

        assert_eq!(StatusBlock::normalize(&json!("nope")), StatusBlock::default());
    }

    #[test]
    fn mistyped_fields_are_coerced() {
        let block = StatusBlock::normalize(&json!({
            "exit_signal": "true",
            "needs_user_input": 1,
            "blocking_questions": "Which course?",
            "remaining_work": ["a", 3, "", " b "],
            "completion_evidence": {"x": 1},
            "next_action_hint": "ASK_USER",
            "confidence": "certain",
        }));

        assert!(block.exit_signal);
        assert!(!block.needs_user_input);
        assert_eq!(block.blocking_questions, ["Which course?"]);
        assert_eq!(block.remaining_work, ["a", "b"]);
        assert!(block.completion_evidence.is_empty());
        assert_eq!(block.next_action_hint, NextActionHint::AskUser);
        assert_eq!(block.confidence, Confidence::Medium);
    }
}
