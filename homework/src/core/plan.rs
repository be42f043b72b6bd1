//! Plan steps and their identity across iterations.
//!
//! A step keeps its id for the whole run; progress shows up as status changes
//! on the same id rather than as new steps. The planner does not always echo
//! ids back, so ids are recovered from the previous plan by title before any
//! new id is minted.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    #[default]
    Pending,
    Doing,
    Blocked,
    Done,
}

impl PlanStepStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "todo" => Some(Self::Pending),
            "doing" | "in_progress" | "in-progress" => Some(Self::Doing),
            "blocked" => Some(Self::Blocked),
            "done" | "complete" | "completed" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepOwner {
    #[default]
    Planner,
    Executor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub status: PlanStepStatus,
    pub owner: PlanStepOwner,
    /// Iteration that last reported this step, for staleness tracking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

/// A step as the planner returned it, before ids are settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftStep {
    pub id: Option<String>,
    pub title: String,
    pub status: PlanStepStatus,
    pub owner: PlanStepOwner,
}

/// Parse planner plan output leniently.
///
/// Accepts `{"steps": [...]}` or a bare array. Entries without a usable title
/// are dropped; unknown status/owner values fall back to `pending`/`planner`.
pub fn parse_steps(raw: &Value) -> Vec<DraftStep> {
    let items = match raw {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("steps") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let title = obj.get("title")?.as_str()?.trim();
            if title.is_empty() {
                return None;
            }
            let id = obj
                .get("id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            let status = obj
                .get("status")
                .and_then(Value::as_str)
                .and_then(PlanStepStatus::parse)
                .unwrap_or_default();
            let owner = match obj.get("owner").and_then(Value::as_str) {
                Some(owner) if owner.trim().eq_ignore_ascii_case("executor") => {
                    PlanStepOwner::Executor
                }
                _ => PlanStepOwner::Planner,
            };
            Some(DraftStep {
                id,
                title: title.to_string(),
                status,
                owner,
            })
        })
        .collect()
}

/// Build the plan snapshot recorded for `iteration`.
///
/// The planner's own steps win; when it returned none, one pending step is
/// synthesized per `remaining_work` entry. Either way ids are carried forward
/// from `previous` and every step is stamped with `iteration`.
pub fn build_snapshot(
    drafts: Vec<DraftStep>,
    remaining_work: &[String],
    previous: &[PlanStep],
    iteration: u32,
) -> Vec<PlanStep> {
    let drafts = if drafts.is_empty() {
        remaining_work
            .iter()
            .map(|work| work.trim())
            .filter(|work| !work.is_empty())
            .map(|work| DraftStep {
                id: None,
                title: work.to_string(),
                status: PlanStepStatus::Pending,
                owner: PlanStepOwner::Planner,
            })
            .collect()
    } else {
        drafts
    };

    let mut ids = IdAllocator::new(previous);
    drafts
        .into_iter()
        .map(|draft| {
            let id = ids.settle(draft.id.as_deref(), &draft.title);
            PlanStep {
                id,
                title: draft.title,
                status: draft.status,
                owner: draft.owner,
                iteration: Some(iteration),
            }
        })
        .collect()
}

struct IdAllocator<'a> {
    previous: &'a [PlanStep],
    used: HashSet<String>,
    next: usize,
}

impl<'a> IdAllocator<'a> {
    fn new(previous: &'a [PlanStep]) -> Self {
        Self {
            previous,
            used: HashSet::new(),
            next: 1,
        }
    }

    fn settle(&mut self, proposed: Option<&str>, title: &str) -> String {
        let by_title = self
            .previous
            .iter()
            .find(|step| step.title.trim().eq_ignore_ascii_case(title.trim()))
            .map(|step| step.id.as_str());

        let candidate = match (proposed, by_title) {
            // A known id is authoritative even if the title was reworded.
            (Some(id), _) if self.previous.iter().any(|step| step.id == id) => Some(id),
            (_, Some(id)) => Some(id),
            (Some(id), None) => Some(id),
            (None, None) => None,
        };

        if let Some(id) = candidate
            && self.used.insert(id.to_string())
        {
            return id.to_string();
        }
        self.mint()
    }

    fn mint(&mut self) -> String {
        loop {
            let id = format!("step-{}", self.next);
            self.next += 1;
            let taken_before = self.previous.iter().any(|step| step.id == id);
            if !taken_before && self.used.insert(id.clone()) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, title: &str, status: PlanStepStatus) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            title: title.to_string(),
            status,
            owner: PlanStepOwner::Planner,
            iteration: Some(1),
        }
    }

    #[test]
    fn parse_steps_is_lenient() {
        let drafts = parse_steps(&json!({
            "steps": [
                {"id": "a", "title": "Collect notes", "status": "DOING", "owner": "executor"},
                {"title": "  Summarize  ", "status": "weird"},
                {"id": "b"},
                "not an object",
            ]
        }));

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].id.as_deref(), Some("a"));
        assert_eq!(drafts[0].status, PlanStepStatus::Doing);
        assert_eq!(drafts[0].owner, PlanStepOwner::Executor);
        assert_eq!(drafts[1].id, None);
        assert_eq!(drafts[1].title, "Summarize");
        assert_eq!(drafts[1].status, PlanStepStatus::Pending);
        assert_eq!(drafts[1].owner, PlanStepOwner::Planner);
    }

    #[test]
    fn synthesizes_steps_from_remaining_work() {
        let snapshot = build_snapshot(
            Vec::new(),
            &["Draft outline".to_string(), " ".to_string(), "Review".to_string()],
            &[],
            3,
        );

        let ids: Vec<_> = snapshot.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["step-1", "step-2"]);
        assert!(snapshot.iter().all(|s| s.iteration == Some(3)));
        assert!(snapshot.iter().all(|s| s.status == PlanStepStatus::Pending));
    }

    /// Steps that appear again keep their id; only status moves.
    #[test]
    fn ids_survive_across_iterations() {
        let previous = vec![
            step("step-1", "Draft outline", PlanStepStatus::Pending),
            step("step-2", "Review", PlanStepStatus::Pending),
        ];
        let drafts = parse_steps(&json!([
            {"title": "draft OUTLINE", "status": "done"},
            {"id": "new-id", "title": "Review", "status": "doing"},
            {"title": "Publish"},
        ]));

        let snapshot = build_snapshot(drafts, &[], &previous, 2);

        assert_eq!(snapshot[0].id, "step-1");
        assert_eq!(snapshot[0].status, PlanStepStatus::Done);
        assert_eq!(snapshot[1].id, "step-2");
        assert_eq!(snapshot[1].status, PlanStepStatus::Doing);
        assert_eq!(snapshot[2].id, "step-3");
        assert!(snapshot.iter().all(|s| s.iteration == Some(2)));
    }

    #[test]
    fn known_id_wins_over_reworded_title() {
        let previous = vec![step("outline", "Draft outline", PlanStepStatus::Doing)];
        let drafts = parse_steps(&json!([
            {"id": "outline", "title": "Draft the chapter outline", "status": "done"},
        ]));

        let snapshot = build_snapshot(drafts, &[], &previous, 2);
        assert_eq!(snapshot[0].id, "outline");
        assert_eq!(snapshot[0].title, "Draft the chapter outline");
    }

    #[test]
    fn duplicate_ids_within_one_plan_are_reminted() {
        let drafts = parse_steps(&json!([
            {"id": "x", "title": "One"},
            {"id": "x", "title": "Two"},
        ]));

        let snapshot = build_snapshot(drafts, &[], &[], 1);
        assert_eq!(snapshot[0].id, "x");
        assert_eq!(snapshot[1].id, "step-1");
    }
}
