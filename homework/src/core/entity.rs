//! Datastore records the engine reads and writes on behalf of a run.
//!
//! Notes and tasks share one record shape ([`Entity`]) distinguished by
//! [`EntityKind`]; `props` carries free-form ownership metadata such as the
//! run id and document role.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Note,
    Task,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Note => "note",
            EntityKind::Task => "task",
        }
    }

    /// Prefix used when minting ids, so an id alone tells the kind.
    pub fn id_prefix(self) -> &'static str {
        match self {
            EntityKind::Note => "note_",
            EntityKind::Task => "task_",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Blocked,
    Done,
}

impl TaskStatus {
    /// Lenient parse for model-produced values ("In Progress", "in-progress", "doing").
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "todo" | "open" | "pending" => Some(TaskStatus::Todo),
            "in_progress" | "doing" | "started" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "done" | "complete" | "completed" => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

/// A structured note (document) or an actionable item (task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub project_id: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub props: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub kind: EntityKind,
    pub project_id: String,
    pub title: String,
    pub body: String,
    pub status: Option<TaskStatus>,
    pub props: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub status: Option<TaskStatus>,
}

impl EntityPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.status.is_none()
    }
}

/// Filter for [`crate::io::store::Datastore::find_entities`].
///
/// Results are ordered most recently updated first.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityQuery {
    pub kind: EntityKind,
    /// Empty means any project.
    pub project_ids: Vec<String>,
    /// Every pair must match a string-valued prop exactly.
    pub props: Vec<(String, String)>,
    /// Case-insensitive substring over title and body.
    pub text: Option<String>,
    pub status: Option<TaskStatus>,
    pub limit: usize,
}

impl EntityQuery {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            project_ids: Vec::new(),
            props: Vec::new(),
            text: None,
            status: None,
            limit: usize::MAX,
        }
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_ids.push(project_id.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.push((key.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        if !entity.is_live() || entity.kind != self.kind {
            return false;
        }
        if !self.project_ids.is_empty() && !self.project_ids.contains(&entity.project_id) {
            return false;
        }
        if self
            .props
            .iter()
            .any(|(key, value)| entity.prop_str(key) != Some(value.as_str()))
        {
            return false;
        }
        if let Some(status) = self.status
            && entity.status != Some(status)
        {
            return false;
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            return entity.title.to_lowercase().contains(&needle)
                || entity.body.to_lowercase().contains(&needle);
        }
        true
    }
}

/// The identity the engine acts as, one per submitting user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// A container of notes and tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewProject {
    pub name: String,
    pub props: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub project_id: String,
    pub member_id: String,
    pub role: MembershipRole,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Directed relationship edge, e.g. a parent document containing a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_id: String,
    pub to_id: String,
    pub relation: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Build a string-valued props map from pairs.
pub fn props<const N: usize>(pairs: [(&str, &str); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(title: &str, body: &str) -> Entity {
        let now = Utc::now();
        Entity {
            id: "note_1".to_string(),
            kind: EntityKind::Note,
            project_id: "proj-1".to_string(),
            title: title.to_string(),
            body: body.to_string(),
            status: None,
            props: props([("homework_run_id", "run-1"), ("role", "scratchpad")]),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn task_status_parses_model_spellings() {
        assert_eq!(
            TaskStatus::parse_loose("In Progress"),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(
            TaskStatus::parse_loose("in-progress"),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(TaskStatus::parse_loose("DONE"), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::parse_loose("later"), None);
    }

    #[test]
    fn query_matches_props_text_and_liveness() {
        let entity = note("Scratchpad", "Iteration log");
        let query = EntityQuery::new(EntityKind::Note)
            .in_project("proj-1")
            .with_prop("role", "scratchpad");
        assert!(query.matches(&entity));

        let wrong_role = EntityQuery::new(EntityKind::Note).with_prop("role", "workspace_root");
        assert!(!wrong_role.matches(&entity));

        let mut text = EntityQuery::new(EntityKind::Note);
        text.text = Some("ITERATION".to_string());
        assert!(text.matches(&entity));

        let mut deleted = entity.clone();
        deleted.deleted_at = Some(Utc::now());
        assert!(!query.matches(&deleted));

        assert!(!EntityQuery::new(EntityKind::Task).matches(&entity));
    }
}
