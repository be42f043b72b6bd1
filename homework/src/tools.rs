//! Tool dispatch: authorization-scoped execution of model-issued calls.
//!
//! Every call resolves to a [`ToolOp`] and runs against the datastore. Failures
//! of any kind become `ok: false` results; nothing raised here aborts a batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::artifacts::Artifacts;
use crate::core::entity::{Entity, EntityKind, EntityPatch, EntityQuery, NewEntity, TaskStatus};
use crate::core::tools::{ToolCall, ToolOp, ToolResult, UNAUTHORIZED};
use crate::core::types::{Run, RunScope, WorkspaceRefs};
use crate::io::store::Datastore;
use crate::workspace::CONTAINS;

/// A call targeted a project outside the run's authorization scope.
#[derive(Debug, Error)]
#[error("unauthorized project")]
pub struct Unauthorized;

/// Projects a run may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzScope {
    workspace_project_id: String,
    allowed: BTreeSet<String>,
}

impl AuthzScope {
    /// The workspace, the run's allowlist and, for run-wide runs, every project
    /// the actor holds a membership in.
    pub async fn resolve(store: &dyn Datastore, run: &Run, refs: &WorkspaceRefs) -> Result<Self> {
        let mut allowed: BTreeSet<String> = run.project_ids.iter().cloned().collect();
        allowed.insert(refs.container_id.clone());
        if run.scope == RunScope::RunWide {
            for membership in store.list_memberships(&refs.actor_id).await? {
                allowed.insert(membership.project_id);
            }
        }
        Ok(Self {
            workspace_project_id: refs.container_id.clone(),
            allowed,
        })
    }

    pub fn allows(&self, project_id: &str) -> bool {
        self.allowed.contains(project_id)
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.allowed.iter().cloned().collect()
    }

    /// The project a call targets: the requested one if allowed, else the workspace.
    fn target(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            None => Ok(self.workspace_project_id.clone()),
            Some(project_id) if self.allows(project_id) => Ok(project_id.to_string()),
            Some(_) => Err(Unauthorized.into()),
        }
    }

    fn listed(&self, requested: Option<&str>) -> Result<Vec<String>> {
        match requested {
            None => Ok(self.project_ids()),
            Some(project_id) => self.target(Some(project_id)).map(|id| vec![id]),
        }
    }
}

#[derive(Clone)]
pub struct ToolDispatcher {
    store: Arc<dyn Datastore>,
    scope: AuthzScope,
    workspace: WorkspaceRefs,
}

impl ToolDispatcher {
    pub fn new(store: Arc<dyn Datastore>, scope: AuthzScope, workspace: WorkspaceRefs) -> Self {
        Self {
            store,
            scope,
            workspace,
        }
    }

    pub fn scope(&self) -> &AuthzScope {
        &self.scope
    }

    /// Run calls in order; anything past `cap` is dropped.
    pub async fn execute_batch(&self, calls: &[ToolCall], cap: usize) -> Vec<ToolResult> {
        if calls.len() > cap {
            debug!(requested = calls.len(), cap, "dropping tool calls over cap");
        }
        let mut results = Vec::with_capacity(calls.len().min(cap));
        for call in calls.iter().take(cap) {
            results.push(self.execute(call).await);
        }
        results
    }

    #[instrument(skip_all, fields(tool = %call.name))]
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let op = match ToolOp::parse(call) {
            Ok(op) => op,
            Err(err) => {
                warn!(error = %err, "tool call rejected");
                return ToolResult::failure(call, err.to_string());
            }
        };
        match self.run_op(op).await {
            Ok((result, artifacts)) => ToolResult::success(call, result, artifacts),
            Err(err) => {
                let message = if err.is::<Unauthorized>() {
                    UNAUTHORIZED.to_string()
                } else {
                    format!("{err:#}")
                };
                warn!(error = %message, "tool call failed");
                ToolResult::failure(call, message)
            }
        }
    }

    async fn run_op(&self, op: ToolOp) -> Result<(Value, Artifacts)> {
        match op {
            ToolOp::ListNotes { project_id, limit } => {
                self.list(EntityKind::Note, project_id.as_deref(), None, None, limit)
                    .await
            }
            ToolOp::SearchNotes {
                query,
                project_id,
                limit,
            } => {
                self.list(EntityKind::Note, project_id.as_deref(), Some(query), None, limit)
                    .await
            }
            ToolOp::ListTasks {
                project_id,
                status,
                limit,
            } => {
                self.list(EntityKind::Task, project_id.as_deref(), None, status, limit)
                    .await
            }
            ToolOp::SearchTasks {
                query,
                project_id,
                limit,
            } => {
                self.list(EntityKind::Task, project_id.as_deref(), Some(query), None, limit)
                    .await
            }
            ToolOp::GetNote { id } => self.get(EntityKind::Note, &id).await,
            ToolOp::GetTask { id } => self.get(EntityKind::Task, &id).await,
            ToolOp::CreateNote {
                project_id,
                title,
                body,
                parent_id,
            } => {
                self.create_note(project_id.as_deref(), title, body, parent_id.as_deref())
                    .await
            }
            ToolOp::CreateTask {
                project_id,
                title,
                body,
                status,
            } => {
                let project_id = self.scope.target(project_id.as_deref())?;
                let task = self
                    .store
                    .create_entity(NewEntity {
                        kind: EntityKind::Task,
                        project_id,
                        title,
                        body,
                        status: Some(status),
                        props: Default::default(),
                    })
                    .await?;
                let artifacts = Artifacts {
                    created: vec![task.id.clone()],
                    ..Artifacts::default()
                };
                Ok((entity_json(&task), artifacts))
            }
            ToolOp::UpdateNote { id, title, body } => {
                self.update(
                    EntityKind::Note,
                    &id,
                    EntityPatch {
                        title,
                        body,
                        status: None,
                    },
                )
                .await
            }
            ToolOp::UpdateTask {
                id,
                title,
                body,
                status,
            } => {
                self.update(EntityKind::Task, &id, EntityPatch { title, body, status })
                    .await
            }
        }
    }

    async fn list(
        &self,
        kind: EntityKind,
        project_id: Option<&str>,
        text: Option<String>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<(Value, Artifacts)> {
        let query = EntityQuery {
            kind,
            project_ids: self.scope.listed(project_id)?,
            props: Vec::new(),
            text,
            status,
            limit,
        };
        let items: Vec<Value> = self
            .store
            .find_entities(&query)
            .await?
            .iter()
            .map(summary_json)
            .collect();
        Ok((json!({ "count": items.len(), "items": items }), Artifacts::default()))
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<(Value, Artifacts)> {
        let entity = self.authorized_entity(kind, id).await?;
        Ok((entity_json(&entity), Artifacts::default()))
    }

    async fn update(&self, kind: EntityKind, id: &str, patch: EntityPatch) -> Result<(Value, Artifacts)> {
        if patch.is_empty() {
            return Err(anyhow!("nothing to update"));
        }
        self.authorized_entity(kind, id).await?;
        let entity = self.store.update_entity(id, patch).await?;
        let artifacts = Artifacts {
            updated: vec![entity.id.clone()],
            ..Artifacts::default()
        };
        Ok((entity_json(&entity), artifacts))
    }

    /// Create a note and link it under its parent.
    ///
    /// Without `parent_id`, notes in the workspace go under the workspace root
    /// document. A parent that cannot be resolved, or a link that fails, leaves
    /// the note unlinked; the call still succeeds once the note exists.
    async fn create_note(
        &self,
        project_id: Option<&str>,
        title: String,
        body: String,
        parent_id: Option<&str>,
    ) -> Result<(Value, Artifacts)> {
        let project_id = self.scope.target(project_id)?;
        let parent = match parent_id {
            Some(parent_id) => self.resolve_parent(parent_id).await,
            None if project_id == self.workspace.container_id => {
                Some(self.workspace.root_document_id.clone())
            }
            None => None,
        };
        let note = self
            .store
            .create_entity(NewEntity {
                kind: EntityKind::Note,
                project_id,
                title,
                body,
                status: None,
                props: Default::default(),
            })
            .await?;

        let mut artifacts = Artifacts {
            created: vec![note.id.clone()],
            ..Artifacts::default()
        };
        let mut result = entity_json(&note);
        match parent {
            Some(parent) => match self.store.link(&parent, &note.id, CONTAINS).await {
                Ok(_) => {
                    artifacts.linked.push(note.id.clone());
                    result["parent_id"] = Value::String(parent);
                }
                Err(err) => {
                    warn!(
                        note_id = %note.id,
                        parent_id = %parent,
                        error = %err,
                        "linking note failed"
                    );
                    artifacts.unlinked_documents.push(note.id.clone());
                    result["unlinked"] = Value::Bool(true);
                }
            },
            None => {
                debug!(note_id = %note.id, "note created without a parent");
                artifacts.unlinked_documents.push(note.id.clone());
                result["unlinked"] = Value::Bool(true);
            }
        }
        Ok((result, artifacts))
    }

    async fn resolve_parent(&self, parent_id: &str) -> Option<String> {
        match self.store.get_entity(parent_id).await {
            Ok(Some(parent)) if parent.kind == EntityKind::Note && self.scope.allows(&parent.project_id) => {
                Some(parent.id)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(parent_id, error = %err, "parent lookup failed");
                None
            }
        }
    }

    async fn authorized_entity(&self, kind: EntityKind, id: &str) -> Result<Entity> {
        let entity = self
            .store
            .get_entity(id)
            .await?
            .filter(|entity| entity.kind == kind)
            .ok_or_else(|| anyhow!("{} {id} not found", kind.as_str()))?;
        if !self.scope.allows(&entity.project_id) {
            return Err(Unauthorized.into());
        }
        Ok(entity)
    }
}

fn summary_json(entity: &Entity) -> Value {
    let mut value = json!({
        "id": entity.id,
        "project_id": entity.project_id,
        "title": entity.title,
        "updated_at": entity.updated_at,
    });
    if let Some(status) = entity.status {
        value["status"] = json!(status);
    }
    value
}

fn entity_json(entity: &Entity) -> Value {
    let mut value = summary_json(entity);
    value["body"] = Value::String(entity.body.clone());
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::{
        Actor, Edge, Membership, MembershipRole, NewProject, Project, props,
    };
    use crate::core::types::{FinishedIteration, Iteration, RunEvent, RunEventKind, RunPatch};
    use crate::core::tools::UNSUPPORTED;
    use crate::io::store::FileStore;
    use crate::test_support::sample_run;
    use crate::workspace::WorkspaceProvisioner;

    struct Fixture {
        _temp: tempfile::TempDir,
        store: Arc<FileStore>,
        refs: WorkspaceRefs,
        dispatcher: ToolDispatcher,
    }

    async fn fixture(scope: RunScope) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileStore::open(temp.path().join("store.json")));
        let mut run = sample_run("run-1");
        run.scope = scope;
        let refs = WorkspaceProvisioner::new(store.clone())
            .ensure(&run)
            .await
            .expect("workspace");
        let scope = AuthzScope::resolve(store.as_ref(), &run, &refs)
            .await
            .expect("scope");
        let dispatcher = ToolDispatcher::new(store.clone(), scope, refs.clone());
        Fixture {
            _temp: temp,
            store,
            refs,
            dispatcher,
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            args,
        }
    }

    async fn other_project(store: &FileStore) -> String {
        store
            .create_project(NewProject {
                name: "Elsewhere".to_string(),
                props: props([("kind", "personal")]),
            })
            .await
            .expect("project")
            .id
    }

    #[tokio::test]
    async fn create_note_defaults_under_workspace_root() {
        let fx = fixture(RunScope::RunWide).await;

        let result = fx
            .dispatcher
            .execute(&call("create_note", json!({"title": "Outline", "body": "1. Cells"})))
            .await;

        assert!(result.ok, "{result:?}");
        let id = result.artifacts.created[0].clone();
        assert_eq!(result.artifacts.linked, vec![id.clone()]);
        let links = fx
            .store
            .list_links(&fx.refs.root_document_id, CONTAINS)
            .await
            .expect("links");
        assert!(links.iter().any(|edge| edge.to_id == id));
    }

    /// Verifies an unresolvable parent leaves the note unlinked instead of failing.
    #[tokio::test]
    async fn unresolvable_parent_reports_unlinked_document() {
        let fx = fixture(RunScope::RunWide).await;

        let result = fx
            .dispatcher
            .execute(&call(
                "create_note",
                json!({"title": "Orphan", "parent_id": "note_missing"}),
            ))
            .await;

        assert!(result.ok);
        assert!(result.error.is_none());
        assert_eq!(result.artifacts.unlinked_documents, result.artifacts.created);
        assert!(result.artifacts.linked.is_empty());
    }

    /// A datastore whose `link` always fails.
    struct NoLinks(Arc<FileStore>);

    #[async_trait::async_trait]
    impl Datastore for NoLinks {
        async fn insert_run(&self, run: Run) -> Result<()> {
            self.0.insert_run(run).await
        }
        async fn get_run(&self, run_id: &str) -> Result<Run> {
            self.0.get_run(run_id).await
        }
        async fn update_run(&self, run_id: &str, patch: RunPatch) -> Result<Run> {
            self.0.update_run(run_id, patch).await
        }
        async fn insert_iteration(&self, iteration: Iteration) -> Result<()> {
            self.0.insert_iteration(iteration).await
        }
        async fn get_iteration(&self, run_id: &str, number: u32) -> Result<Option<Iteration>> {
            self.0.get_iteration(run_id, number).await
        }
        async fn finish_iteration(
            &self,
            run_id: &str,
            number: u32,
            finished: FinishedIteration,
        ) -> Result<Iteration> {
            self.0.finish_iteration(run_id, number, finished).await
        }
        async fn list_iterations(&self, run_id: &str) -> Result<Vec<Iteration>> {
            self.0.list_iterations(run_id).await
        }
        async fn append_event(
            &self,
            run_id: &str,
            iteration: u32,
            kind: RunEventKind,
        ) -> Result<RunEvent> {
            self.0.append_event(run_id, iteration, kind).await
        }
        async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
            self.0.list_events(run_id).await
        }
        async fn find_actor(&self, user_id: &str) -> Result<Option<Actor>> {
            self.0.find_actor(user_id).await
        }
        async fn create_actor(&self, user_id: &str) -> Result<Actor> {
            self.0.create_actor(user_id).await
        }
        async fn find_project(&self, key: &str, value: &str) -> Result<Option<Project>> {
            self.0.find_project(key, value).await
        }
        async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
            self.0.get_project(project_id).await
        }
        async fn create_project(&self, project: NewProject) -> Result<Project> {
            self.0.create_project(project).await
        }
        async fn find_membership(
            &self,
            project_id: &str,
            member_id: &str,
        ) -> Result<Option<Membership>> {
            self.0.find_membership(project_id, member_id).await
        }
        async fn add_membership(
            &self,
            project_id: &str,
            member_id: &str,
            role: MembershipRole,
        ) -> Result<Membership> {
            self.0.add_membership(project_id, member_id, role).await
        }
        async fn list_memberships(&self, member_id: &str) -> Result<Vec<Membership>> {
            self.0.list_memberships(member_id).await
        }
        async fn find_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
            self.0.find_entities(query).await
        }
        async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
            self.0.get_entity(id).await
        }
        async fn create_entity(&self, entity: NewEntity) -> Result<Entity> {
            self.0.create_entity(entity).await
        }
        async fn update_entity(&self, id: &str, patch: EntityPatch) -> Result<Entity> {
            self.0.update_entity(id, patch).await
        }
        async fn link(&self, _from_id: &str, _to_id: &str, _relation: &str) -> Result<Edge> {
            Err(anyhow!("edge table is read-only"))
        }
        async fn list_links(&self, from_id: &str, relation: &str) -> Result<Vec<Edge>> {
            self.0.list_links(from_id, relation).await
        }
    }

    /// Verifies a failed link still reports the created note as unlinked and
    /// leaves nothing for the repair pass to re-create.
    #[tokio::test]
    async fn failed_link_reports_unlinked_document() {
        let fx = fixture(RunScope::RunWide).await;
        let dispatcher = ToolDispatcher::new(
            Arc::new(NoLinks(fx.store.clone())),
            fx.dispatcher.scope().clone(),
            fx.refs.clone(),
        );

        let result = dispatcher
            .execute(&call("create_note", json!({"title": "Outline", "body": "1. Cells"})))
            .await;

        assert!(result.ok, "{result:?}");
        assert!(!result.is_repairable());
        assert_eq!(result.artifacts.created.len(), 1);
        assert_eq!(result.artifacts.unlinked_documents, result.artifacts.created);
        assert!(result.artifacts.linked.is_empty());
        let id = &result.artifacts.created[0];
        assert!(fx.store.get_entity(id).await.expect("get").is_some());
        let links = fx
            .store
            .list_links(&fx.refs.root_document_id, CONTAINS)
            .await
            .expect("links");
        assert!(links.iter().all(|edge| &edge.to_id != id));
    }

    #[tokio::test]
    async fn foreign_projects_are_unauthorized_without_raising() {
        let fx = fixture(RunScope::ProjectScoped).await;
        let foreign = other_project(&fx.store).await;

        let results = fx
            .dispatcher
            .execute_batch(
                &[
                    call("create_task", json!({"title": "x", "project_id": foreign})),
                    call("list_notes", json!({"project_id": foreign})),
                    call("create_task", json!({"title": "fine"})),
                ],
                8,
            )
            .await;

        assert_eq!(results[0].error.as_deref(), Some(UNAUTHORIZED));
        assert_eq!(results[1].error.as_deref(), Some(UNAUTHORIZED));
        assert!(!results[0].is_repairable());
        assert!(results[2].ok);
    }

    #[tokio::test]
    async fn run_wide_scope_includes_memberships() {
        let fx = fixture(RunScope::RunWide).await;
        let shared = other_project(&fx.store).await;
        fx.store
            .add_membership(&shared, &fx.refs.actor_id, MembershipRole::Member)
            .await
            .expect("membership");
        let run = sample_run("run-1");
        let scope = AuthzScope::resolve(fx.store.as_ref(), &run, &fx.refs)
            .await
            .expect("scope");

        assert!(scope.allows(&shared));
        let mut scoped = run.clone();
        scoped.scope = RunScope::ProjectScoped;
        let narrow = AuthzScope::resolve(fx.store.as_ref(), &scoped, &fx.refs)
            .await
            .expect("scope");
        assert!(!narrow.allows(&shared));
    }

    #[tokio::test]
    async fn failures_are_isolated_and_batches_capped() {
        let fx = fixture(RunScope::RunWide).await;
        let calls: Vec<ToolCall> = vec![
            call("delete_everything", json!({})),
            call("create_note", json!({"body": "no title"})),
            call("create_task", json!({"title": "Read chapter 3", "status": "in progress"})),
            call("list_tasks", json!({})),
            call("list_notes", json!({})),
        ];

        let results = fx.dispatcher.execute_batch(&calls, 4).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].error.as_deref(), Some(UNSUPPORTED));
        assert!(results[1].is_repairable());
        assert!(results[2].ok);
        assert_eq!(results[3].result.as_ref().expect("list")["count"], 1);
        assert_eq!(results[3].result.as_ref().expect("list")["items"][0]["status"], "in_progress");
    }

    #[tokio::test]
    async fn update_and_get_respect_kind() {
        let fx = fixture(RunScope::RunWide).await;
        let created = fx
            .dispatcher
            .execute(&call("create_task", json!({"title": "Draft"})))
            .await;
        let id = created.artifacts.created[0].clone();

        let wrong_kind = fx.dispatcher.execute(&call("get_note", json!({"id": id}))).await;
        let updated = fx
            .dispatcher
            .execute(&call("update_task", json!({"id": id, "status": "done"})))
            .await;
        let empty = fx.dispatcher.execute(&call("update_task", json!({"id": id}))).await;

        assert!(!wrong_kind.ok);
        assert!(wrong_kind.error.as_deref().expect("error").contains("not found"));
        assert!(updated.ok);
        assert_eq!(updated.artifacts.updated, vec![id]);
        assert_eq!(empty.error.as_deref(), Some("nothing to update"));
    }
}
