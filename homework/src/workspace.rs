//! Workspace provisioning: the actor, container and documents a run writes to.
//!
//! Everything is found by run id stored in entity props, never by name, so
//! provisioning is idempotent across redeliveries and renames. Documents are
//! append-mostly: a new section is concatenated and the whole body rewritten.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::core::entity::{
    Entity, EntityKind, EntityPatch, EntityQuery, MembershipRole, NewEntity, NewProject, props,
};
use crate::core::types::{Run, WorkspaceRefs};
use crate::io::store::Datastore;

/// Prop carrying the owning run id on projects and documents.
pub const RUN_ID_PROP: &str = "homework_run_id";
/// Prop naming what a project or document is for.
pub const ROLE_PROP: &str = "homework_role";
/// Prop carrying the executor branch id on executor scratchpads.
pub const BRANCH_PROP: &str = "homework_branch_id";
/// Edge relation from a parent document to a child document.
pub const CONTAINS: &str = "contains";

pub const ROLE_WORKSPACE: &str = "workspace";
pub const ROLE_WORKSPACE_ROOT: &str = "workspace_root";
pub const ROLE_SCRATCHPAD: &str = "scratchpad";
pub const ROLE_EXECUTOR_SCRATCHPAD: &str = "executor_scratchpad";

#[derive(Clone)]
pub struct WorkspaceProvisioner {
    store: Arc<dyn Datastore>,
}

impl WorkspaceProvisioner {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    /// Find or create the actor, container, root document and scratchpad for `run`.
    ///
    /// Any failure is returned to the caller; a run cannot proceed without its workspace.
    #[instrument(skip_all, fields(run_id = %run.id))]
    pub async fn ensure(&self, run: &Run) -> Result<WorkspaceRefs> {
        let actor = match self.store.find_actor(&run.user_id).await? {
            Some(actor) => actor,
            None => self
                .store
                .create_actor(&run.user_id)
                .await
                .context("create actor")?,
        };

        let project = match self.store.find_project(RUN_ID_PROP, &run.id).await? {
            Some(project) => project,
            None => {
                let project = self
                    .store
                    .create_project(NewProject {
                        name: format!("Homework: {}", headline(&run.objective)),
                        props: props([(RUN_ID_PROP, run.id.as_str()), (ROLE_PROP, ROLE_WORKSPACE)]),
                    })
                    .await
                    .context("create workspace project")?;
                info!(project_id = %project.id, "workspace project created");
                project
            }
        };

        if self
            .store
            .find_membership(&project.id, &actor.id)
            .await?
            .is_none()
        {
            self.store
                .add_membership(&project.id, &actor.id, MembershipRole::Owner)
                .await
                .context("grant workspace membership")?;
        }

        let root = self
            .find_or_create_document(
                &project.id,
                &run.id,
                ROLE_WORKSPACE_ROOT,
                None,
                format!("Homework workspace: {}", headline(&run.objective)),
                format!("# Objective\n\n{}\n", run.objective.trim()),
            )
            .await?;
        let scratchpad = self
            .find_or_create_document(
                &project.id,
                &run.id,
                ROLE_SCRATCHPAD,
                None,
                "Homework scratchpad".to_string(),
                "# Scratchpad\n".to_string(),
            )
            .await?;
        self.store
            .link(&root.id, &scratchpad.id, CONTAINS)
            .await
            .context("link scratchpad under workspace root")?;

        Ok(WorkspaceRefs {
            actor_id: actor.id,
            container_id: project.id,
            root_document_id: root.id,
            scratchpad_document_id: scratchpad.id,
        })
    }

    /// Find or create the scratchpad for one executor branch, linked under the main scratchpad.
    pub async fn ensure_executor_scratchpad(
        &self,
        refs: &WorkspaceRefs,
        run_id: &str,
        branch_id: &str,
        title: &str,
    ) -> Result<Entity> {
        let doc = self
            .find_or_create_document(
                &refs.container_id,
                run_id,
                ROLE_EXECUTOR_SCRATCHPAD,
                Some(branch_id),
                format!("Executor scratchpad: {}", headline(title)),
                format!("# {}\n", title.trim()),
            )
            .await?;
        self.store
            .link(&refs.scratchpad_document_id, &doc.id, CONTAINS)
            .await
            .with_context(|| format!("link executor scratchpad {branch_id}"))?;
        Ok(doc)
    }

    /// Most recently touched executor scratchpads of a run.
    pub async fn recent_executor_scratchpads(
        &self,
        refs: &WorkspaceRefs,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        self.store
            .find_entities(
                &EntityQuery::new(EntityKind::Note)
                    .in_project(&refs.container_id)
                    .with_prop(RUN_ID_PROP, run_id)
                    .with_prop(ROLE_PROP, ROLE_EXECUTOR_SCRATCHPAD)
                    .limit(limit),
            )
            .await
    }

    pub async fn read_document(&self, document_id: &str) -> Result<String> {
        let doc = self
            .store
            .get_entity(document_id)
            .await?
            .ok_or_else(|| anyhow!("document {document_id} not found"))?;
        Ok(doc.body)
    }

    /// Append a timestamped `## heading` section to a document.
    pub async fn append_section(&self, document_id: &str, heading: &str, body: &str) -> Result<()> {
        let current = self.read_document(document_id).await?;
        let mut next = current.trim_end().to_string();
        if !next.is_empty() {
            next.push_str("\n\n");
        }
        next.push_str(&format!(
            "## {} ({})\n\n{}\n",
            heading.trim(),
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            body.trim_end()
        ));
        self.store
            .update_entity(
                document_id,
                EntityPatch {
                    body: Some(next),
                    ..EntityPatch::default()
                },
            )
            .await
            .with_context(|| format!("append to document {document_id}"))?;
        debug!(document_id, heading, "section appended");
        Ok(())
    }

    async fn find_or_create_document(
        &self,
        project_id: &str,
        run_id: &str,
        role: &str,
        branch_id: Option<&str>,
        title: String,
        body: String,
    ) -> Result<Entity> {
        let mut query = EntityQuery::new(EntityKind::Note)
            .in_project(project_id)
            .with_prop(RUN_ID_PROP, run_id)
            .with_prop(ROLE_PROP, role)
            .limit(1);
        if let Some(branch_id) = branch_id {
            query = query.with_prop(BRANCH_PROP, branch_id);
        }
        if let Some(existing) = self.store.find_entities(&query).await?.into_iter().next() {
            return Ok(existing);
        }

        let mut doc_props = props([(RUN_ID_PROP, run_id), (ROLE_PROP, role)]);
        if let Some(branch_id) = branch_id {
            doc_props.insert(BRANCH_PROP.to_string(), branch_id.into());
        }
        let doc = self
            .store
            .create_entity(NewEntity {
                kind: EntityKind::Note,
                project_id: project_id.to_string(),
                title,
                body,
                status: None,
                props: doc_props,
            })
            .await
            .with_context(|| format!("create {role} document"))?;
        info!(document_id = %doc.id, role, "document created");
        Ok(doc)
    }
}

/// First line of `text`, cut to 60 characters.
fn headline(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    match line.char_indices().nth(60) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}
