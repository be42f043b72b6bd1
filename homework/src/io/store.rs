//! Datastore seam and a JSON-file implementation.
//!
//! [`Datastore`] is everything the engine needs from persistent storage: run
//! and iteration rows, the event log, and the note/task/project records tool
//! calls operate on. [`FileStore`] keeps all of it in one JSON document and is
//! meant for a single worker process on one machine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::core::entity::{
    Actor, Edge, Entity, EntityPatch, EntityQuery, Membership, MembershipRole, NewEntity,
    NewProject, Project,
};
use crate::core::types::{FinishedIteration, Iteration, Run, RunEvent, RunEventKind, RunPatch};
use crate::io::state_file::{load_json_or_default, to_json_document, write_atomic_async};

/// An iteration row with the same `(run_id, number)` already exists.
#[derive(Debug, Error)]
#[error("iteration {iteration} of run {run_id} already exists")]
pub struct DuplicateIteration {
    pub run_id: String,
    pub iteration: u32,
}

#[derive(Debug, Error)]
#[error("run {run_id} not found")]
pub struct RunNotFound {
    pub run_id: String,
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn insert_run(&self, run: Run) -> Result<()>;
    /// Fails with [`RunNotFound`] for unknown ids.
    async fn get_run(&self, run_id: &str) -> Result<Run>;
    async fn update_run(&self, run_id: &str, patch: RunPatch) -> Result<Run>;

    /// Fails with [`DuplicateIteration`] if the row exists.
    async fn insert_iteration(&self, iteration: Iteration) -> Result<()>;
    async fn get_iteration(&self, run_id: &str, number: u32) -> Result<Option<Iteration>>;
    async fn finish_iteration(
        &self,
        run_id: &str,
        number: u32,
        finished: FinishedIteration,
    ) -> Result<Iteration>;
    async fn list_iterations(&self, run_id: &str) -> Result<Vec<Iteration>>;

    /// Append with the next sequence number within `(run_id, iteration)`.
    async fn append_event(
        &self,
        run_id: &str,
        iteration: u32,
        kind: RunEventKind,
    ) -> Result<RunEvent>;
    /// Ordered by `(iteration, sequence)`.
    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>>;

    async fn find_actor(&self, user_id: &str) -> Result<Option<Actor>>;
    async fn create_actor(&self, user_id: &str) -> Result<Actor>;

    /// First live project whose string prop `key` equals `value`.
    async fn find_project(&self, key: &str, value: &str) -> Result<Option<Project>>;
    async fn get_project(&self, project_id: &str) -> Result<Option<Project>>;
    async fn create_project(&self, project: NewProject) -> Result<Project>;

    async fn find_membership(
        &self,
        project_id: &str,
        member_id: &str,
    ) -> Result<Option<Membership>>;
    async fn add_membership(
        &self,
        project_id: &str,
        member_id: &str,
        role: MembershipRole,
    ) -> Result<Membership>;
    async fn list_memberships(&self, member_id: &str) -> Result<Vec<Membership>>;

    async fn find_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>>;
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;
    async fn create_entity(&self, entity: NewEntity) -> Result<Entity>;
    async fn update_entity(&self, id: &str, patch: EntityPatch) -> Result<Entity>;

    /// Idempotent: an existing live edge is returned unchanged.
    async fn link(&self, from_id: &str, to_id: &str, relation: &str) -> Result<Edge>;
    async fn list_links(&self, from_id: &str, relation: &str) -> Result<Vec<Edge>>;
}

/// Everything persisted by [`FileStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreState {
    runs: Vec<Run>,
    iterations: Vec<Iteration>,
    events: Vec<RunEvent>,
    actors: Vec<Actor>,
    projects: Vec<Project>,
    memberships: Vec<Membership>,
    entities: Vec<Entity>,
    edges: Vec<Edge>,
}

impl StoreState {
    fn run_mut(&mut self, run_id: &str) -> Result<&mut Run> {
        self.runs
            .iter_mut()
            .find(|run| run.id == run_id)
            .ok_or_else(|| {
                RunNotFound {
                    run_id: run_id.to_string(),
                }
                .into()
            })
    }

    fn live_entity_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities
            .iter_mut()
            .find(|entity| entity.id == id && entity.is_live())
    }
}

/// JSON-file datastore at `.homework/state/store.json`.
///
/// Every operation re-reads the file, so a CLI command and a worker see each
/// other's writes; mutations are written back atomically before returning.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<R: Send>(&self, f: impl FnOnce(&StoreState) -> R + Send) -> Result<R> {
        let _guard = self.lock.lock().await;
        let state: StoreState = load_json_or_default(&self.path)?;
        Ok(f(&state))
    }

    async fn mutate<R: Send>(&self, f: impl FnOnce(&mut StoreState) -> Result<R> + Send) -> Result<R> {
        let _guard = self.lock.lock().await;
        let mut state: StoreState = load_json_or_default(&self.path)?;
        let out = f(&mut state)?;
        let doc = to_json_document(&state)?;
        write_atomic_async(&self.path, doc)
            .await
            .with_context(|| format!("persist store {}", self.path.display()))?;
        Ok(out)
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

#[async_trait]
impl Datastore for FileStore {
    async fn insert_run(&self, run: Run) -> Result<()> {
        self.mutate(|state| {
            if state.runs.iter().any(|r| r.id == run.id) {
                return Err(anyhow!("run {} already exists", run.id));
            }
            state.runs.push(run);
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.read(|state| state.runs.iter().find(|r| r.id == run_id).cloned())
            .await?
            .ok_or_else(|| {
                RunNotFound {
                    run_id: run_id.to_string(),
                }
                .into()
            })
    }

    async fn update_run(&self, run_id: &str, patch: RunPatch) -> Result<Run> {
        self.mutate(|state| {
            let run = state.run_mut(run_id)?;
            patch.apply(run, Utc::now());
            Ok(run.clone())
        })
        .await
    }

    async fn insert_iteration(&self, iteration: Iteration) -> Result<()> {
        self.mutate(|state| {
            let exists = state
                .iterations
                .iter()
                .any(|it| it.run_id == iteration.run_id && it.number == iteration.number);
            if exists {
                return Err(DuplicateIteration {
                    run_id: iteration.run_id.clone(),
                    iteration: iteration.number,
                }
                .into());
            }
            state.iterations.push(iteration);
            Ok(())
        })
        .await
    }

    async fn get_iteration(&self, run_id: &str, number: u32) -> Result<Option<Iteration>> {
        self.read(|state| {
            state
                .iterations
                .iter()
                .find(|it| it.run_id == run_id && it.number == number)
                .cloned()
        })
        .await
    }

    async fn finish_iteration(
        &self,
        run_id: &str,
        number: u32,
        finished: FinishedIteration,
    ) -> Result<Iteration> {
        self.mutate(|state| {
            let row = state
                .iterations
                .iter_mut()
                .find(|it| it.run_id == run_id && it.number == number)
                .ok_or_else(|| anyhow!("iteration {number} of run {run_id} not found"))?;
            row.status = finished.status;
            row.summary = finished.summary;
            row.artifacts = finished.artifacts;
            row.tokens = finished.tokens;
            row.cost = finished.cost;
            row.ended_at = Some(Utc::now());
            Ok(row.clone())
        })
        .await
    }

    async fn list_iterations(&self, run_id: &str) -> Result<Vec<Iteration>> {
        self.read(|state| {
            let mut rows: Vec<_> = state
                .iterations
                .iter()
                .filter(|it| it.run_id == run_id)
                .cloned()
                .collect();
            rows.sort_by_key(|it| it.number);
            rows
        })
        .await
    }

    async fn append_event(
        &self,
        run_id: &str,
        iteration: u32,
        kind: RunEventKind,
    ) -> Result<RunEvent> {
        self.mutate(|state| {
            let sequence = state
                .events
                .iter()
                .filter(|e| e.run_id == run_id && e.iteration == iteration)
                .map(|e| e.sequence + 1)
                .max()
                .unwrap_or(0);
            let event = RunEvent {
                run_id: run_id.to_string(),
                iteration,
                sequence,
                at: Utc::now(),
                kind,
            };
            debug!(run_id, iteration, sequence, "append event");
            state.events.push(event.clone());
            Ok(event)
        })
        .await
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.read(|state| {
            let mut events: Vec<_> = state
                .events
                .iter()
                .filter(|e| e.run_id == run_id)
                .cloned()
                .collect();
            events.sort_by_key(|e| (e.iteration, e.sequence));
            events
        })
        .await
    }

    async fn find_actor(&self, user_id: &str) -> Result<Option<Actor>> {
        self.read(|state| state.actors.iter().find(|a| a.user_id == user_id).cloned())
            .await
    }

    async fn create_actor(&self, user_id: &str) -> Result<Actor> {
        self.mutate(|state| {
            let actor = Actor {
                id: new_id("actor_"),
                user_id: user_id.to_string(),
                created_at: Utc::now(),
            };
            state.actors.push(actor.clone());
            Ok(actor)
        })
        .await
    }

    async fn find_project(&self, key: &str, value: &str) -> Result<Option<Project>> {
        self.read(|state| {
            state
                .projects
                .iter()
                .filter(|p| p.deleted_at.is_none())
                .find(|p| p.props.get(key).and_then(|v| v.as_str()) == Some(value))
                .cloned()
        })
        .await
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        self.read(|state| {
            state
                .projects
                .iter()
                .find(|p| p.id == project_id && p.deleted_at.is_none())
                .cloned()
        })
        .await
    }

    async fn create_project(&self, project: NewProject) -> Result<Project> {
        self.mutate(|state| {
            let project = Project {
                id: new_id("proj_"),
                name: project.name,
                props: project.props,
                created_at: Utc::now(),
                deleted_at: None,
            };
            state.projects.push(project.clone());
            Ok(project)
        })
        .await
    }

    async fn find_membership(
        &self,
        project_id: &str,
        member_id: &str,
    ) -> Result<Option<Membership>> {
        self.read(|state| {
            state
                .memberships
                .iter()
                .find(|m| {
                    m.project_id == project_id && m.member_id == member_id && m.deleted_at.is_none()
                })
                .cloned()
        })
        .await
    }

    async fn add_membership(
        &self,
        project_id: &str,
        member_id: &str,
        role: MembershipRole,
    ) -> Result<Membership> {
        self.mutate(|state| {
            let membership = Membership {
                project_id: project_id.to_string(),
                member_id: member_id.to_string(),
                role,
                created_at: Utc::now(),
                deleted_at: None,
            };
            state.memberships.push(membership.clone());
            Ok(membership)
        })
        .await
    }

    async fn list_memberships(&self, member_id: &str) -> Result<Vec<Membership>> {
        self.read(|state| {
            state
                .memberships
                .iter()
                .filter(|m| m.member_id == member_id && m.deleted_at.is_none())
                .cloned()
                .collect()
        })
        .await
    }

    async fn find_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        self.read(|state| {
            let mut found: Vec<_> = state
                .entities
                .iter()
                .filter(|e| query.matches(e))
                .cloned()
                .collect();
            found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            found.truncate(query.limit);
            found
        })
        .await
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.read(|state| {
            state
                .entities
                .iter()
                .find(|e| e.id == id && e.is_live())
                .cloned()
        })
        .await
    }

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity> {
        self.mutate(|state| {
            let now = Utc::now();
            let entity = Entity {
                id: new_id(entity.kind.id_prefix()),
                kind: entity.kind,
                project_id: entity.project_id,
                title: entity.title,
                body: entity.body,
                status: entity.status,
                props: entity.props,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            state.entities.push(entity.clone());
            Ok(entity)
        })
        .await
    }

    async fn update_entity(&self, id: &str, patch: EntityPatch) -> Result<Entity> {
        self.mutate(|state| {
            let entity = state
                .live_entity_mut(id)
                .ok_or_else(|| anyhow!("entity {id} not found"))?;
            if let Some(title) = patch.title {
                entity.title = title;
            }
            if let Some(body) = patch.body {
                entity.body = body;
            }
            if let Some(status) = patch.status {
                entity.status = Some(status);
            }
            entity.updated_at = Utc::now();
            Ok(entity.clone())
        })
        .await
    }

    async fn link(&self, from_id: &str, to_id: &str, relation: &str) -> Result<Edge> {
        self.mutate(|state| {
            if let Some(edge) = state.edges.iter().find(|e| {
                e.from_id == from_id
                    && e.to_id == to_id
                    && e.relation == relation
                    && e.deleted_at.is_none()
            }) {
                return Ok(edge.clone());
            }
            let edge = Edge {
                from_id: from_id.to_string(),
                to_id: to_id.to_string(),
                relation: relation.to_string(),
                created_at: Utc::now(),
                deleted_at: None,
            };
            state.edges.push(edge.clone());
            Ok(edge)
        })
        .await
    }

    async fn list_links(&self, from_id: &str, relation: &str) -> Result<Vec<Edge>> {
        self.read(|state| {
            state
                .edges
                .iter()
                .filter(|e| e.from_id == from_id && e.relation == relation && e.deleted_at.is_none())
                .cloned()
                .collect()
        })
        .await
    }
}
