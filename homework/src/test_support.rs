//! Test-only helpers: sample records, a scripted completion service, and a
//! file-backed harness wiring the controller to a temporary `.homework/`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::controller::RunController;
use crate::core::types::{
    Budgets, IterationJob, Run, RunEvent, RunMetrics, RunScope, RunStatus, Usage,
};
use crate::io::completion::{Completion, CompletionRequest, CompletionService, Profile};
use crate::io::config::EngineConfig;
use crate::io::init::{HomeworkPaths, init_homework};
use crate::io::notify::FileNotifier;
use crate::io::queue::{Enqueued, FileQueue, JobQueue};
use crate::io::store::{Datastore, FileStore};
use crate::submit::{SubmitRequest, submit_run};
use crate::worker::Worker;

/// A queued run with deterministic defaults and no workspace yet.
pub fn sample_run(id: &str) -> Run {
    let now = Utc::now();
    Run {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        objective: "Prepare notes for the history essay".to_string(),
        scope: RunScope::RunWide,
        project_ids: Vec::new(),
        iteration: 0,
        status: RunStatus::Queued,
        budgets: Budgets::default(),
        metrics: RunMetrics::default(),
        workspace: None,
        stop_reason: None,
        final_report: None,
        created_at: now,
        updated_at: now,
    }
}

/// `{name, arguments}` with arguments JSON-encoded, as the schemas require.
pub fn tool_call(name: &str, args: Value) -> Value {
    json!({ "name": name, "arguments": args.to_string() })
}

/// Builder for schema-valid planner output.
#[derive(Debug, Clone)]
pub struct PlannerReply {
    status: Value,
    tool_calls: Vec<Value>,
    tasks: Vec<Value>,
    steps: Vec<Value>,
}

impl PlannerReply {
    /// No exit, no questions, no calls: an iteration that makes no progress.
    pub fn idle() -> Self {
        Self {
            status: json!({
                "exit_signal": false,
                "needs_user_input": false,
                "blocking_questions": [],
                "progress_summary": "",
                "remaining_work": [],
                "completion_evidence": [],
                "next_action_hint": "replan",
                "confidence": "medium",
            }),
            tool_calls: Vec::new(),
            tasks: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.status["progress_summary"] = json!(summary);
        self
    }

    pub fn remaining(mut self, work: &[&str]) -> Self {
        self.status["remaining_work"] = json!(work);
        self
    }

    /// Claim completion with `evidence`.
    pub fn exit(mut self, evidence: &[&str]) -> Self {
        self.status["exit_signal"] = json!(true);
        self.status["completion_evidence"] = json!(evidence);
        self.status["next_action_hint"] = json!("stop");
        self
    }

    pub fn ask(mut self, questions: &[&str]) -> Self {
        self.status["needs_user_input"] = json!(true);
        self.status["blocking_questions"] = json!(questions);
        self.status["next_action_hint"] = json!("ask_user");
        self
    }

    pub fn call(mut self, name: &str, args: Value) -> Self {
        self.tool_calls.push(tool_call(name, args));
        self
    }

    pub fn task(mut self, title: &str, objective: &str) -> Self {
        self.tasks.push(json!({
            "title": title,
            "objective": objective,
            "tool_hints": [],
        }));
        self
    }

    pub fn step(mut self, id: &str, title: &str, status: &str) -> Self {
        self.steps.push(json!({
            "id": id,
            "title": title,
            "status": status,
            "owner": "planner",
        }));
        self
    }

    pub fn render(&self) -> String {
        json!({
            "status": self.status,
            "tool_calls": self.tool_calls,
            "tasks": self.tasks,
            "plan": { "steps": self.steps },
        })
        .to_string()
    }
}

pub fn executor_reply(calls: Vec<Value>, notes: &str) -> String {
    json!({ "tool_calls": calls, "notes": notes }).to_string()
}

pub fn repair_reply(calls: Vec<Value>) -> String {
    json!({ "tool_calls": calls }).to_string()
}

pub fn report_reply(title: &str) -> String {
    json!({
        "title": title,
        "objective": "restated objective",
        "summary": "What happened.",
        "entities": { "created": [], "updated": [], "linked": [] },
        "artifacts": [],
    })
    .to_string()
}

/// One request seen by [`ScriptedCompletion`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub profile: Profile,
    pub label: String,
    pub iteration: u32,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Completion service replaying canned outputs per profile.
///
/// Executor and report calls fall back to an empty executor reply and a
/// generic report; planner and repair calls fail when nothing is scripted.
pub struct ScriptedCompletion {
    replies: Mutex<HashMap<Profile, VecDeque<Result<String, String>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    usage: Usage,
}

impl Default for ScriptedCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::with_usage(Usage {
            model: "scripted-model".to_string(),
            input_tokens: 120,
            output_tokens: 30,
            cost: 0.002,
        })
    }

    /// Every call reports `usage`.
    pub fn with_usage(usage: Usage) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            usage,
        }
    }

    pub fn push(&self, profile: Profile, raw: impl Into<String>) {
        self.queue_reply(profile, Ok(raw.into()));
    }

    /// Make the next `profile` call fail at the service level.
    pub fn push_error(&self, profile: Profile, message: &str) {
        self.queue_reply(profile, Err(message.to_string()));
    }

    pub fn push_planner(&self, reply: PlannerReply) {
        self.push(Profile::Planner, reply.render());
    }

    fn queue_reply(&self, profile: Profile, reply: Result<String, String>) {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(profile)
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn requests_for(&self, profile: Profile) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.profile == profile)
            .collect()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(RecordedRequest {
                profile: request.profile,
                label: request.caller.label.clone(),
                iteration: request.caller.iteration,
                system_prompt: request.system_prompt.clone(),
                user_prompt: request.user_prompt.clone(),
            });
        let scripted = self
            .replies
            .lock()
            .expect("replies lock")
            .get_mut(&request.profile)
            .and_then(VecDeque::pop_front);
        let raw = match (scripted, request.profile) {
            (Some(Ok(raw)), _) => raw,
            (Some(Err(message)), _) => return Err(anyhow!(message)),
            (None, Profile::Executor) => executor_reply(Vec::new(), ""),
            (None, Profile::Report) => report_reply("Homework report"),
            (None, profile) => return Err(anyhow!("no scripted {} reply", profile.as_str())),
        };
        Ok(Completion {
            raw,
            usage: self.usage.clone(),
        })
    }
}

/// Queue whose enqueue always fails.
pub struct FailingQueue;

#[async_trait]
impl JobQueue for FailingQueue {
    async fn enqueue(
        &self,
        _job: IterationJob,
        _delay: Duration,
        _dedup_key: &str,
    ) -> Result<Enqueued> {
        Err(anyhow!("queue unavailable"))
    }
}

/// A temporary `.homework/` with file-backed store, queue and notifier.
pub struct Harness {
    pub dir: TempDir,
    pub paths: HomeworkPaths,
    pub store: Arc<FileStore>,
    pub queue: Arc<FileQueue>,
    pub notifier: Arc<FileNotifier>,
    pub completion: Arc<ScriptedCompletion>,
    pub config: EngineConfig,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_completion(ScriptedCompletion::new())
    }

    pub fn with_completion(completion: ScriptedCompletion) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let paths = init_homework(dir.path(), false)?;
        let config = EngineConfig {
            continue_delay_ms: 0,
            worker_poll_interval_ms: 5,
            ..EngineConfig::default()
        };
        Ok(Self {
            store: Arc::new(FileStore::open(&paths.store_path)),
            queue: Arc::new(FileQueue::open(
                &paths.queue_path,
                Duration::from_secs(config.queue_visibility_timeout_secs),
            )),
            notifier: Arc::new(FileNotifier::open(&paths.notifications_path)),
            completion: Arc::new(completion),
            config,
            paths,
            dir,
        })
    }

    pub fn controller(&self) -> RunController {
        self.controller_with_queue(self.queue.clone())
    }

    pub fn controller_with_queue(&self, queue: Arc<dyn JobQueue>) -> RunController {
        RunController::new(
            self.store.clone(),
            queue,
            self.notifier.clone(),
            self.completion.clone(),
            self.config.clone(),
        )
    }

    /// Controller whose iterations talk to `service` instead of the scripted one.
    pub fn controller_with_service(&self, service: Arc<dyn CompletionService>) -> RunController {
        RunController::new(
            self.store.clone(),
            self.queue.clone(),
            self.notifier.clone(),
            service,
            self.config.clone(),
        )
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.controller(),
            Duration::from_millis(self.config.worker_poll_interval_ms),
        )
    }

    pub async fn submit(&self, objective: &str, budgets: Budgets) -> Result<Run> {
        submit_run(
            self.store.as_ref(),
            self.queue.as_ref(),
            SubmitRequest {
                user_id: "user-1".to_string(),
                objective: objective.to_string(),
                budgets,
                ..SubmitRequest::default()
            },
        )
        .await
    }

    /// Process queued jobs until none remain.
    pub async fn drain(&self) -> Result<usize> {
        self.worker().run_until_idle().await
    }

    pub async fn run(&self, run_id: &str) -> Result<Run> {
        self.store.get_run(run_id).await
    }

    pub async fn events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.store.list_events(run_id).await
    }

    /// Notification lines written so far.
    pub fn notifications(&self) -> Result<Vec<Value>> {
        let raw = match std::fs::read_to_string(&self.paths.notifications_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}
