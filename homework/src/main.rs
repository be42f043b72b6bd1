//! Homework run engine CLI.
//!
//! State lives in `.homework/state/` under `--root`: the datastore, the job
//! queue, and the notification log. `submit` creates a run and queues its
//! first iteration; `work` consumes the queue and drives runs to completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use homework::controller::RunController;
use homework::core::types::{Budgets, RunScope, RunStatus};
use homework::exit_codes;
use homework::io::codex::CodexCompletion;
use homework::io::config::{EngineConfig, load_config};
use homework::io::init::{HomeworkPaths, init_homework};
use homework::io::notify::FileNotifier;
use homework::io::queue::FileQueue;
use homework::io::store::{Datastore, FileStore};
use homework::logging;
use homework::submit::{SubmitRequest, submit_run};
use homework::worker::Worker;

#[derive(Parser)]
#[command(
    name = "homework",
    version,
    about = "Resumable, queue-driven planner/executor runs"
)]
struct Cli {
    /// Directory containing `.homework/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.homework/` with a default config.
    Init {
        /// Overwrite config and `.gitignore`; stored runs are kept.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a run and queue its first iteration. Prints the run id.
    Submit {
        /// Free-text objective.
        objective: String,
        #[arg(long, default_value = "local")]
        user: String,
        #[arg(long, value_enum, default_value_t = ScopeArg::RunWide)]
        scope: ScopeArg,
        /// Extra project ids the run may touch (repeatable).
        #[arg(long = "project")]
        projects: Vec<String>,
        #[arg(long)]
        max_wall_clock_ms: Option<u64>,
        #[arg(long)]
        max_cost: Option<f64>,
        #[arg(long)]
        max_total_tokens: Option<u64>,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Consume the job queue.
    Work {
        /// Exit once no job is pending instead of polling forever.
        #[arg(long)]
        until_idle: bool,
    },
    /// Handle the jobs that are ready now, then exit.
    Step,
    /// Answer a run's blocking questions and resume it.
    Answer { run_id: String, answer: String },
    /// Cancel a run.
    Cancel { run_id: String },
    /// Print a run and its iterations as JSON. Exit code reflects its status.
    Status {
        run_id: String,
        /// Include the event log.
        #[arg(long)]
        events: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScopeArg {
    RunWide,
    ProjectScoped,
}

impl From<ScopeArg> for RunScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::RunWide => RunScope::RunWide,
            ScopeArg::ProjectScoped => RunScope::ProjectScoped,
        }
    }
}

/// Open handles over one `.homework/` directory.
struct Env {
    paths: HomeworkPaths,
    config: EngineConfig,
    store: Arc<FileStore>,
    queue: Arc<FileQueue>,
}

impl Env {
    fn open(root: &Path) -> Result<Self> {
        let paths = HomeworkPaths::new(root);
        if !paths.homework_dir.is_dir() {
            return Err(anyhow!(
                "{} not found (run `homework init` first)",
                paths.homework_dir.display()
            ));
        }
        let config = load_config(&paths.config_path)?;
        Ok(Self {
            store: Arc::new(FileStore::open(&paths.store_path)),
            queue: Arc::new(FileQueue::open(
                &paths.queue_path,
                Duration::from_secs(config.queue_visibility_timeout_secs),
            )),
            config,
            paths,
        })
    }

    fn controller(&self) -> RunController {
        let service = CodexCompletion::new(
            &self.paths.root,
            &self.paths.completions_dir,
            self.config.clone(),
        );
        RunController::new(
            self.store.clone(),
            self.queue.clone(),
            Arc::new(FileNotifier::open(&self.paths.notifications_path)),
            Arc::new(service),
            self.config.clone(),
        )
    }

    fn worker(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.controller(),
            Duration::from_millis(self.config.worker_poll_interval_ms),
        )
    }
}

#[tokio::main]
async fn main() {
    logging::init();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            let paths = init_homework(&cli.root, force)?;
            println!("{}", paths.homework_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Submit {
            objective,
            user,
            scope,
            projects,
            max_wall_clock_ms,
            max_cost,
            max_total_tokens,
            max_iterations,
        } => {
            let env = Env::open(&cli.root)?;
            let run = submit_run(
                env.store.as_ref(),
                env.queue.as_ref(),
                SubmitRequest {
                    user_id: user,
                    objective,
                    scope: scope.into(),
                    project_ids: projects,
                    budgets: Budgets {
                        max_wall_clock_ms,
                        max_cost,
                        max_total_tokens,
                        max_iterations,
                    },
                },
            )
            .await?;
            println!("{}", run.id);
            Ok(exit_codes::OK)
        }
        Command::Work { until_idle } => {
            let worker = Env::open(&cli.root)?.worker();
            if until_idle {
                let handled = worker.run_until_idle().await?;
                eprintln!("handled {handled} job(s)");
            } else {
                worker.run_forever().await?;
            }
            Ok(exit_codes::OK)
        }
        Command::Step => {
            let handled = Env::open(&cli.root)?.worker().run_once().await?;
            eprintln!("handled {handled} job(s)");
            Ok(exit_codes::OK)
        }
        Command::Answer { run_id, answer } => {
            let next = Env::open(&cli.root)?
                .controller()
                .answer(&run_id, &answer)
                .await?;
            println!("queued iteration {next}");
            Ok(exit_codes::OK)
        }
        Command::Cancel { run_id } => {
            let status = Env::open(&cli.root)?.controller().cancel(&run_id).await?;
            println!("{}", status.as_str());
            Ok(exit_codes::OK)
        }
        Command::Status { run_id, events } => {
            let env = Env::open(&cli.root)?;
            let run = env.store.get_run(&run_id).await?;
            let iterations = env.store.list_iterations(&run_id).await?;
            let mut doc = json!({ "run": run, "iterations": iterations });
            if events {
                doc["events"] = serde_json::to_value(env.store.list_events(&run_id).await?)
                    .context("serialize events")?;
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&doc).context("serialize run")?
            );
            Ok(match run.status {
                RunStatus::Failed => exit_codes::RUN_FAILED,
                RunStatus::WaitingOnUser => exit_codes::WAITING_ON_USER,
                _ => exit_codes::OK,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["homework", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_submit_with_budgets() {
        let cli = Cli::parse_from([
            "homework",
            "--root",
            "/tmp/hw",
            "submit",
            "Summarize chapter 3",
            "--scope",
            "project-scoped",
            "--project",
            "proj_a",
            "--project",
            "proj_b",
            "--max-iterations",
            "5",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/hw"));
        match cli.command {
            Command::Submit {
                objective,
                scope,
                projects,
                max_iterations,
                max_cost,
                ..
            } => {
                assert_eq!(objective, "Summarize chapter 3");
                assert_eq!(scope, ScopeArg::ProjectScoped);
                assert_eq!(projects, vec!["proj_a", "proj_b"]);
                assert_eq!(max_iterations, Some(5));
                assert_eq!(max_cost, None);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn parse_work_until_idle() {
        let cli = Cli::parse_from(["homework", "work", "--until-idle"]);
        assert!(matches!(cli.command, Command::Work { until_idle: true }));
    }
}
