//! Completion backend that shells out to `codex exec`.
//!
//! Every call leaves its prompt, schema, event stream, log, and final message
//! under `.homework/completions/<run>/<iteration>/<label>/attempt-<n>/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Usage;
use crate::io::completion::{Completion, CompletionRequest, CompletionService, Profile};
use crate::io::config::{EngineConfig, ProfileConfig};
use crate::io::process::run_command;

/// Model name recorded when the profile leaves the choice to the backend.
const DEFAULT_MODEL_LABEL: &str = "codex-default";

#[derive(Debug, Clone)]
pub struct CodexCompletion {
    workdir: PathBuf,
    completions_dir: PathBuf,
    config: EngineConfig,
}

impl CodexCompletion {
    pub fn new(
        workdir: impl Into<PathBuf>,
        completions_dir: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            completions_dir: completions_dir.into(),
            config,
        }
    }

    fn profile(&self, profile: Profile) -> &ProfileConfig {
        let profiles = &self.config.profiles;
        match profile {
            Profile::Planner => &profiles.planner,
            Profile::Executor => &profiles.executor,
            Profile::Repair => &profiles.repair,
            Profile::Report => &profiles.report,
        }
    }

    fn call_dir(&self, request: &CompletionRequest) -> PathBuf {
        self.completions_dir
            .join(&request.caller.run_id)
            .join(request.caller.iteration.to_string())
            .join(&request.caller.label)
            .join(format!("attempt-{}", request.attempt.max(1)))
    }

    #[instrument(skip_all, fields(label = %request.caller.label, attempt = request.attempt))]
    fn exec_blocking(&self, request: &CompletionRequest, dir: &Path) -> Result<Completion> {
        fs::create_dir_all(dir).with_context(|| format!("create completion dir {}", dir.display()))?;
        let schema_path = dir.join("output.schema.json");
        let output_path = dir.join("output.json");
        let stream_path = dir.join("stream.jsonl");
        let prompt = format!(
            "{}\n\n---\n\n{}",
            request.system_prompt.trim(),
            request.user_prompt.trim()
        );
        fs::write(&schema_path, request.output_schema)
            .with_context(|| format!("write schema {}", schema_path.display()))?;
        fs::write(dir.join("prompt.md"), &prompt).context("write prompt")?;

        let profile = self.profile(request.profile);
        let completion_cfg = &self.config.completion;
        let mut cmd = Command::new(&completion_cfg.command);
        cmd.arg("exec")
            .arg("-c")
            .arg(format!("model_reasoning_effort={}", profile.reasoning_effort));
        if let Some(model) = &profile.model {
            cmd.arg("--model").arg(model);
        }
        // Tool calls go through the dispatcher; the model itself must not touch the disk.
        cmd.arg("--sandbox")
            .arg("read-only")
            .arg("--skip-git-repo-check")
            .arg("--json")
            .arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&output_path)
            .arg("-")
            .current_dir(&self.workdir);

        info!(profile = request.profile.as_str(), "starting codex exec");
        let timeout = Duration::from_secs(completion_cfg.timeout_secs);
        let output = run_command(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            completion_cfg.output_limit_bytes,
            Some(stream_path.as_path()),
        )
        .context("run codex exec")?;
        fs::write(dir.join("codex.log"), output.render_log("codex")).context("write codex log")?;

        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "codex exec timed out");
            return Err(anyhow!("codex exec timed out after {timeout:?}"));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            return Err(anyhow!(
                "codex exec failed with status {:?}",
                output.status.code()
            ));
        }

        let raw = fs::read_to_string(&output_path)
            .with_context(|| format!("missing codex output {}", output_path.display()))?;
        let (input_tokens, output_tokens) = usage_from_stream(&output.stdout);
        let model = profile
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL_LABEL.to_string());
        let cost = self.config.price(&model, input_tokens, output_tokens);
        debug!(input_tokens, output_tokens, cost, "codex exec completed");

        Ok(Completion {
            raw,
            usage: Usage {
                model,
                input_tokens,
                output_tokens,
                cost,
            },
        })
    }
}

#[async_trait]
impl CompletionService for CodexCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let dir = self.call_dir(request);
        let backend = self.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || backend.exec_blocking(&request, &dir))
            .await
            .context("join codex exec task")?
    }
}

/// Sum `turn.completed` usage over a `codex exec --json` event stream.
///
/// Cached input tokens are already included in `input_tokens`.
pub fn usage_from_stream(stdout: &[u8]) -> (u64, u64) {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .filter(|event| event.get("type").and_then(Value::as_str) == Some("turn.completed"))
        .filter_map(|event| event.get("usage").cloned())
        .fold((0, 0), |(input, output), usage| {
            let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
            (input + field("input_tokens"), output + field("output_tokens"))
        })
}
