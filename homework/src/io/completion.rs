//! Language-model completion seam.
//!
//! The [`CompletionService`] trait decouples agents from the backend (currently
//! `codex exec`, see [`crate::io::codex`]). Agents never call it directly; they
//! go through [`request_json`], which reports usage after every attempt and
//! turns raw text into a validated, typed value. Tests use scripted services
//! that return canned outputs without spawning processes.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::Usage;

/// Which role is calling; selects model and reasoning effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Planner,
    Executor,
    Repair,
    Report,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Planner => "planner",
            Profile::Executor => "executor",
            Profile::Repair => "repair",
            Profile::Report => "report",
        }
    }
}

/// Identifies one logical call for logs, usage attribution, and on-disk files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIds {
    pub run_id: String,
    pub iteration: u32,
    /// Unique within the iteration, e.g. `planner` or `executor-task-outline`.
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    pub retry_on_parse_error: bool,
    /// Extra attempts after the first when `retry_on_parse_error` is set.
    pub max_retries: u32,
    pub validate_schema: bool,
}

impl ValidationOptions {
    pub fn strict(max_retries: u32) -> Self {
        Self {
            retry_on_parse_error: true,
            max_retries,
            validate_schema: true,
        }
    }

    fn attempts(self) -> u32 {
        if self.retry_on_parse_error {
            1 + self.max_retries
        } else {
            1
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub caller: CallerIds,
    pub profile: Profile,
    /// JSON Schema the output must satisfy.
    pub output_schema: &'static str,
    pub validation: ValidationOptions,
    /// 1-based; set by [`request_json`].
    pub attempt: u32,
}

/// Raw model output plus the usage it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub raw: String,
    pub usage: Usage,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// One call. Errors mean the service itself failed and are not retried.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Receives usage for every completion-service call, including failed parses.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, caller: &CallerIds, usage: &Usage);
}

/// Output could not be turned into the expected shape within the attempt budget.
#[derive(Debug, Error)]
#[error("completion `{label}` unusable after {attempts} attempt(s): {message}")]
pub struct CompletionParseError {
    pub label: String,
    pub attempts: u32,
    pub message: String,
}

/// Call the service and parse its output as `T`.
///
/// Each attempt's usage goes to `usage` before parsing, so spend is visible
/// even when the output is thrown away.
#[instrument(skip_all, fields(run_id = %request.caller.run_id, iteration = request.caller.iteration, label = %request.caller.label))]
pub async fn request_json<T: DeserializeOwned + Send>(
    service: &dyn CompletionService,
    usage: &dyn UsageSink,
    mut request: CompletionRequest,
) -> Result<T> {
    let schema: Value = serde_json::from_str(request.output_schema)
        .map_err(|err| anyhow!("invalid output schema for {}: {err}", request.caller.label))?;
    let validator = if request.validation.validate_schema {
        Some(validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?)
    } else {
        None
    };

    let attempts = request.validation.attempts();
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        request.attempt = attempt;
        let completion = service.complete(&request).await?;
        usage.record(&request.caller, &completion.usage).await;

        match parse_output(&completion.raw, validator.as_ref()) {
            Ok(value) => match serde_json::from_value::<T>(value) {
                Ok(parsed) => {
                    debug!(attempt, "completion parsed");
                    return Ok(parsed);
                }
                Err(err) => last_error = format!("deserialize: {err}"),
            },
            Err(message) => last_error = message,
        }
        warn!(attempt, attempts, error = %last_error, "completion output rejected");
    }

    Err(CompletionParseError {
        label: request.caller.label.clone(),
        attempts,
        message: last_error,
    }
    .into())
}

fn parse_output(raw: &str, validator: Option<&jsonschema::Validator>) -> Result<Value, String> {
    let text = strip_code_fence(raw);
    let value: Value = serde_json::from_str(text).map_err(|err| format!("invalid json: {err}"))?;
    if !value.is_object() {
        return Err("expected a JSON object".to_string());
    }
    if let Some(validator) = validator {
        let messages: Vec<String> = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(format!("schema validation failed: {}", messages.join("; ")));
        }
    }
    Ok(value)
}

/// Remove a surrounding Markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening line.
    match body.find('\n') {
        Some(newline) => body[newline + 1..].trim(),
        None => body.trim(),
    }
}
