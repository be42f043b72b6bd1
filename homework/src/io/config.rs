//! Engine configuration stored under `.homework/state/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::state_file::write_atomic;

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock budget applied when neither the job nor the run sets one.
    pub default_max_wall_clock_ms: u64,

    /// Delay before the next iteration's job becomes visible.
    pub continue_delay_ms: u64,

    /// Delegated tasks run at most this many at a time.
    pub max_concurrent_executors: usize,

    /// Byte budget for a rendered user prompt; droppable sections go first.
    pub prompt_budget_bytes: usize,

    /// How much of the main scratchpad's tail the planner sees.
    pub scratchpad_tail_bytes: usize,

    pub worker_poll_interval_ms: u64,

    /// A claimed job is redelivered if not acknowledged within this window.
    pub queue_visibility_timeout_secs: u64,

    pub completion: CompletionConfig,

    pub profiles: Profiles,

    /// USD per million tokens, keyed by model name. Unknown models cost 0.
    pub pricing: BTreeMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    /// Program invoked as `<command> exec ...`.
    pub command: String,
    pub timeout_secs: u64,
    /// Truncate completion stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Extra attempts after a parse/validation failure.
    pub max_retries: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            timeout_secs: 15 * 60,
            output_limit_bytes: 200_000,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileConfig {
    /// Backend default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub reasoning_effort: String,
}

impl ProfileConfig {
    fn with_effort(effort: &str) -> Self {
        Self {
            model: None,
            reasoning_effort: effort.to_string(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self::with_effort("medium")
    }
}

/// One profile per completion-service role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Profiles {
    pub planner: ProfileConfig,
    pub executor: ProfileConfig,
    pub repair: ProfileConfig,
    pub report: ProfileConfig,
}

impl Default for Profiles {
    fn default() -> Self {
        Self {
            planner: ProfileConfig::with_effort("high"),
            executor: ProfileConfig::with_effort("medium"),
            repair: ProfileConfig::with_effort("low"),
            report: ProfileConfig::with_effort("medium"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_wall_clock_ms: 60 * 60 * 1000,
            continue_delay_ms: 1_000,
            max_concurrent_executors: 3,
            prompt_budget_bytes: 40_000,
            scratchpad_tail_bytes: 6_000,
            worker_poll_interval_ms: 1_000,
            queue_visibility_timeout_secs: 30 * 60,
            completion: CompletionConfig::default(),
            profiles: Profiles::default(),
            pricing: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_max_wall_clock_ms == 0 {
            return Err(anyhow!("default_max_wall_clock_ms must be > 0"));
        }
        if self.max_concurrent_executors == 0 {
            return Err(anyhow!("max_concurrent_executors must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.worker_poll_interval_ms == 0 {
            return Err(anyhow!("worker_poll_interval_ms must be > 0"));
        }
        if self.queue_visibility_timeout_secs == 0 {
            return Err(anyhow!("queue_visibility_timeout_secs must be > 0"));
        }
        if self.completion.command.trim().is_empty() {
            return Err(anyhow!("completion.command must be non-empty"));
        }
        if self.completion.timeout_secs == 0 {
            return Err(anyhow!("completion.timeout_secs must be > 0"));
        }
        if self.completion.output_limit_bytes == 0 {
            return Err(anyhow!("completion.output_limit_bytes must be > 0"));
        }
        for (model, price) in &self.pricing {
            if price.input_per_million < 0.0 || price.output_per_million < 0.0 {
                return Err(anyhow!("pricing.{model} must not be negative"));
            }
        }
        Ok(())
    }

    pub fn price(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.pricing
            .get(model)
            .map(|p| p.cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.pricing.insert(
            "gpt-5".to_string(),
            ModelPricing {
                input_per_million: 1.25,
                output_per_million: 10.0,
            },
        );
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "continue_delay_ms = 0\n[profiles.planner]\nmodel = \"gpt-5\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.continue_delay_ms, 0);
        assert_eq!(cfg.profiles.planner.model.as_deref(), Some("gpt-5"));
        assert_eq!(cfg.profiles.planner.reasoning_effort, "medium");
        assert_eq!(cfg.max_concurrent_executors, 3);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = EngineConfig {
            max_concurrent_executors: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_models_are_free() {
        let mut cfg = EngineConfig::default();
        cfg.pricing.insert(
            "m".to_string(),
            ModelPricing {
                input_per_million: 2.0,
                output_per_million: 8.0,
            },
        );
        assert!((cfg.price("m", 1_000_000, 500_000) - 6.0).abs() < 1e-9);
        assert_eq!(cfg.price("other", 1_000_000, 1_000_000), 0.0);
    }
}
