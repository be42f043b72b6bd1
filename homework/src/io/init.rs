//! `.homework/` scaffolding and the canonical paths inside it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EngineConfig, write_config};

/// All canonical paths within `.homework/` for a root directory.
#[derive(Debug, Clone)]
pub struct HomeworkPaths {
    pub root: PathBuf,
    pub homework_dir: PathBuf,
    pub state_dir: PathBuf,
    pub completions_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub store_path: PathBuf,
    pub queue_path: PathBuf,
    pub notifications_path: PathBuf,
}

impl HomeworkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let homework_dir = root.join(".homework");
        let state_dir = homework_dir.join("state");
        Self {
            root: root.clone(),
            homework_dir: homework_dir.clone(),
            state_dir: state_dir.clone(),
            completions_dir: homework_dir.join("completions"),
            gitignore_path: homework_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            store_path: state_dir.join("store.json"),
            queue_path: state_dir.join("queue.json"),
            notifications_path: state_dir.join("notifications.jsonl"),
        }
    }
}

/// Create `.homework/` in `root` with a default config.
///
/// Fails if `.homework/` already exists unless `force` is set. Forcing only
/// rewrites the config and `.gitignore`; stored runs and queued jobs are kept.
pub fn init_homework(root: &Path, force: bool) -> Result<HomeworkPaths> {
    let paths = HomeworkPaths::new(root);
    if paths.homework_dir.exists() && !force {
        return Err(anyhow!(
            "homework init: .homework already exists (use --force to overwrite)"
        ));
    }
    if paths.homework_dir.exists() && !paths.homework_dir.is_dir() {
        return Err(anyhow!(
            "homework init: .homework exists but is not a directory"
        ));
    }

    for dir in [&paths.homework_dir, &paths.state_dir, &paths.completions_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, HOMEWORK_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;

    Ok(paths)
}

const HOMEWORK_GITIGNORE: &str = "completions/\nstate/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");

        let paths = init_homework(temp.path(), false).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.completions_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            HOMEWORK_GITIGNORE
        );
        let cfg = load_config(&paths.config_path).expect("config");
        assert_eq!(cfg, EngineConfig::default());
    }

    /// Verifies a second init without `--force` refuses to touch existing state.
    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_homework(temp.path(), false).expect("init");

        let err = init_homework(temp.path(), false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn force_rewrites_config_but_keeps_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_homework(temp.path(), false).expect("init");
        fs::write(&paths.config_path, "continue_delay_ms = 5\n").expect("custom config");
        fs::write(&paths.store_path, "{}").expect("store");

        init_homework(temp.path(), true).expect("re-init");

        let cfg = load_config(&paths.config_path).expect("config");
        assert_eq!(cfg.continue_delay_ms, EngineConfig::default().continue_delay_ms);
        assert!(paths.store_path.exists());
    }
}
