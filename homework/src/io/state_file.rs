//! Atomic state-file persistence (temp file + rename).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = tmp_path(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

/// Async counterpart of [`write_atomic`] for state written from the runtime.
pub async fn write_atomic_async(path: &Path, contents: String) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = tmp_path(path);
    tokio::fs::write(&tmp_path, contents)
        .await
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

/// Serialize `value` as pretty JSON with a trailing newline.
pub fn to_json_document<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize state json")?;
    buf.push('\n');
    Ok(buf)
}

/// Load a JSON state file, or `T::default()` when it does not exist yet.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        debug!(path = %path.display(), "state file missing, starting empty");
        return Ok(T::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_loads_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded: BTreeMap<String, u32> =
            load_json_or_default(&temp.path().join("absent.json")).expect("load");
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn async_write_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("store.json");
        let doc = to_json_document(&BTreeMap::from([("a".to_string(), 1u32)])).expect("json");

        write_atomic_async(&path, doc).await.expect("write");

        let loaded: BTreeMap<String, u32> = load_json_or_default(&path).expect("load");
        assert_eq!(loaded["a"], 1);
        assert!(!temp.path().join("nested").join("store.json.tmp").exists());
    }
}
