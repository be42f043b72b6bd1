//! User-facing notification sink.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    /// Where the user should land, e.g. `homework/runs/<id>`.
    pub action_target: String,
    pub payload: Value,
}

/// Fire-and-forget delivery. Callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct NotificationLine<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    notification: &'a Notification,
}

/// Appends one JSON line per notification to `notifications.jsonl`.
pub struct FileNotifier {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileNotifier {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        let line = serde_json::to_string(&NotificationLine {
            at: Utc::now(),
            notification: &notification,
        })
        .context("serialize notification")?;

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn appends_one_line_per_notification() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("notifications.jsonl");
        let notifier = FileNotifier::open(&path);

        for title in ["first", "second"] {
            notifier
                .notify(Notification {
                    recipient: "user-1".to_string(),
                    kind: "homework_run_completed".to_string(),
                    title: title.to_string(),
                    message: "done".to_string(),
                    action_target: "homework/runs/run-1".to_string(),
                    payload: json!({"run_id": "run-1"}),
                })
                .await
                .expect("notify");
        }

        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["title"], "second");
        assert_eq!(lines[0]["type"], "homework_run_completed");
    }
}
