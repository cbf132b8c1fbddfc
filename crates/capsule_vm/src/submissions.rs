use crate::workload::{TaskOutcome, TaskSpec};
use anyhow::{Context as _, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Append-only JSONL record of every task outcome in a run.
#[derive(Debug, Clone)]
pub struct SubmissionLog {
    path: PathBuf,
}

impl SubmissionLog {
    pub fn new(log_dir: &Path, run_id: &str) -> Self {
        Self {
            path: log_dir.join(format!("{}_RAW_SUBMISSIONS.jsonl", run_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `{task_id: value}` as one line and flush it to disk.
    pub async fn append(&self, task: &TaskSpec, outcome: &TaskOutcome) -> Result<()> {
        let mut entry = Map::new();
        entry.insert(task.id.clone(), outcome.submission_value());
        let mut line = serde_json::to_string(&Value::Object(entry))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Every line written so far, in order.
    pub fn read_all(&self) -> Result<Vec<Value>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read submissions"),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Corrupt submissions line"))
            .collect()
    }
}
