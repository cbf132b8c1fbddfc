//! Running the agent on a prepared host.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use capsule_core::config::WorkloadConfig;
use capsule_os::{CommandSpec, Executor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const LAUNCH: &str = "rm -f \"$CAPSULE_RESULT_FILE\"; \
                      nohup \"$@\" </dev/null >agent_stdout.log 2>&1 & echo $!";
const IS_ALIVE: &str = "kill -0 \"$1\" 2>/dev/null";
const STDOUT_LOG: &str = "agent_stdout.log";
const STOP: &str = "kill \"$1\" 2>/dev/null; sleep 2; kill -9 \"$1\" 2>/dev/null; true";

/// One task handed to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub input: Value,
    #[serde(default)]
    pub agent_args: Value,
}

impl TaskSpec {
    /// Read a task file: a JSON object mapping task id to task input.
    pub fn load_all(path: &Path) -> Result<Vec<TaskSpec>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task file {}", path.display()))?;
        let map: Map<String, Value> = serde_json::from_str(&text)
            .with_context(|| format!("Task file {} is not a JSON object", path.display()))?;
        Ok(map
            .into_iter()
            .map(|(id, input)| TaskSpec {
                id,
                input,
                agent_args: Value::Object(Map::new()),
            })
            .collect())
    }

    /// Local files the task needs on the host, from the `files` mapping of
    /// its input (host path to local source). Host paths under `/root/`
    /// land relative to the working directory.
    pub fn staged_files(&self) -> Vec<(String, PathBuf)> {
        let Some(files) = self.input.get("files").and_then(Value::as_object) else {
            return Vec::new();
        };
        files
            .iter()
            .filter_map(|(dest, source)| {
                let source = source.as_str()?;
                let dest = dest.replace("/root/", "");
                let dest = dest.trim_start_matches('/');
                if dest.is_empty() {
                    return None;
                }
                Some((dest.to_string(), PathBuf::from(source)))
            })
            .collect()
    }

    /// Contents of `input.json` on the host.
    pub fn input_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert(self.id.clone(), self.input.clone());
        Value::Object(doc)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The agent's answer mapping.
    Completed(Value),
    TimedOut { after: Duration },
    Error(String),
}

impl TaskOutcome {
    /// Value recorded in the submissions log.
    pub fn submission_value(&self) -> Value {
        match self {
            TaskOutcome::Completed(v) => v.clone(),
            TaskOutcome::TimedOut { after } => {
                Value::String(format!("TIMEOUT after {} seconds", after.as_secs()))
            }
            TaskOutcome::Error(e) => Value::String(format!("ERROR: {}", e)),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }
}

/// Runs one task on a prepared host.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn invoke(&self, executor: &dyn Executor, workdir: &str, task: &TaskSpec) -> TaskOutcome;
}

/// Launches the agent detached and polls for its result file.
pub struct RemoteWorkload {
    config: WorkloadConfig,
    log_dir: PathBuf,
    command_timeout: Duration,
}

impl RemoteWorkload {
    pub fn new(config: WorkloadConfig, command_timeout: Duration) -> Self {
        let log_dir = config.log_dir.clone();
        Self {
            config,
            log_dir,
            command_timeout,
        }
    }

    fn task_log_path(&self, task: &TaskSpec) -> PathBuf {
        self.log_dir
            .join("agent_logs")
            .join(format!("{}_log.log", task.id))
    }

    async fn launch(&self, executor: &dyn Executor, workdir: &str, task: &TaskSpec) -> Result<String> {
        let input = serde_json::to_vec_pretty(&task.input_document())?;
        let args = serde_json::to_vec_pretty(&task.agent_args)?;
        for (name, bytes) in [("input.json", input), ("agent_args.json", args)] {
            let path = format!("{}/{}", workdir, name);
            let written = executor.upload(&bytes, &path, self.command_timeout).await?;
            anyhow::ensure!(written.success(), "writing {}: {}", path, written.error_excerpt(300));
        }

        let launch = CommandSpec::shell(LAUNCH)
            .args(self.config.command.iter().cloned())
            .env("CAPSULE_RESULT_FILE", &self.config.result_file)
            .env("CAPSULE_TASK_ID", &task.id)
            .cwd(workdir);
        let started = executor.run(&launch, self.command_timeout).await?;
        anyhow::ensure!(
            started.success(),
            "launching agent: {}",
            started.error_excerpt(300)
        );
        let pid = started.stdout.trim().to_string();
        anyhow::ensure!(!pid.is_empty(), "agent launch printed no pid");
        Ok(pid)
    }

    /// Copy the remote trace into the per-task log and append new content to
    /// the combined log.
    async fn sync_trace(
        &self,
        executor: &dyn Executor,
        workdir: &str,
        task: &TaskSpec,
        seen: &mut usize,
    ) -> Result<()> {
        let remote = format!("{}/{}", workdir, self.config.trace_file);
        let Some(trace) = executor.read_file(&remote, self.command_timeout).await? else {
            return Ok(());
        };
        let task_log = self.task_log_path(task);
        if let Some(parent) = task_log.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&task_log, trace.as_bytes()).await?;

        if trace.len() > *seen {
            let fresh = trace.get(*seen..).unwrap_or(trace.as_str());
            let mut combined = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_dir.join("combined_logs.log"))
                .await?;
            combined.write_all(fresh.as_bytes()).await?;
            combined.flush().await?;
            *seen = trace.len();
        }
        Ok(())
    }

    /// Copy the task's result files into `<log_dir>/<task id>/`.
    async fn collect_results(&self, executor: &dyn Executor, workdir: &str, task: &TaskSpec) -> Result<usize> {
        let dest = self.log_dir.join(&task.id);
        tokio::fs::create_dir_all(&dest).await?;
        let names = [
            self.config.result_file.as_str(),
            self.config.trace_file.as_str(),
            STDOUT_LOG,
        ]
        .into_iter()
        .chain(self.config.collect_files.iter().map(String::as_str));

        let mut copied = 0;
        for name in names {
            let remote = format!("{}/{}", workdir, name);
            let Some(text) = executor.read_file(&remote, self.command_timeout).await? else {
                tracing::debug!("{} not present on host", remote);
                continue;
            };
            let local = dest.join(name);
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local, text.as_bytes())
                .await
                .with_context(|| format!("writing {}", local.display()))?;
            copied += 1;
        }
        Ok(copied)
    }

    async fn poll(&self, executor: &dyn Executor, workdir: &str, task: &TaskSpec, pid: &str) -> TaskOutcome {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let result_path = format!("{}/{}", workdir, self.config.result_file);
        let started = tokio::time::Instant::now();
        let mut seen = 0usize;
        let mut last_parse_error = None;

        while started.elapsed() < timeout {
            tokio::time::sleep(interval.min(timeout.saturating_sub(started.elapsed()))).await;

            if let Err(e) = self.sync_trace(executor, workdir, task, &mut seen).await {
                tracing::warn!("Could not fetch agent trace for {}: {:#}", task.id, e);
            }

            match executor.read_file(&result_path, self.command_timeout).await {
                Ok(Some(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(answer) => return TaskOutcome::Completed(answer),
                    // may still be mid-write
                    Err(e) => last_parse_error = Some(e.to_string()),
                },
                Ok(None) => {}
                Err(e) => return TaskOutcome::Error(format!("lost connection while polling: {}", e)),
            }

            let alive = executor
                .run(&CommandSpec::shell(IS_ALIVE).arg(pid), self.command_timeout)
                .await;
            if let Ok(r) = alive {
                if !r.success() {
                    // Exited between the two checks; look once more.
                    if let Ok(Some(text)) = executor.read_file(&result_path, self.command_timeout).await {
                        if let Ok(answer) = serde_json::from_str::<Value>(&text) {
                            return TaskOutcome::Completed(answer);
                        }
                    }
                    return TaskOutcome::Error(match last_parse_error {
                        Some(e) => format!("agent wrote an unparseable {}: {}", self.config.result_file, e),
                        None => format!("agent exited without writing {}", self.config.result_file),
                    });
                }
            }
            tracing::debug!("Task {} still running ({:.0}s)", task.id, started.elapsed().as_secs_f64());
        }

        tracing::warn!("Task {} timed out after {}s, stopping agent", task.id, timeout.as_secs());
        if let Err(e) = executor
            .run(&CommandSpec::shell(STOP).arg(pid), self.command_timeout)
            .await
        {
            tracing::warn!("Could not stop agent pid {}: {}", pid, e);
        }
        TaskOutcome::TimedOut { after: timeout }
    }
}

#[async_trait]
impl Workload for RemoteWorkload {
    async fn invoke(&self, executor: &dyn Executor, workdir: &str, task: &TaskSpec) -> TaskOutcome {
        tracing::info!("Starting task {} in {}", task.id, workdir);
        let pid = match self.launch(executor, workdir, task).await {
            Ok(pid) => pid,
            Err(e) => return TaskOutcome::Error(format!("{:#}", e)),
        };
        let outcome = self.poll(executor, workdir, task, &pid).await;
        match &outcome {
            TaskOutcome::Completed(_) => {
                tracing::info!("Task {} completed", task.id);
                match self.collect_results(executor, workdir, task).await {
                    Ok(n) => tracing::info!("Copied {} result file(s) of {}", n, task.id),
                    // The answer is already in hand.
                    Err(e) => tracing::warn!(
                        "Task {} completed but its files could not be copied: {:#}",
                        task.id,
                        e
                    ),
                }
            }
            TaskOutcome::TimedOut { after } => {
                tracing::warn!("Task {} timed out after {}s", task.id, after.as_secs())
            }
            TaskOutcome::Error(e) => tracing::warn!("Task {} failed: {}", task.id, e),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_os::{MockExecutor, MockReply};
    use std::sync::Arc;

    fn workload(log_dir: &Path, timeout_secs: u64) -> RemoteWorkload {
        let config = WorkloadConfig {
            timeout_secs,
            poll_interval_secs: 30,
            log_dir: log_dir.to_path_buf(),
            ..Default::default()
        };
        RemoteWorkload::new(config, Duration::from_secs(10))
    }

    fn task() -> TaskSpec {
        TaskSpec {
            id: "capsule-5507257".into(),
            input: serde_json::json!({"prompt": "reproduce figure 2"}),
            agent_args: serde_json::json!({"model_name": "m"}),
        }
    }

    fn script(cmd: &CommandSpec) -> &str {
        cmd.args.get(1).map(String::as_str).unwrap_or("")
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_after_polls() {
        let logs = tempfile::TempDir::new().unwrap();
        let exec = Arc::new(MockExecutor::new(|cmd| {
            if script(cmd).contains("nohup") {
                MockReply::ok("4242\n")
            } else {
                MockReply::ok("")
            }
        }));
        exec.put_file("/home/agent/agent_trace.log", "step 1\n");

        let exec2 = exec.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(95)).await;
            exec2.put_file("/home/agent/agent_trace.log", "step 1\nstep 2\n");
            exec2.put_file("/home/agent/output.json", r#"{"answer": 42}"#);
        });

        let outcome = workload(logs.path(), 7200)
            .invoke(exec.as_ref(), "/home/agent", &task())
            .await;
        writer.await.unwrap();

        assert_eq!(outcome, TaskOutcome::Completed(serde_json::json!({"answer": 42})));

        let input = exec.file("/home/agent/input.json").unwrap();
        let doc: Value = serde_json::from_slice(&input).unwrap();
        assert_eq!(doc["capsule-5507257"]["prompt"], "reproduce figure 2");

        let task_log =
            std::fs::read_to_string(logs.path().join("agent_logs/capsule-5507257_log.log")).unwrap();
        assert_eq!(task_log, "step 1\nstep 2\n");
        let combined = std::fs::read_to_string(logs.path().join("combined_logs.log")).unwrap();
        assert_eq!(combined, "step 1\nstep 2\n");

        let launch = exec
            .calls_to("sh")
            .into_iter()
            .find(|c| script(c).contains("nohup"))
            .unwrap();
        assert_eq!(launch.cwd.as_deref(), Some("/home/agent"));
        assert!(launch.args.ends_with(&["python".to_string(), "run_agent.py".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_task_results_copied_back() {
        let logs = tempfile::TempDir::new().unwrap();
        let exec = MockExecutor::new(|cmd| {
            if script(cmd).contains("nohup") {
                MockReply::ok("4242\n")
            } else {
                MockReply::ok("")
            }
        });
        exec.put_file("/home/agent/output.json", r#"{"answer": 7}"#);
        exec.put_file("/home/agent/agent_trace.log", "done\n");
        exec.put_file("/home/agent/results/figure.txt", "plotted");

        let mut w = workload(logs.path(), 7200);
        w.config.collect_files = vec!["results/figure.txt".into(), "results/absent.txt".into()];
        let outcome = w.invoke(&exec, "/home/agent", &task()).await;
        assert!(outcome.is_completed());

        let dest = logs.path().join("capsule-5507257");
        assert_eq!(
            std::fs::read_to_string(dest.join("output.json")).unwrap(),
            r#"{"answer": 7}"#
        );
        assert_eq!(std::fs::read_to_string(dest.join("agent_trace.log")).unwrap(), "done\n");
        assert_eq!(
            std::fs::read_to_string(dest.join("results/figure.txt")).unwrap(),
            "plotted"
        );
        assert!(!dest.join("agent_stdout.log").exists());
        assert!(!dest.join("results/absent.txt").exists());
    }

    #[test]
    fn test_staged_files_strip_root_prefix() {
        let task = TaskSpec {
            id: "t1".into(),
            input: serde_json::json!({
                "prompt": "p",
                "files": {
                    "/root/environment/data/x.csv": "/tmp/bench/x.csv",
                    "/root/environment/code": "/tmp/bench/code",
                    "/root/": "/tmp/ignored",
                    "notes.txt": 3
                }
            }),
            agent_args: Value::Null,
        };
        let mut staged = task.staged_files();
        staged.sort();
        assert_eq!(
            staged,
            vec![
                ("environment/code".to_string(), PathBuf::from("/tmp/bench/code")),
                ("environment/data/x.csv".to_string(), PathBuf::from("/tmp/bench/x.csv")),
            ]
        );

        let plain = TaskSpec {
            id: "t2".into(),
            input: serde_json::json!({"prompt": "p"}),
            agent_args: Value::Null,
        };
        assert!(plain.staged_files().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_and_stops_agent() {
        let logs = tempfile::TempDir::new().unwrap();
        let exec = MockExecutor::new(|cmd| {
            if script(cmd).contains("nohup") {
                MockReply::ok("77\n")
            } else {
                MockReply::ok("")
            }
        });
        let outcome = workload(logs.path(), 120)
            .invoke(&exec, "/home/agent", &task())
            .await;
        assert_eq!(
            outcome,
            TaskOutcome::TimedOut {
                after: Duration::from_secs(120)
            }
        );
        assert!(exec
            .calls_to("sh")
            .iter()
            .any(|c| script(c).contains("kill -9")));
        assert_eq!(
            outcome.submission_value(),
            Value::String("TIMEOUT after 120 seconds".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_exit_without_output_is_error() {
        let logs = tempfile::TempDir::new().unwrap();
        let exec = MockExecutor::new(|cmd| {
            let s = script(cmd);
            if s.contains("nohup") {
                MockReply::ok("77\n")
            } else if s.contains("kill -0") {
                MockReply::fail(1, "")
            } else {
                MockReply::ok("")
            }
        });
        let outcome = workload(logs.path(), 7200)
            .invoke(&exec, "/home/agent", &task())
            .await;
        match outcome {
            TaskOutcome::Error(e) => assert!(e.contains("without writing output.json")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_launch_failure_is_error() {
        let logs = tempfile::TempDir::new().unwrap();
        let exec = MockExecutor::new(|cmd| {
            if script(cmd).contains("nohup") {
                MockReply::fail(127, "conda: not found")
            } else {
                MockReply::ok("")
            }
        });
        let outcome = workload(logs.path(), 60)
            .invoke(&exec, "/home/agent", &task())
            .await;
        assert!(matches!(outcome, TaskOutcome::Error(ref e) if e.contains("conda: not found")));
        assert!(outcome.submission_value().as_str().unwrap().starts_with("ERROR: "));
    }

    #[test]
    fn test_load_task_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, r#"{"t1": {"prompt": "a"}, "t2": {"prompt": "b"}}"#).unwrap();
        let tasks = TaskSpec::load_all(&path).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "t1");
        assert!(TaskSpec::load_all(&dir.path().join("missing.json")).is_err());
    }
}
