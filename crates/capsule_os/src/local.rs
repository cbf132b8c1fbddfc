use crate::{parent_dir, CommandResult, CommandSpec, ExecError, Executor};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Runs commands on this machine, typically the root shell of a container.
#[derive(Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(
        &self,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        tracing::debug!("[local] {}", command);
        let started = Instant::now();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        // Own group, so a timeout also reaches whatever the command forked.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                // Same shape a shell reports for a missing binary.
                return Ok(CommandResult::new(
                    127,
                    "",
                    format!("failed to spawn '{}': {}", command.program, e),
                )
                .with_duration(started.elapsed()));
            }
        };

        let pgid = child.id();
        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandResult {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration: started.elapsed(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(ExecError::Io(e)),
            Err(_) => {
                if let Some(pgid) = pgid {
                    kill_group(pgid);
                }
                tracing::warn!(
                    "Command '{}' timed out after {:.1}s, killed",
                    command.program,
                    timeout.as_secs_f64()
                );
                Ok(CommandResult::timed_out(started.elapsed()))
            }
        }
    }

    async fn upload(
        &self,
        contents: &[u8],
        path: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        let started = Instant::now();
        let write = async {
            if let Some(dir) = parent_dir(path) {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(path, contents).await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(CommandResult::new(0, "", "").with_duration(started.elapsed())),
            Ok(Err(e)) => Ok(CommandResult::new(1, "", format!("write {}: {}", path, e))
                .with_duration(started.elapsed())),
            Err(_) => Ok(CommandResult::timed_out(started.elapsed())),
        }
    }

    async fn read_file(&self, path: &str, _timeout: Duration) -> Result<Option<String>, ExecError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                tracing::debug!("read {} failed: {}", path, e);
                Ok(None)
            }
        }
    }

    fn name(&self) -> &str {
        "LocalExecutor"
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    // SAFETY: killpg only sends a signal; a stale group id yields ESRCH.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!("killpg({}) failed: {}", pgid, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}
