pub mod command;
pub mod local;
pub mod mock;
pub mod ssh;

pub use capsule_core::CommandResult;
pub use command::{quote, CommandSpec};
pub use local::LocalExecutor;
pub use mock::{MockExecutor, MockReply};
pub use ssh::SshExecutor;

use async_trait::async_trait;
use std::time::Duration;

/// Transport-level faults. Everything else, including non-zero exits and
/// timeouts, is reported through [`CommandResult`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("cannot reach host: {0}")]
    Transport(String),
    #[error("authentication rejected for {user}@{host}")]
    Auth { user: String, host: String },
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executor trait 定义了执行系统命令的能力
///
/// Implementors:
/// - `LocalExecutor`: 在本地直接执行 (local root shell)
/// - `SshExecutor`: 通过 SSH 远程执行
/// - `MockExecutor`: scripted replies for tests
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one command, terminating it once `timeout` elapses.
    async fn run(&self, command: &CommandSpec, timeout: Duration)
        -> Result<CommandResult, ExecError>;

    /// Write `contents` to `path` on the target, creating parent directories.
    async fn upload(
        &self,
        contents: &[u8],
        path: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Read a text file from the target. `None` when it cannot be read.
    async fn read_file(&self, path: &str, timeout: Duration) -> Result<Option<String>, ExecError> {
        let result = self
            .run(&CommandSpec::new("cat").arg(path), timeout)
            .await?;
        Ok(result.success().then_some(result.stdout))
    }

    /// 获取 Executor 类型名称 (用于日志)
    fn name(&self) -> &str;
}

/// Parent directory of a slash-separated path, if it has one.
pub(crate) fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => None,
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
