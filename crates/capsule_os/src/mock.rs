//! Mock executor with scripted replies, for tests without a host.

use crate::{CommandResult, CommandSpec, ExecError, Executor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// What the mock answers for one command.
#[derive(Debug, Clone)]
pub enum MockReply {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    /// Simulate losing the connection.
    Transport(String),
}

impl MockReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        MockReply::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        MockReply::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

type Handler = Box<dyn Fn(&CommandSpec) -> MockReply + Send + Sync>;

pub struct MockExecutor {
    handler: Handler,
    history: Mutex<Vec<CommandSpec>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> MockReply + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            history: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Every command succeeds with empty output.
    pub fn succeeding() -> Self {
        Self::new(|_| MockReply::ok(""))
    }

    pub fn history(&self) -> Vec<CommandSpec> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Commands whose program is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.history()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().ok().and_then(|f| f.get(path).cloned())
    }

    pub fn put_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.to_string(), contents.into());
        }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn run(
        &self,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        if let Ok(mut h) = self.history.lock() {
            h.push(command.clone());
        }
        match (self.handler)(command) {
            MockReply::Exit {
                code,
                stdout,
                stderr,
            } => Ok(CommandResult::new(code, stdout, stderr)),
            MockReply::TimedOut => Ok(CommandResult::timed_out(timeout)),
            MockReply::Transport(msg) => Err(ExecError::Transport(msg)),
        }
    }

    async fn upload(
        &self,
        contents: &[u8],
        path: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.put_file(path, contents.to_vec());
        Ok(CommandResult::new(0, "", ""))
    }

    async fn read_file(&self, path: &str, _timeout: Duration) -> Result<Option<String>, ExecError> {
        Ok(self
            .file(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn name(&self) -> &str {
        "MockExecutor"
    }
}
