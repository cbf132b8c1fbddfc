use crate::{CommandResult, CommandSpec, ExecError, Executor};
use async_trait::async_trait;
use russh::*;
use russh_keys::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Extra time the local side waits beyond the remote `timeout` wrapper
/// before giving up on the channel.
const LOCAL_GRACE: Duration = Duration::from_secs(10);
/// Seconds between SIGTERM and SIGKILL on the remote side.
const REMOTE_KILL_AFTER_SECS: u64 = 5;

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Hosts are freshly created and have no known_hosts entry yet
        // (equivalent to StrictHostKeyChecking=no).
        Ok(true)
    }
}

pub struct SshExecutor {
    user: String,
    host: String,
    port: u16,
    key_path: PathBuf,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(user: String, host: String, port: u16, key_path: PathBuf) -> Self {
        Self {
            user,
            host,
            port,
            key_path,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    async fn connect(&self) -> Result<client::Handle<ClientHandler>, ExecError> {
        let config = Arc::new(client::Config::default());

        let connecting = client::connect(config, (self.host.as_str(), self.port), ClientHandler);
        let mut session = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(ExecError::Transport(format!(
                    "SSH connect to {} failed: {}",
                    self.target(),
                    e
                )))
            }
            Err(_) => {
                return Err(ExecError::Transport(format!(
                    "SSH connect to {} timed out after {:?}",
                    self.target(),
                    self.connect_timeout
                )))
            }
        };

        // 加载私钥
        let key_pair = load_secret_key(&self.key_path, None).map_err(|e| {
            ExecError::Transport(format!(
                "cannot load private key {}: {}",
                self.key_path.display(),
                e
            ))
        })?;

        let auth_res = session
            .authenticate_publickey(&self.user, Arc::new(key_pair))
            .await
            .map_err(|e| ExecError::Transport(format!("SSH handshake failed: {}", e)))?;

        if !auth_res {
            return Err(ExecError::Auth {
                user: self.user.clone(),
                host: self.host.clone(),
            });
        }

        Ok(session)
    }

    /// Run `line` remotely, optionally feeding `stdin`, bounded by `timeout`
    /// on both ends.
    async fn exec_line(
        &self,
        line: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        let started = Instant::now();
        let session = self.connect().await?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::Transport(format!("open channel: {}", e)))?;

        let remote_secs = timeout.as_secs().max(1);
        let wrapped = format!(
            "timeout -k {} {} sh -c {}",
            REMOTE_KILL_AFTER_SECS,
            remote_secs,
            crate::quote(line)
        );
        tracing::debug!("[ssh {}] {}", self.target(), line);

        channel
            .exec(true, wrapped)
            .await
            .map_err(|e| ExecError::Transport(format!("exec: {}", e)))?;

        if let Some(data) = stdin {
            channel
                .data(data)
                .await
                .map_err(|e| ExecError::Transport(format!("send stdin: {}", e)))?;
            channel
                .eof()
                .await
                .map_err(|e| ExecError::Transport(format!("send eof: {}", e)))?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: Option<i32> = None;

        let collect = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        stdout.extend_from_slice(data);
                    }
                    ChannelMsg::ExtendedData { ref data, .. } => {
                        stderr.extend_from_slice(data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status as i32);
                    }
                    _ => {}
                }
            }
        };

        let finished = tokio::time::timeout(timeout + LOCAL_GRACE, collect).await.is_ok();
        let _ = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;

        if !finished {
            tracing::warn!(
                "[ssh {}] no exit status after {:.1}s, abandoning channel",
                self.target(),
                (timeout + LOCAL_GRACE).as_secs_f64()
            );
            return Ok(CommandResult::timed_out(started.elapsed()));
        }

        if expired_remotely(exit_code, started.elapsed(), Duration::from_secs(remote_secs)) {
            let mut result = CommandResult::timed_out(started.elapsed());
            result.stdout = String::from_utf8_lossy(&stdout).into_owned();
            return Ok(result);
        }

        Ok(CommandResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: started.elapsed(),
            timed_out: false,
        })
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn run(
        &self,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.exec_line(&command.render(), None, timeout).await
    }

    async fn upload(
        &self,
        contents: &[u8],
        path: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        let write = CommandSpec::shell("mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"").arg(path);
        self.exec_line(&write.render(), Some(contents), timeout).await
    }

    fn name(&self) -> &str {
        "SshExecutor"
    }
}

/// coreutils `timeout` exits 124 on expiry and 137 when it had to SIGKILL.
/// The command itself may exit with either code, so only trust them once
/// the limit has actually passed.
fn expired_remotely(exit_code: Option<i32>, elapsed: Duration, limit: Duration) -> bool {
    matches!(exit_code, Some(124) | Some(137)) && elapsed >= limit
}
