use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use capsule_core::config::{CapsuleConfig, PrepConfig};
use capsule_core::{CommandResult, ProvisioningReport};
use capsule_install::{InstallPolicy, PackageInstaller};
use capsule_os::{CommandSpec, ExecError, Executor};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// State threaded through the preparation steps.
pub struct PrepContext {
    pub executor: Arc<dyn Executor>,
    pub config: PrepConfig,
    pub install_policy: InstallPolicy,
    pub command_timeout: Duration,
    /// Resolved by the `workdir` step; every later command runs there.
    pub workdir: Option<String>,
    pub home: Option<String>,
    /// Exported to every later command (e.g. `DISPLAY`).
    pub env: BTreeMap<String, String>,
    /// R packages found in the uploaded sources.
    pub detected_r_packages: Vec<String>,
    pub report: ProvisioningReport,
}

impl PrepContext {
    pub fn new(executor: Arc<dyn Executor>, config: &CapsuleConfig) -> Self {
        Self {
            executor,
            config: config.prep.clone(),
            install_policy: InstallPolicy::from(&config.install),
            command_timeout: config.ssh.command_timeout(),
            workdir: None,
            home: None,
            env: BTreeMap::new(),
            detected_r_packages: Vec::new(),
            report: ProvisioningReport::new(),
        }
    }

    pub fn workdir(&self) -> Result<&str> {
        self.workdir
            .as_deref()
            .context("working directory has not been prepared")
    }

    /// Executor bound to the current working directory and environment.
    pub fn scoped_executor(&self) -> Arc<dyn Executor> {
        Arc::new(ScopedExecutor {
            inner: self.executor.clone(),
            cwd: self.workdir.clone(),
            env: self.env.clone(),
        })
    }

    pub fn installer(&self) -> PackageInstaller {
        PackageInstaller::new(self.scoped_executor(), self.install_policy.clone())
    }

    /// Run in the working directory with the exported environment.
    pub async fn run(&self, command: CommandSpec) -> Result<CommandResult> {
        let command = command
            .with_default_cwd(self.workdir.as_deref())
            .with_default_env(&self.env);
        let result = self.executor.run(&command, self.command_timeout).await?;
        Ok(result)
    }

    /// Like [`run`](Self::run), but a non-zero exit or timeout is an error.
    pub async fn run_checked(&self, command: CommandSpec, what: &str) -> Result<CommandResult> {
        let result = self.run(command).await?;
        if !result.success() {
            bail!(
                "{} failed ({}): {}",
                what,
                result.describe(),
                result.error_excerpt(capsule_core::DEFAULT_EXCERPT_CHARS)
            );
        }
        Ok(result)
    }
}

struct ScopedExecutor {
    inner: Arc<dyn Executor>,
    cwd: Option<String>,
    env: BTreeMap<String, String>,
}

#[async_trait]
impl Executor for ScopedExecutor {
    async fn run(
        &self,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        let command = command
            .clone()
            .with_default_cwd(self.cwd.as_deref())
            .with_default_env(&self.env);
        self.inner.run(&command, timeout).await
    }

    async fn upload(
        &self,
        contents: &[u8],
        path: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.inner.upload(contents, path, timeout).await
    }

    async fn read_file(&self, path: &str, timeout: Duration) -> Result<Option<String>, ExecError> {
        self.inner.read_file(path, timeout).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
