use crate::manager::PackageManager;
use async_trait::async_trait;
use capsule_core::{Ecosystem, PackageSpec};
use capsule_os::{CommandSpec, ExecError, Executor};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct CondaEntry {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct CondaEnvList {
    #[serde(default)]
    envs: Vec<String>,
}

/// Python packages into a named conda environment.
pub struct CondaManager {
    conda_bin: String,
    env_name: String,
    channel: String,
    python_version: String,
    env_ready: AtomicBool,
}

impl CondaManager {
    pub fn new(
        conda_bin: impl Into<String>,
        env_name: impl Into<String>,
        channel: impl Into<String>,
        python_version: impl Into<String>,
    ) -> Self {
        Self {
            conda_bin: conda_bin.into(),
            env_name: env_name.into(),
            channel: channel.into(),
            python_version: python_version.into(),
            env_ready: AtomicBool::new(false),
        }
    }

    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    fn conda(&self) -> CommandSpec {
        CommandSpec::new(&self.conda_bin)
    }

    fn env_exists(&self, env_list_json: &str) -> bool {
        let Ok(list) = serde_json::from_str::<CondaEnvList>(env_list_json) else {
            return false;
        };
        let suffix = format!("/envs/{}", self.env_name);
        list.envs
            .iter()
            .any(|path| path.trim_end_matches('/').ends_with(&suffix))
    }
}

#[async_trait]
impl PackageManager for CondaManager {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Python
    }

    fn tool(&self) -> &str {
        &self.conda_bin
    }

    async fn prepare(&self, executor: &dyn Executor, timeout: Duration) -> Result<(), ExecError> {
        if self.env_ready.load(Ordering::SeqCst) {
            return Ok(());
        }

        let listed = executor
            .run(&self.conda().args(["env", "list", "--json"]), timeout)
            .await?;
        if listed.success() && self.env_exists(&listed.stdout) {
            self.env_ready.store(true, Ordering::SeqCst);
            return Ok(());
        }

        tracing::info!(
            "Creating conda env '{}' (python {})",
            self.env_name,
            self.python_version
        );
        let create = self.conda().args([
            "create".to_string(),
            "-y".to_string(),
            "-q".to_string(),
            "-n".to_string(),
            self.env_name.clone(),
            "-c".to_string(),
            self.channel.clone(),
            format!("python={}", self.python_version),
        ]);
        let created = executor.run(&create, timeout).await?;
        if created.success() {
            self.env_ready.store(true, Ordering::SeqCst);
        } else {
            tracing::warn!(
                "conda env '{}' could not be created: {}",
                self.env_name,
                created.error_excerpt(300)
            );
        }
        Ok(())
    }

    fn list_installed(&self) -> CommandSpec {
        self.conda()
            .args(["list", "-n", self.env_name.as_str(), "--json"])
    }

    fn parse_installed(&self, stdout: &str) -> HashMap<String, String> {
        match serde_json::from_str::<Vec<CondaEntry>>(stdout) {
            Ok(entries) => entries
                .into_iter()
                .map(|e| (e.name.to_lowercase(), e.version))
                .collect(),
            Err(e) => {
                tracing::debug!("unparseable conda list output: {}", e);
                HashMap::new()
            }
        }
    }

    fn install(&self, packages: &[PackageSpec]) -> CommandSpec {
        let mut cmd = self.conda().args([
            "install",
            "-y",
            "-q",
            "-n",
            self.env_name.as_str(),
            "-c",
            self.channel.as_str(),
        ]);
        for p in packages {
            cmd = cmd.arg(p.to_string());
        }
        cmd
    }

    fn validate(&self, package: &PackageSpec) -> Result<(), String> {
        let ok = package
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
            && !package.name.starts_with('-');
        if ok {
            Ok(())
        } else {
            Err(format!("invalid python package name '{}'", package.name))
        }
    }
}
