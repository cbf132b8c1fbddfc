use async_trait::async_trait;
use capsule_core::{Ecosystem, PackageSpec};
use capsule_os::{CommandSpec, ExecError, Executor};
use std::collections::HashMap;
use std::time::Duration;

/// Command vocabulary of one package ecosystem.
#[async_trait]
pub trait PackageManager: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    /// Binary that must exist on the target for anything else to work.
    fn tool(&self) -> &str;

    fn probe(&self) -> CommandSpec {
        CommandSpec::shell("command -v \"$1\"").arg(self.tool())
    }

    /// One-time setup before the first install (index refresh, env creation).
    /// Implementations cache the fact that it ran.
    async fn prepare(&self, _executor: &dyn Executor, _timeout: Duration) -> Result<(), ExecError> {
        Ok(())
    }

    /// Lists installed packages in one call.
    fn list_installed(&self) -> CommandSpec;

    /// name → version of everything installed.
    fn parse_installed(&self, stdout: &str) -> HashMap<String, String>;

    /// Install command for one or many packages.
    fn install(&self, packages: &[PackageSpec]) -> CommandSpec;

    /// Reject names that cannot be passed safely to this ecosystem.
    fn validate(&self, _package: &PackageSpec) -> Result<(), String> {
        Ok(())
    }
}
