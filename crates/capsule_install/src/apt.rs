use crate::manager::PackageManager;
use async_trait::async_trait;
use capsule_core::{Ecosystem, PackageSpec};
use capsule_os::{CommandSpec, ExecError, Executor};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;
use std::time::Duration;

static APT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.\-]*(:[a-z0-9]+)?$").unwrap());

/// Debian/Ubuntu system packages via `apt-get`, with `dpkg-query` for presence.
pub struct AptManager {
    use_sudo: bool,
    index_refreshed: AtomicBool,
}

impl AptManager {
    pub fn new(use_sudo: bool) -> Self {
        Self {
            use_sudo,
            index_refreshed: AtomicBool::new(false),
        }
    }

    /// `apt-get <args>` non-interactively, through `sudo -n env` when needed.
    fn apt_get(&self, args: &[&str]) -> CommandSpec {
        if self.use_sudo {
            CommandSpec::new("sudo")
                .args(["-n", "env", "DEBIAN_FRONTEND=noninteractive", "apt-get"])
                .args(args.iter().copied())
        } else {
            CommandSpec::new("apt-get")
                .args(args.iter().copied())
                .env("DEBIAN_FRONTEND", "noninteractive")
        }
    }
}

#[async_trait]
impl PackageManager for AptManager {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::System
    }

    fn tool(&self) -> &str {
        "apt-get"
    }

    async fn prepare(&self, executor: &dyn Executor, timeout: Duration) -> Result<(), ExecError> {
        if self.index_refreshed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = executor.run(&self.apt_get(&["update", "-q"]), timeout).await?;
        if result.success() {
            self.index_refreshed.store(true, Ordering::SeqCst);
        } else {
            // Installs may still succeed from a stale index.
            tracing::warn!("apt-get update failed: {}", result.error_excerpt(300));
        }
        Ok(())
    }

    fn list_installed(&self) -> CommandSpec {
        CommandSpec::new("dpkg-query")
            .arg("-W")
            .arg("--showformat=${Package}\\t${Version}\\t${db:Status-Status}\\n")
    }

    fn parse_installed(&self, stdout: &str) -> HashMap<String, String> {
        stdout
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let name = fields.next()?.trim();
                let version = fields.next()?.trim();
                let status = fields.next().unwrap_or("installed").trim();
                (status == "installed" && !name.is_empty())
                    .then(|| (name.to_string(), version.to_string()))
            })
            .collect()
    }

    fn install(&self, packages: &[PackageSpec]) -> CommandSpec {
        let mut args = vec!["install", "-y", "-q", "--no-install-recommends"];
        let specs: Vec<String> = packages.iter().map(|p| p.to_string()).collect();
        args.extend(specs.iter().map(String::as_str));
        self.apt_get(&args)
    }

    fn validate(&self, package: &PackageSpec) -> Result<(), String> {
        if APT_NAME.is_match(&package.name) {
            Ok(())
        } else {
            Err(format!("invalid system package name '{}'", package.name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_os::{MockExecutor, MockReply};

    #[test]
    fn test_parse_installed_skips_non_installed() {
        let apt = AptManager::new(false);
        let out = "git\t1:2.34.1-1ubuntu1\tinstalled\n\
                   pandoc\t2.9.2.1-3\tconfig-files\n\
                   xvfb\t2:21.1.4-2ubuntu1\tinstalled\n";
        let map = apt.parse_installed(out);
        assert_eq!(map.len(), 2);
        assert_eq!(map["git"], "1:2.34.1-1ubuntu1");
        assert!(!map.contains_key("pandoc"));
    }

    #[test]
    fn test_install_command_with_sudo() {
        let apt = AptManager::new(true);
        let pkgs = vec![
            PackageSpec::new("git", Ecosystem::System),
            PackageSpec::new("pandoc", Ecosystem::System).with_version("2.9.2.1-3"),
        ];
        let cmd = apt.install(&pkgs);
        assert_eq!(cmd.program, "sudo");
        assert_eq!(&cmd.args[..4], &["-n", "env", "DEBIAN_FRONTEND=noninteractive", "apt-get"]);
        assert!(cmd.args.contains(&"git".to_string()));
        assert!(cmd.args.contains(&"pandoc=2.9.2.1-3".to_string()));
    }

    #[test]
    fn test_install_command_without_sudo_sets_env() {
        let apt = AptManager::new(false);
        let cmd = apt.install(&[PackageSpec::new("git", Ecosystem::System)]);
        assert_eq!(cmd.program, "apt-get");
        assert_eq!(
            cmd.env.get("DEBIAN_FRONTEND").map(String::as_str),
            Some("noninteractive")
        );
    }

    #[test]
    fn test_validate_rejects_shell_metacharacters() {
        let apt = AptManager::new(false);
        assert!(apt.validate(&PackageSpec::new("libxml2-dev", Ecosystem::System)).is_ok());
        assert!(apt.validate(&PackageSpec::new("g++", Ecosystem::System)).is_ok());
        assert!(apt.validate(&PackageSpec::new("git; rm -rf /", Ecosystem::System)).is_err());
        assert!(apt.validate(&PackageSpec::new("Git", Ecosystem::System)).is_err());
    }

    #[tokio::test]
    async fn test_index_refresh_runs_once() {
        let exec = MockExecutor::new(|_| MockReply::ok(""));
        let apt = AptManager::new(false);
        let t = Duration::from_secs(5);
        apt.prepare(&exec, t).await.unwrap();
        apt.prepare(&exec, t).await.unwrap();
        assert_eq!(exec.calls_to("apt-get").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_retried() {
        let exec = MockExecutor::new(|_| MockReply::fail(100, "could not resolve archive"));
        let apt = AptManager::new(false);
        let t = Duration::from_secs(5);
        apt.prepare(&exec, t).await.unwrap();
        apt.prepare(&exec, t).await.unwrap();
        assert_eq!(exec.calls_to("apt-get").len(), 2);
    }
}
