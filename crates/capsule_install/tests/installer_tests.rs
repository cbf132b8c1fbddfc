//! Installer pipeline against a simulated package database.

use capsule_core::{Ecosystem, InstallStatus, PackageSpec};
use capsule_install::{AptManager, InstallPolicy, PackageInstaller};
use capsule_os::{CommandSpec, MockExecutor, MockReply};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

/// A host whose dpkg database lives in memory.
#[derive(Default)]
struct FakeHost {
    installed: Mutex<BTreeMap<String, String>>,
    broken: HashSet<String>,
    slow: HashSet<String>,
    partial_batch: bool,
}

impl FakeHost {
    fn with_installed(names: &[&str]) -> Self {
        let host = Self::default();
        for name in names {
            host.installed
                .lock()
                .unwrap()
                .insert(name.to_string(), "1.0-1".to_string());
        }
        host
    }

    fn broken(mut self, names: &[&str]) -> Self {
        self.broken.extend(names.iter().map(|s| s.to_string()));
        self
    }

    fn slow(mut self, names: &[&str]) -> Self {
        self.slow.extend(names.iter().map(|s| s.to_string()));
        self
    }

    fn reply(&self, cmd: &CommandSpec) -> MockReply {
        match cmd.program.as_str() {
            "sh" => MockReply::ok("/usr/bin/apt-get"),
            "dpkg-query" => {
                let listing: String = self
                    .installed
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(n, v)| format!("{}\t{}\tinstalled\n", n, v))
                    .collect();
                MockReply::ok(listing)
            }
            "apt-get" if cmd.args.first().map(String::as_str) == Some("update") => MockReply::ok(""),
            "apt-get" => {
                let names: Vec<String> = cmd
                    .args
                    .iter()
                    .skip(1)
                    .filter(|a| !a.starts_with('-'))
                    .map(|a| a.split('=').next().unwrap_or(a).to_string())
                    .collect();
                if names.iter().any(|n| self.slow.contains(n)) {
                    return MockReply::TimedOut;
                }
                let bad: Vec<&String> = names.iter().filter(|n| self.broken.contains(*n)).collect();
                if !bad.is_empty() {
                    if self.partial_batch {
                        let mut db = self.installed.lock().unwrap();
                        for n in names.iter().filter(|n| !self.broken.contains(*n)) {
                            db.insert(n.clone(), "1.0-1".to_string());
                        }
                    }
                    return MockReply::fail(100, format!("E: Unable to locate package {}", bad[0]));
                }
                let mut db = self.installed.lock().unwrap();
                for n in names {
                    db.insert(n, "1.0-1".to_string());
                }
                MockReply::ok("")
            }
            _ => MockReply::fail(127, "not found"),
        }
    }
}

fn setup(host: FakeHost) -> (Arc<MockExecutor>, PackageInstaller) {
    let host = Arc::new(host);
    let exec = Arc::new(MockExecutor::new(move |cmd| host.reply(cmd)));
    let installer = PackageInstaller::new(exec.clone(), InstallPolicy::default());
    (exec, installer)
}

fn specs(names: &[&str]) -> Vec<PackageSpec> {
    names
        .iter()
        .map(|n| PackageSpec::new(*n, Ecosystem::System))
        .collect()
}

fn install_calls(exec: &MockExecutor) -> Vec<CommandSpec> {
    exec.calls_to("apt-get")
        .into_iter()
        .filter(|c| c.args.first().map(String::as_str) == Some("install"))
        .collect()
}

#[tokio::test]
async fn test_presence_is_partitioned_before_install() {
    let (exec, installer) = setup(FakeHost::with_installed(&["git", "curl"]));
    let apt = AptManager::new(false);
    let report = installer
        .install(&apt, &specs(&["git", "curl", "pandoc", "xvfb"]))
        .await
        .unwrap();

    assert_eq!(report.outcomes["git"].status, InstallStatus::AlreadyPresent);
    assert_eq!(report.outcomes["curl"].status, InstallStatus::AlreadyPresent);
    assert_eq!(report.outcomes["pandoc"].status, InstallStatus::Installed);
    assert_eq!(report.outcomes["xvfb"].status, InstallStatus::Installed);

    let calls = install_calls(&exec);
    assert_eq!(calls.len(), 1, "one batch command expected");
    assert!(!calls[0].args.contains(&"git".to_string()));
}

#[tokio::test]
async fn test_second_run_is_all_present() {
    let (exec, installer) = setup(FakeHost::default());
    let apt = AptManager::new(false);
    let wanted = specs(&["pandoc", "xvfb", "imagemagick"]);

    installer.install(&apt, &wanted).await.unwrap();
    let first = install_calls(&exec).len();
    let report = installer.install(&apt, &wanted).await.unwrap();

    assert_eq!(install_calls(&exec).len(), first);
    assert_eq!(report.count(InstallStatus::AlreadyPresent), 3);
}

#[tokio::test]
async fn test_failed_batch_falls_back_per_package() {
    let (exec, installer) = setup(FakeHost::default().broken(&["nosuchpkg"]));
    let apt = AptManager::new(false);
    let report = installer
        .install(&apt, &specs(&["pandoc", "nosuchpkg", "xvfb"]))
        .await
        .unwrap();

    assert_eq!(report.outcomes["pandoc"].status, InstallStatus::Installed);
    assert_eq!(report.outcomes["xvfb"].status, InstallStatus::Installed);
    let failed = &report.outcomes["nosuchpkg"];
    assert_eq!(failed.status, InstallStatus::Failed);
    assert!(failed
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Unable to locate package"));
    // batch + three individual installs
    assert_eq!(install_calls(&exec).len(), 4);
    assert!(!report.aborted);
}

#[tokio::test]
async fn test_partial_batch_is_credited_after_recheck() {
    let mut host = FakeHost::default().broken(&["nosuchpkg"]);
    host.partial_batch = true;
    let (exec, installer) = setup(host);
    let apt = AptManager::new(false);
    let report = installer
        .install(&apt, &specs(&["pandoc", "nosuchpkg", "xvfb"]))
        .await
        .unwrap();

    assert_eq!(report.outcomes["pandoc"].status, InstallStatus::Installed);
    assert_eq!(report.outcomes["nosuchpkg"].status, InstallStatus::Failed);
    // batch + only the one still missing
    assert_eq!(install_calls(&exec).len(), 2);
}

#[tokio::test]
async fn test_four_failures_in_ten_continue() {
    let names = ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8", "a9"];
    let (exec, installer) = setup(FakeHost::default().broken(&["a0", "a1", "a2", "a3"]));
    let apt = AptManager::new(false);
    let report = installer.install(&apt, &specs(&names)).await.unwrap();

    assert!(!report.aborted);
    assert_eq!(report.count(InstallStatus::Failed), 4);
    assert_eq!(report.count(InstallStatus::Installed), 6);
    assert_eq!(install_calls(&exec).len(), 1 + 10);
}

#[tokio::test]
async fn test_six_failures_in_ten_abort_remaining() {
    let names = ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8", "a9"];
    let (exec, installer) =
        setup(FakeHost::default().broken(&["a0", "a1", "a2", "a3", "a4", "a5"]));
    let apt = AptManager::new(false);
    let report = installer.install(&apt, &specs(&names)).await.unwrap();

    assert!(report.aborted);
    assert_eq!(report.outcomes.len(), 10);
    // abort fires once the fifth failure is recorded
    assert_eq!(install_calls(&exec).len(), 1 + 5);
    for name in &names[5..] {
        let outcome = &report.outcomes[*name];
        assert_eq!(outcome.status, InstallStatus::Failed);
        assert!(outcome.error.as_deref().unwrap_or_default().starts_with("not attempted"));
    }
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let (_exec, installer) = setup(FakeHost::default().slow(&["texlive-full"]));
    let apt = AptManager::new(false);
    let report = installer
        .install(&apt, &specs(&["texlive-full", "pandoc"]))
        .await
        .unwrap();

    assert_eq!(report.outcomes["texlive-full"].status, InstallStatus::TimedOut);
    assert_eq!(report.outcomes["pandoc"].status, InstallStatus::Installed);
    assert_eq!(report.failures(), 1);
}

#[tokio::test]
async fn test_missing_tool_fails_everything() {
    let exec = Arc::new(MockExecutor::new(|cmd| match cmd.program.as_str() {
        "sh" => MockReply::fail(1, ""),
        _ => MockReply::ok(""),
    }));
    let installer = PackageInstaller::new(exec.clone(), InstallPolicy::default());
    let report = installer
        .install(&AptManager::new(false), &specs(&["git", "pandoc"]))
        .await
        .unwrap();

    assert!(report.all_failed());
    assert_eq!(exec.history().len(), 1);
}

#[tokio::test]
async fn test_duplicates_and_invalid_names() {
    let (exec, installer) = setup(FakeHost::default());
    let apt = AptManager::new(false);
    let report = installer
        .install(&apt, &specs(&["pandoc", "pandoc", "bad name"]))
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes["bad name"].status, InstallStatus::Failed);
    assert_eq!(report.outcomes["pandoc"].status, InstallStatus::Installed);
    // single pending package skips the batch
    assert_eq!(install_calls(&exec).len(), 1);
}

#[tokio::test]
async fn test_transport_loss_is_an_error() {
    let exec = Arc::new(MockExecutor::new(|_| MockReply::Transport("reset".into())));
    let installer = PackageInstaller::new(exec, InstallPolicy::default());
    let result = installer
        .install(&AptManager::new(false), &specs(&["git"]))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_empty_request_runs_nothing() {
    let (exec, installer) = setup(FakeHost::default());
    let report = installer.install(&AptManager::new(false), &[]).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert!(exec.history().is_empty());
}
