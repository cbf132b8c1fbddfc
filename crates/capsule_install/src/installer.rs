use crate::manager::PackageManager;
use capsule_core::config::InstallConfig;
use capsule_core::{Ecosystem, InstallOutcome, InstallStatus, PackageSpec};
use capsule_os::{ExecError, Executor};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Policy
// ============================================================================

/// Stop installing once failures are both numerous and a large share of
/// the requested set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbortPolicy {
    pub min_failures: usize,
    pub fraction: f64,
}

impl Default for AbortPolicy {
    fn default() -> Self {
        Self {
            min_failures: 5,
            fraction: 0.3,
        }
    }
}

impl AbortPolicy {
    pub fn should_abort(&self, failures: usize, requested: usize) -> bool {
        requested > 0
            && failures >= self.min_failures
            && failures as f64 / requested as f64 >= self.fraction
    }
}

#[derive(Debug, Clone)]
pub struct InstallPolicy {
    pub timeout_per_package: Duration,
    pub max_batch_timeout: Duration,
    pub presence_timeout: Duration,
    pub abort: AbortPolicy,
    pub excerpt_chars: usize,
}

impl Default for InstallPolicy {
    fn default() -> Self {
        Self::from(&InstallConfig::default())
    }
}

impl From<&InstallConfig> for InstallPolicy {
    fn from(config: &InstallConfig) -> Self {
        Self {
            timeout_per_package: Duration::from_secs(config.timeout_per_package_secs),
            max_batch_timeout: Duration::from_secs(config.max_batch_timeout_secs),
            presence_timeout: Duration::from_secs(config.presence_timeout_secs),
            abort: AbortPolicy {
                min_failures: config.abort_min_failures,
                fraction: config.abort_fraction,
            },
            excerpt_chars: config.excerpt_chars,
        }
    }
}

impl InstallPolicy {
    /// Per-package budget scaled by batch size, capped.
    pub fn batch_timeout(&self, count: usize) -> Duration {
        self.timeout_per_package
            .saturating_mul(count.max(1) as u32)
            .min(self.max_batch_timeout)
    }
}

// ============================================================================
// Report
// ============================================================================

/// Terminal outcome of every requested package.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub ecosystem: Ecosystem,
    pub outcomes: BTreeMap<String, InstallOutcome>,
    pub aborted: bool,
}

impl InstallReport {
    pub fn new(ecosystem: Ecosystem) -> Self {
        Self {
            ecosystem,
            outcomes: BTreeMap::new(),
            aborted: false,
        }
    }

    fn set(&mut self, package: &PackageSpec, outcome: InstallOutcome) {
        self.outcomes.insert(package.name.clone(), outcome);
    }

    pub fn count(&self, status: InstallStatus) -> usize {
        self.outcomes.values().filter(|o| o.status == status).count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| !o.status.is_success())
            .count()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.status.is_success())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// True when something was requested and nothing succeeded.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(|o| !o.status.is_success())
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "{} installed, {} already present, {} failed, {} timed out",
            self.count(InstallStatus::Installed),
            self.count(InstallStatus::AlreadyPresent),
            self.count(InstallStatus::Failed),
            self.count(InstallStatus::TimedOut),
        );
        if self.aborted {
            text.push_str(" (aborted)");
        }
        text
    }
}

// ============================================================================
// Installer
// ============================================================================

/// Drives one [`PackageManager`] over an executor.
///
/// Pipeline: dedupe → validate → probe tool → presence check → one batch
/// install → re-check presence → per-package fallback under the abort policy.
/// Every requested name ends in exactly one terminal state. Only transport
/// failures surface as errors.
pub struct PackageInstaller {
    executor: Arc<dyn Executor>,
    policy: InstallPolicy,
}

impl PackageInstaller {
    pub fn new(executor: Arc<dyn Executor>, policy: InstallPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> &InstallPolicy {
        &self.policy
    }

    pub async fn install(
        &self,
        manager: &dyn PackageManager,
        requested: &[PackageSpec],
    ) -> Result<InstallReport, ExecError> {
        let mut report = InstallReport::new(manager.ecosystem());

        let mut seen = HashSet::new();
        let packages: Vec<PackageSpec> = requested
            .iter()
            .filter(|p| seen.insert(p.name.clone()))
            .cloned()
            .collect();
        if packages.is_empty() {
            return Ok(report);
        }
        let requested_count = packages.len();
        let ecosystem = manager.ecosystem();

        let mut candidates = Vec::with_capacity(packages.len());
        for package in packages {
            match manager.validate(&package) {
                Ok(()) => candidates.push(package),
                Err(reason) => {
                    tracing::warn!("[{}] {}", ecosystem, reason);
                    report.set(&package, InstallOutcome::failed(reason));
                }
            }
        }
        if candidates.is_empty() {
            return Ok(report);
        }

        let probe = self
            .executor
            .run(&manager.probe(), self.policy.presence_timeout)
            .await?;
        if !probe.success() {
            let reason = format!("{} is not available on the host", manager.tool());
            tracing::error!("[{}] {}", ecosystem, reason);
            for package in &candidates {
                report.set(package, InstallOutcome::failed(reason.clone()));
            }
            return Ok(report);
        }

        manager
            .prepare(self.executor.as_ref(), self.policy.timeout_per_package)
            .await?;

        // Presence
        let installed = self.installed(manager).await?;
        let mut pending = Vec::new();
        for package in candidates {
            if is_present(&installed, &package) {
                report.set(&package, InstallOutcome::already_present());
            } else {
                pending.push(package);
            }
        }
        tracing::info!(
            "[{}] {} requested, {} already present, {} to install",
            ecosystem,
            requested_count,
            report.count(InstallStatus::AlreadyPresent),
            pending.len()
        );
        if pending.is_empty() {
            return Ok(report);
        }

        // Batch
        if pending.len() > 1 {
            let timeout = self.policy.batch_timeout(pending.len());
            let result = self.executor.run(&manager.install(&pending), timeout).await?;
            if result.success() {
                for package in &pending {
                    report.set(package, InstallOutcome::installed());
                }
                return Ok(report);
            }
            tracing::warn!(
                "[{}] batch install of {} packages did not succeed ({}), falling back to one at a time",
                ecosystem,
                pending.len(),
                result.describe()
            );

            // A failed batch may still have installed some of the set.
            let installed = self.installed(manager).await?;
            pending.retain(|package| {
                if is_present(&installed, package) {
                    report.set(package, InstallOutcome::installed());
                    false
                } else {
                    true
                }
            });
        }

        // Individual fallback
        let mut failures = report.failures();
        for (idx, package) in pending.iter().enumerate() {
            if self.policy.abort.should_abort(failures, requested_count) {
                tracing::error!(
                    "[{}] aborting after {} of {} packages failed, skipping {}",
                    ecosystem,
                    failures,
                    requested_count,
                    pending.len() - idx
                );
                let reason = format!("not attempted: install aborted after {} failures", failures);
                for rest in &pending[idx..] {
                    report.set(rest, InstallOutcome::failed(reason.clone()));
                }
                report.aborted = true;
                break;
            }

            let result = self
                .executor
                .run(
                    &manager.install(std::slice::from_ref(package)),
                    self.policy.timeout_per_package,
                )
                .await?;
            let outcome = if result.timed_out {
                InstallOutcome::timed_out(format!(
                    "timed out after {}s",
                    self.policy.timeout_per_package.as_secs()
                ))
            } else if result.success() {
                InstallOutcome::installed()
            } else {
                InstallOutcome::failed(result.error_excerpt(self.policy.excerpt_chars))
            };
            if outcome.status.is_success() {
                tracing::info!("[{}] installed {}", ecosystem, package);
            } else {
                failures += 1;
                tracing::warn!("[{}] {} {}", ecosystem, package, outcome.status);
            }
            report.set(package, outcome);
        }

        Ok(report)
    }

    /// Installed name → version. A failed listing counts as nothing installed.
    async fn installed(
        &self,
        manager: &dyn PackageManager,
    ) -> Result<HashMap<String, String>, ExecError> {
        let result = self
            .executor
            .run(&manager.list_installed(), self.policy.presence_timeout)
            .await?;
        if !result.success() {
            tracing::warn!(
                "[{}] could not list installed packages: {}",
                manager.ecosystem(),
                result.describe()
            );
            return Ok(HashMap::new());
        }
        Ok(manager.parse_installed(&result.stdout))
    }
}

fn is_present(installed: &HashMap<String, String>, package: &PackageSpec) -> bool {
    installed
        .get(&package.name)
        .or_else(|| installed.get(&package.name.to_lowercase()))
        .map(|version| package.satisfied_by(version))
        .unwrap_or(false)
}
