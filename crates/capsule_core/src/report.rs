//! The provisioning report: the one artifact every run produces, even when a
//! mandatory step aborts it.

use crate::package::InstallOutcome;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File name of the report inside the working directory.
pub const REPORT_FILE_NAME: &str = "env_prep_report.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub steps_completed: Vec<String>,
    pub errors: Vec<String>,
    pub tool_availability: BTreeMap<String, bool>,
    #[serde(default)]
    pub system_packages: BTreeMap<String, String>,
    #[serde(default)]
    pub python_packages: BTreeMap<String, String>,
    #[serde(default)]
    pub r_packages: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    /// Name of the mandatory step that aborted the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory_failure: Option<String>,
    /// The host stopped answering; it cannot be reused.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub connection_lost: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProvisioningReport {
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::new()
        }
    }

    pub fn record_success(&mut self, step: &str, summary: &str) {
        if summary.is_empty() {
            self.steps_completed.push(step.to_string());
        } else {
            self.steps_completed.push(format!("{}: {}", step, summary));
        }
    }

    pub fn record_error(&mut self, step: &str, error: &str) {
        self.errors.push(format!("{}: {}", step, error));
    }

    /// Record a failure of a mandatory step. Only the first one is kept as the
    /// abort reason.
    pub fn record_mandatory_failure(&mut self, step: &str, error: &str) {
        self.record_error(step, error);
        if self.mandatory_failure.is_none() {
            self.mandatory_failure = Some(step.to_string());
        }
    }

    /// A transport fault during `step`. Fatal regardless of the step.
    pub fn record_connection_lost(&mut self, step: &str, error: &str) {
        self.connection_lost = true;
        self.record_mandatory_failure(step, error);
    }

    pub fn set_tool(&mut self, tool: &str, available: bool) {
        self.tool_availability.insert(tool.to_string(), available);
    }

    pub fn merge_statuses(
        target: &mut BTreeMap<String, String>,
        outcomes: &BTreeMap<String, InstallOutcome>,
    ) {
        for (name, outcome) in outcomes {
            target.insert(name.clone(), outcome.status.to_string());
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.mandatory_failure.is_none()
    }

    /// Process exit code for this report: non-zero only on mandatory failure.
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize provisioning report")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse provisioning report")
    }

    /// Persist to a local path, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create report directory {}", parent.display())
                })?;
            }
        }
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        tracing::info!("Report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::InstallOutcome;

    #[test]
    fn test_record_success_and_error() {
        let mut r = ProvisioningReport::new();
        r.record_success("workdir", "/home/agent");
        r.record_error("symlinks", "permission denied");
        assert_eq!(r.steps_completed, vec!["workdir: /home/agent"]);
        assert_eq!(r.errors, vec!["symlinks: permission denied"]);
        assert!(r.succeeded());
        assert_eq!(r.exit_code(), 0);
    }

    #[test]
    fn test_mandatory_failure_sets_exit_code() {
        let mut r = ProvisioningReport::new();
        r.record_mandatory_failure("system_packages", "all packages failed");
        r.record_mandatory_failure("later", "ignored as abort reason");
        assert_eq!(r.mandatory_failure.as_deref(), Some("system_packages"));
        assert_eq!(r.errors.len(), 2);
        assert_eq!(r.exit_code(), 1);
    }

    #[test]
    fn test_json_has_contract_keys() {
        let mut r = ProvisioningReport::for_host("vm-1");
        r.set_tool("Rscript", true);
        let mut outcomes = BTreeMap::new();
        outcomes.insert("dplyr".to_string(), InstallOutcome::installed());
        ProvisioningReport::merge_statuses(&mut r.r_packages, &outcomes);
        r.finish();

        let v: serde_json::Value = serde_json::from_str(&r.to_json().unwrap()).unwrap();
        for key in [
            "steps_completed",
            "errors",
            "tool_availability",
            "r_packages",
            "python_packages",
        ] {
            assert!(v.get(key).is_some(), "missing key {}", key);
        }
        assert_eq!(v["r_packages"]["dplyr"], "installed");
        assert_eq!(v["tool_availability"]["Rscript"], true);
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs").join(REPORT_FILE_NAME);
        let mut r = ProvisioningReport::new();
        r.record_success("tool_sweep", "5/8 tools available");
        r.write_to(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back = ProvisioningReport::from_json(&text).unwrap();
        assert_eq!(back.steps_completed, r.steps_completed);
    }
}
