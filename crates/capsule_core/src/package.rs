use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of package ecosystems the installer knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ecosystem {
    /// apt / dpkg
    System,
    /// conda environment
    Python,
    /// CRAN via Rscript
    Statistical,
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ecosystem::System => "system",
            Ecosystem::Python => "python",
            Ecosystem::Statistical => "statistical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub ecosystem: Ecosystem,
    /// Version constraint, matched as a prefix of the installed version.
    pub version: Option<String>,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, ecosystem: Ecosystem) -> Self {
        Self {
            name: name.into(),
            ecosystem,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Parse `name`, `name=version` or `name==version`.
    pub fn parse(raw: &str, ecosystem: Ecosystem) -> Self {
        let raw = raw.trim();
        match raw.split_once('=') {
            Some((name, version)) => {
                let version = version.trim_start_matches('=').trim();
                let spec = Self::new(name.trim(), ecosystem);
                if version.is_empty() {
                    spec
                } else {
                    spec.with_version(version)
                }
            }
            None => Self::new(raw, ecosystem),
        }
    }

    pub fn parse_all<S: AsRef<str>>(raw: &[S], ecosystem: Ecosystem) -> Vec<Self> {
        raw.iter()
            .map(|s| Self::parse(s.as_ref(), ecosystem))
            .filter(|p| !p.name.is_empty())
            .collect()
    }

    /// Whether an installed version satisfies this spec's constraint.
    pub fn satisfied_by(&self, installed_version: &str) -> bool {
        match &self.version {
            None => true,
            Some(wanted) => installed_version.starts_with(wanted.as_str()),
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Terminal state of one package after an install run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    AlreadyPresent,
    Installed,
    Failed,
    TimedOut,
}

impl InstallStatus {
    pub fn is_success(self) -> bool {
        matches!(self, InstallStatus::AlreadyPresent | InstallStatus::Installed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstallStatus::AlreadyPresent => "already_present",
            InstallStatus::Installed => "installed",
            InstallStatus::Failed => "failed",
            InstallStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub status: InstallStatus,
    /// Bounded stderr tail, present for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstallOutcome {
    pub fn already_present() -> Self {
        Self {
            status: InstallStatus::AlreadyPresent,
            error: None,
        }
    }

    pub fn installed() -> Self {
        Self {
            status: InstallStatus::Installed,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: InstallStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn timed_out(error: impl Into<String>) -> Self {
        Self {
            status: InstallStatus::TimedOut,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_name() {
        let p = PackageSpec::parse("dplyr", Ecosystem::Statistical);
        assert_eq!(p.name, "dplyr");
        assert!(p.version.is_none());
    }

    #[test]
    fn test_parse_versions() {
        let p = PackageSpec::parse("numpy==1.26", Ecosystem::Python);
        assert_eq!(p.name, "numpy");
        assert_eq!(p.version.as_deref(), Some("1.26"));

        let p = PackageSpec::parse("r-base=4.3", Ecosystem::System);
        assert_eq!(p.version.as_deref(), Some("4.3"));
        assert_eq!(p.to_string(), "r-base=4.3");
    }

    #[test]
    fn test_parse_all_drops_blank() {
        let all = PackageSpec::parse_all(&["a", " ", "b=1"], Ecosystem::System);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_satisfied_by_prefix() {
        let p = PackageSpec::new("numpy", Ecosystem::Python).with_version("1.26");
        assert!(p.satisfied_by("1.26.4"));
        assert!(!p.satisfied_by("2.0.0"));
        assert!(PackageSpec::new("x", Ecosystem::Python).satisfied_by("0.1"));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(InstallStatus::AlreadyPresent.to_string(), "already_present");
        assert!(InstallStatus::Installed.is_success());
        assert!(!InstallStatus::TimedOut.is_success());
    }
}
