use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Missing required configuration: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CapsuleConfig {
    pub cloud: CloudConfig,
    pub ssh: SshConfig,
    pub prep: PrepConfig,
    pub install: InstallConfig,
    pub workload: WorkloadConfig,
}

impl CapsuleConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let mut config: CapsuleConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AZURE_SUBSCRIPTION_ID") {
            self.cloud.subscription_id = Some(v);
        }
        if let Ok(v) = std::env::var("AZURE_RESOURCE_GROUP_NAME") {
            self.cloud.resource_group = Some(v);
        }
        if let Ok(v) = std::env::var("AZURE_LOCATION") {
            self.cloud.location = v;
        }
        if let Ok(v) = std::env::var("NETWORK_SECURITY_GROUP_NAME") {
            self.cloud.network_security_group = Some(v);
        }
        if let Ok(v) = std::env::var("CAPSULE_VM_SIZE") {
            self.cloud.vm_size = v;
        }
        if let Ok(v) = std::env::var("SSH_PUBLIC_KEY_PATH") {
            self.ssh.public_key_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("SSH_PRIVATE_KEY_PATH") {
            self.ssh.private_key_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("CAPSULE_LOG_DIR") {
            self.workload.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CAPSULE_PACKAGE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.install.timeout_per_package_secs = n;
            }
        }
    }

    /// Everything needed to create and reach a VM. Runs before any cloud
    /// resource is requested so a typo never leaves half a deployment behind.
    pub fn validate_for_cloud(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.cloud.subscription_id.as_deref().map_or(true, str::is_empty) {
            missing.push("cloud.subscription_id (AZURE_SUBSCRIPTION_ID)".to_string());
        }
        if self.cloud.resource_group.as_deref().map_or(true, str::is_empty) {
            missing.push("cloud.resource_group (AZURE_RESOURCE_GROUP_NAME)".to_string());
        }
        if self
            .cloud
            .network_security_group
            .as_deref()
            .map_or(true, str::is_empty)
        {
            missing.push("cloud.network_security_group (NETWORK_SECURITY_GROUP_NAME)".to_string());
        }
        if self.ssh.public_key_path.is_none() {
            missing.push("ssh.public_key_path (SSH_PUBLIC_KEY_PATH)".to_string());
        }
        missing.extend(self.missing_ssh_private_key());
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        for path in [&self.ssh.public_key_path, &self.ssh.private_key_path]
            .into_iter()
            .flatten()
        {
            if !path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "SSH key file does not exist: {}",
                    path.display()
                )));
            }
        }
        self.validate_install()
    }

    /// Enough to reach an existing host.
    pub fn validate_for_existing_host(&self) -> Result<(), ConfigError> {
        let mut missing = self.missing_ssh_private_key();
        if self.cloud.resource_group.as_deref().map_or(true, str::is_empty) {
            missing.push("cloud.resource_group (AZURE_RESOURCE_GROUP_NAME)".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        self.validate_install()
    }

    fn missing_ssh_private_key(&self) -> Vec<String> {
        if self.ssh.private_key_path.is_none() {
            vec!["ssh.private_key_path (SSH_PRIVATE_KEY_PATH)".to_string()]
        } else {
            vec![]
        }
    }

    pub fn validate_install(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.install.abort_fraction) {
            return Err(ConfigError::Invalid(format!(
                "install.abort_fraction must be within [0, 1], got {}",
                self.install.abort_fraction
            )));
        }
        if self.install.timeout_per_package_secs == 0 {
            return Err(ConfigError::Invalid(
                "install.timeout_per_package_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub subscription_id: Option<String>,
    pub resource_group: Option<String>,
    pub location: String,
    pub network_security_group: Option<String>,
    pub vm_size: String,
    pub gpu_vm_size: String,
    pub image: String,
    pub username: String,
    /// Prefix of generated host ids.
    pub name_prefix: String,
    /// Upper bound for a single cloud CLI call.
    pub cli_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            subscription_id: None,
            resource_group: None,
            location: "eastus".to_string(),
            network_security_group: None,
            vm_size: "Standard_E2as_v5".to_string(),
            gpu_vm_size: "Standard_NC4as_T4_v3".to_string(),
            image: "Canonical:0001-com-ubuntu-server-jammy:22_04-lts-gen2:latest".to_string(),
            username: "agent".to_string(),
            name_prefix: "capsule".to_string(),
            cli_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub public_key_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub ready_max_attempts: u32,
    pub ready_delay_secs: u64,
    pub ready_max_delay_secs: u64,
    /// Default bound for commands that do not carry their own timeout.
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            public_key_path: None,
            private_key_path: None,
            port: 22,
            connect_timeout_secs: 10,
            ready_max_attempts: 30,
            ready_delay_secs: 10,
            ready_max_delay_secs: 60,
            command_timeout_secs: 600,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SymlinkConfig {
    /// Absolute path of the link to create.
    pub link: String,
    /// Target, relative to the working directory.
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrepConfig {
    /// Working directory on the target. Defaults to the login user's home.
    pub workdir: Option<String>,
    pub subdirs: Vec<String>,
    pub symlinks: Vec<SymlinkConfig>,
    pub system_packages: Vec<String>,
    pub python_packages: Vec<String>,
    pub r_packages: Vec<String>,
    /// Scan uploaded R sources for `library()`/`pkg::` references.
    pub detect_r_packages: bool,
    pub use_sudo: bool,
    pub conda_bin: String,
    pub conda_env: String,
    pub conda_channel: String,
    pub python_version: String,
    pub cran_mirror: String,
    pub r_library: String,
    pub display: String,
    pub screen: String,
    pub tools: Vec<String>,
}

impl Default for PrepConfig {
    fn default() -> Self {
        Self {
            workdir: None,
            subdirs: vec![
                "environment/data".to_string(),
                "environment/code".to_string(),
                "environment/results".to_string(),
                "R/library".to_string(),
            ],
            symlinks: ["data", "code", "results"]
                .iter()
                .map(|name| SymlinkConfig {
                    link: format!("/{}", name),
                    target: format!("environment/{}", name),
                })
                .collect(),
            system_packages: default_system_packages(),
            python_packages: vec![],
            r_packages: vec![],
            detect_r_packages: true,
            use_sudo: true,
            conda_bin: "conda".to_string(),
            conda_env: "agent_env".to_string(),
            conda_channel: "conda-forge".to_string(),
            python_version: "3.12".to_string(),
            cran_mirror: "https://cloud.r-project.org".to_string(),
            r_library: "~/R/library".to_string(),
            display: ":99".to_string(),
            screen: "1280x1024x24".to_string(),
            tools: default_tools(),
        }
    }
}

fn default_system_packages() -> Vec<String> {
    [
        "r-base",
        "r-base-dev",
        "pandoc",
        "texlive-latex-base",
        "texlive-latex-extra",
        "texlive-fonts-recommended",
        "xvfb",
        "x11-utils",
        "imagemagick",
        "poppler-utils",
        "libcurl4-openssl-dev",
        "libssl-dev",
        "libxml2-dev",
        "libcairo2-dev",
        "libfontconfig1-dev",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_tools() -> Vec<String> {
    [
        "Rscript", "pdflatex", "pandoc", "xvfb-run", "convert", "python3", "conda", "git",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub timeout_per_package_secs: u64,
    /// Cap for the combined batch command.
    pub max_batch_timeout_secs: u64,
    pub presence_timeout_secs: u64,
    pub abort_min_failures: usize,
    pub abort_fraction: f64,
    pub excerpt_chars: usize,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            timeout_per_package_secs: 300,
            max_batch_timeout_secs: 3600,
            presence_timeout_secs: 60,
            abort_min_failures: 5,
            abort_fraction: 0.3,
            excerpt_chars: crate::DEFAULT_EXCERPT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Agent command, as an argument vector, run from the working directory.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// File the agent writes its answer mapping to, relative to the workdir.
    pub result_file: String,
    pub trace_file: String,
    /// Extra files copied back into `<log_dir>/<task id>/` after a task
    /// completes, relative to the workdir.
    pub collect_files: Vec<String>,
    /// Local directory uploaded to the host before the run.
    pub agent_dir: Option<PathBuf>,
    /// Local directory for reports, traces and submissions.
    pub log_dir: PathBuf,
    pub run_id: Option<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "conda".to_string(),
                "run".to_string(),
                "-n".to_string(),
                "agent_env".to_string(),
                "python".to_string(),
                "run_agent.py".to_string(),
            ],
            timeout_secs: 7200,
            poll_interval_secs: 30,
            result_file: "output.json".to_string(),
            trace_file: "agent_trace.log".to_string(),
            collect_files: Vec::new(),
            agent_dir: None,
            log_dir: PathBuf::from("results"),
            run_id: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
