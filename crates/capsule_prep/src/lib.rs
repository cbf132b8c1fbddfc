//! Environment preparation: a fixed sequence of steps run against one
//! executor, producing a [`ProvisioningReport`].

pub mod context;
pub mod sequencer;
pub mod steps;

pub use context::PrepContext;
pub use sequencer::{PrepStep, Sequencer};

use capsule_core::report::REPORT_FILE_NAME;
use capsule_core::{CapsuleConfig, ProvisioningReport};
use capsule_os::Executor;
use std::sync::Arc;

pub struct EnvironmentPreparer {
    executor: Arc<dyn Executor>,
    config: CapsuleConfig,
    host: Option<String>,
    detected_r_packages: Vec<String>,
    sequencer: Sequencer,
}

impl EnvironmentPreparer {
    pub fn new(executor: Arc<dyn Executor>, config: CapsuleConfig) -> Self {
        Self {
            executor,
            config,
            host: None,
            detected_r_packages: Vec::new(),
            sequencer: Sequencer::standard(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// R packages found by scanning the task sources before upload.
    pub fn with_detected_r_packages(mut self, packages: Vec<String>) -> Self {
        self.detected_r_packages = packages;
        self
    }

    pub fn with_sequencer(mut self, sequencer: Sequencer) -> Self {
        self.sequencer = sequencer;
        self
    }

    /// Run every step and persist the report next to the working directory.
    /// Never fails: problems are recorded in the report.
    pub async fn run(&self) -> ProvisioningReport {
        let mut ctx = PrepContext::new(self.executor.clone(), &self.config);
        ctx.report.host = self.host.clone();
        if self.config.prep.detect_r_packages {
            ctx.detected_r_packages = self.detected_r_packages.clone();
        }

        tracing::info!(
            "Preparing environment via {} ({} steps)",
            self.executor.name(),
            self.sequencer.step_names().len()
        );
        self.sequencer.run(&mut ctx).await;
        ctx.report.finish();

        self.persist(&ctx).await;
        if ctx.report.succeeded() {
            tracing::info!(
                "Environment ready: {} steps completed, {} errors",
                ctx.report.steps_completed.len(),
                ctx.report.errors.len()
            );
        } else {
            tracing::error!(
                "Environment preparation stopped at mandatory step '{}'",
                ctx.report.mandatory_failure.as_deref().unwrap_or("?")
            );
        }
        ctx.report
    }

    async fn persist(&self, ctx: &PrepContext) {
        let Some(dir) = ctx.workdir.as_deref().or(ctx.home.as_deref()) else {
            tracing::warn!("No directory on the target to persist the report into");
            return;
        };
        let path = format!("{}/{}", dir.trim_end_matches('/'), REPORT_FILE_NAME);
        let json = match ctx.report.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Could not serialize report: {:#}", e);
                return;
            }
        };
        match self
            .executor
            .upload(json.as_bytes(), &path, ctx.command_timeout)
            .await
        {
            Ok(r) if r.success() => tracing::debug!("Report written to {}", path),
            Ok(r) => tracing::warn!("Writing {} failed: {}", path, r.error_excerpt(300)),
            Err(e) => tracing::warn!("Writing {} failed: {}", path, e),
        }
    }
}
