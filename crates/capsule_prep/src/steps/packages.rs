use crate::context::PrepContext;
use crate::sequencer::PrepStep;
use anyhow::{bail, Result};
use async_trait::async_trait;
use capsule_core::{Ecosystem, PackageSpec, ProvisioningReport};
use capsule_install::{AptManager, CondaManager, CranManager, InstallReport};

/// Partial failures go to the report's error list; only a total failure
/// fails the step.
fn conclude(ctx: &mut PrepContext, step: &str, report: &InstallReport) -> Result<String> {
    let summary = report.summary();
    if report.all_failed() {
        bail!("no package could be installed ({})", summary);
    }
    let failed = report.failed();
    if !failed.is_empty() {
        ctx.report
            .record_error(step, &format!("failed: {}", failed.join(", ")));
    }
    Ok(summary)
}

pub struct SystemPackagesStep;

#[async_trait]
impl PrepStep for SystemPackagesStep {
    fn name(&self) -> &str {
        "system_packages"
    }

    /// Only a total failure is fatal; see [`conclude`].
    fn mandatory(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        ctx.workdir()?;
        let wanted = PackageSpec::parse_all(&ctx.config.system_packages, Ecosystem::System);
        if wanted.is_empty() {
            return Ok("none configured".to_string());
        }
        let apt = AptManager::new(ctx.config.use_sudo);
        let outcome = ctx.installer().install(&apt, &wanted).await?;
        ProvisioningReport::merge_statuses(&mut ctx.report.system_packages, &outcome.outcomes);
        conclude(ctx, self.name(), &outcome)
    }
}

pub struct PythonPackagesStep;

#[async_trait]
impl PrepStep for PythonPackagesStep {
    fn name(&self) -> &str {
        "python_packages"
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        let wanted = PackageSpec::parse_all(&ctx.config.python_packages, Ecosystem::Python);
        if wanted.is_empty() {
            return Ok("skipped, none configured".to_string());
        }
        let conda = CondaManager::new(
            ctx.config.conda_bin.clone(),
            ctx.config.conda_env.clone(),
            ctx.config.conda_channel.clone(),
            ctx.config.python_version.clone(),
        );
        let outcome = ctx.installer().install(&conda, &wanted).await?;
        ProvisioningReport::merge_statuses(&mut ctx.report.python_packages, &outcome.outcomes);
        conclude(ctx, self.name(), &outcome)
    }
}

pub struct RPackagesStep;

#[async_trait]
impl PrepStep for RPackagesStep {
    fn name(&self) -> &str {
        "r_packages"
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        let mut wanted = PackageSpec::parse_all(&ctx.config.r_packages, Ecosystem::Statistical);
        for name in &ctx.detected_r_packages {
            if !wanted.iter().any(|p| &p.name == name) {
                wanted.push(PackageSpec::new(name.clone(), Ecosystem::Statistical));
            }
        }
        if wanted.is_empty() {
            return Ok("skipped, none configured or detected".to_string());
        }
        let cran = CranManager::new(ctx.config.cran_mirror.clone(), ctx.config.r_library.clone());
        let outcome = ctx.installer().install(&cran, &wanted).await?;
        ProvisioningReport::merge_statuses(&mut ctx.report.r_packages, &outcome.outcomes);
        conclude(ctx, self.name(), &outcome)
    }
}
