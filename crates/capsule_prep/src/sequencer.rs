use crate::context::PrepContext;
use crate::steps;
use anyhow::Result;
use async_trait::async_trait;
use capsule_os::ExecError;

/// One entry of the preparation plan.
#[async_trait]
pub trait PrepStep: Send + Sync {
    fn name(&self) -> &str;

    /// A failing mandatory step stops the plan.
    fn mandatory(&self) -> bool {
        false
    }

    /// Returns a one-line summary for the report.
    async fn run(&self, ctx: &mut PrepContext) -> Result<String>;
}

/// Runs steps strictly in order, accumulating results into the report.
pub struct Sequencer {
    steps: Vec<Box<dyn PrepStep>>,
}

impl Sequencer {
    pub fn new(steps: Vec<Box<dyn PrepStep>>) -> Self {
        Self { steps }
    }

    /// The fixed plan used for every host.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(steps::WorkdirStep),
            Box::new(steps::SubdirectoriesStep),
            Box::new(steps::SymlinksStep),
            Box::new(steps::SystemPackagesStep),
            Box::new(steps::PythonPackagesStep),
            Box::new(steps::DisplayStep),
            Box::new(steps::RProfileStep),
            Box::new(steps::RPackagesStep),
            Box::new(steps::ToolSweepStep),
        ])
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &mut PrepContext) {
        let total = self.steps.len();
        for (idx, step) in self.steps.iter().enumerate() {
            tracing::info!("[{}/{}] {}", idx + 1, total, step.name());
            match step.run(ctx).await {
                Ok(summary) => {
                    tracing::info!("✓ {}: {}", step.name(), summary);
                    ctx.report.record_success(step.name(), &summary);
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    if lost_connection(&e) {
                        tracing::error!("✗ {}: lost the host: {}", step.name(), message);
                        ctx.report.record_connection_lost(step.name(), &message);
                        break;
                    }
                    if step.mandatory() {
                        tracing::error!("✗ {} (mandatory): {}", step.name(), message);
                        ctx.report.record_mandatory_failure(step.name(), &message);
                        let skipped = total - idx - 1;
                        if skipped > 0 {
                            tracing::warn!("Skipping {} remaining steps", skipped);
                        }
                        break;
                    }
                    tracing::warn!("✗ {}: {}", step.name(), message);
                    ctx.report.record_error(step.name(), &message);
                }
            }
        }
    }
}

/// Transport and auth faults end the run whatever step raised them.
fn lost_connection(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ExecError>(),
            Some(ExecError::Transport(_)) | Some(ExecError::Auth { .. })
        )
    })
}
