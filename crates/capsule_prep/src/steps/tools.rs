use crate::context::PrepContext;
use crate::sequencer::PrepStep;
use anyhow::{bail, Result};
use async_trait::async_trait;
use capsule_os::CommandSpec;

const SWEEP: &str = r#"for t in "$@"; do
  if command -v "$t" >/dev/null 2>&1; then echo "$t yes"; else echo "$t no"; fi
done"#;

/// Records which tools resolve on `PATH`. Observation only.
pub struct ToolSweepStep;

#[async_trait]
impl PrepStep for ToolSweepStep {
    fn name(&self) -> &str {
        "tool_sweep"
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        let tools = ctx.config.tools.clone();
        if tools.is_empty() {
            return Ok("no tools configured".to_string());
        }
        let result = ctx.run(CommandSpec::shell(SWEEP).args(tools.iter().cloned())).await?;
        if !result.success() {
            bail!("tool probe failed: {}", result.describe());
        }

        for line in result.stdout.lines() {
            if let Some((tool, answer)) = line.rsplit_once(' ') {
                ctx.report.set_tool(tool, answer == "yes");
            }
        }
        // Anything the probe did not mention counts as missing.
        for tool in &tools {
            if !ctx.report.tool_availability.contains_key(tool) {
                ctx.report.set_tool(tool, false);
            }
        }

        let missing: Vec<&str> = tools
            .iter()
            .filter(|t| !ctx.report.tool_availability.get(*t).copied().unwrap_or(false))
            .map(String::as_str)
            .collect();
        let available = tools.len() - missing.len();
        if missing.is_empty() {
            Ok(format!("{}/{} tools available", available, tools.len()))
        } else {
            Ok(format!(
                "{}/{} tools available, missing: {}",
                available,
                tools.len(),
                missing.join(", ")
            ))
        }
    }
}
