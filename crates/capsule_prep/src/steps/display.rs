use crate::context::PrepContext;
use crate::sequencer::PrepStep;
use anyhow::{bail, Result};
use async_trait::async_trait;
use capsule_os::CommandSpec;

/// `$1` display (e.g. `:99`), `$2` screen geometry.
const START_XVFB: &str = r#"sock="/tmp/.X11-unix/X${1#:}"
if [ -e "$sock" ]; then echo running; exit 0; fi
command -v Xvfb >/dev/null 2>&1 || { echo "Xvfb is not installed" >&2; exit 127; }
nohup Xvfb "$1" -screen 0 "$2" -nolisten tcp </dev/null >/dev/null 2>&1 &
i=0
while [ $i -lt 20 ]; do
  [ -e "$sock" ] && { echo started; exit 0; }
  sleep 0.5; i=$((i + 1))
done
echo "Xvfb did not come up on $1" >&2; exit 1"#;

/// Virtual framebuffer for plotting code that insists on an X display.
pub struct DisplayStep;

#[async_trait]
impl PrepStep for DisplayStep {
    fn name(&self) -> &str {
        "display"
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        let display = ctx.config.display.clone();
        let result = ctx
            .run(
                CommandSpec::shell(START_XVFB)
                    .arg(&display)
                    .arg(&ctx.config.screen),
            )
            .await?;
        if !result.success() {
            bail!("{}", result.error_excerpt(300));
        }

        ctx.env.insert("DISPLAY".to_string(), display.clone());
        ctx.report.display = Some(display.clone());
        let state = if result.stdout.trim() == "running" {
            "already running"
        } else {
            "started"
        };
        Ok(format!("Xvfb {} on {}", state, display))
    }
}
