use crate::context::PrepContext;
use crate::sequencer::PrepStep;
use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;

const BEGIN_MARK: &str = "# >>> capsule managed >>>";
const END_MARK: &str = "# <<< capsule managed <<<";

/// Managed block first, then whatever the user already had. Re-rendering
/// replaces the previous managed block.
pub fn render_rprofile(existing: Option<&str>, mirror: &str, library: &str) -> String {
    let block = format!(
        "{BEGIN_MARK}\n\
         options(bitmapType = \"cairo\")\n\
         options(repos = c(CRAN = \"{mirror}\"))\n\
         local({{\n  \
           lib <- path.expand(\"{library}\")\n  \
           dir.create(lib, recursive = TRUE, showWarnings = FALSE)\n  \
           .libPaths(c(lib, .libPaths()))\n\
         }})\n\
         {END_MARK}\n",
        mirror = mirror.replace('"', "\\\""),
        library = library.replace('"', "\\\""),
    );

    let rest = existing
        .map(|text| match (text.find(BEGIN_MARK), text.find(END_MARK)) {
            (Some(start), Some(end)) if end > start => {
                let after = &text[end + END_MARK.len()..];
                format!("{}{}", &text[..start], after.trim_start_matches('\n'))
            }
            _ => text.to_string(),
        })
        .unwrap_or_default();

    if rest.trim().is_empty() {
        block
    } else {
        format!("{}\n{}", block, rest)
    }
}

pub struct RProfileStep;

#[async_trait]
impl PrepStep for RProfileStep {
    fn name(&self) -> &str {
        "r_profile"
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        let home = ctx.home.clone().context("home directory is unknown")?;
        let path = format!("{}/.Rprofile", home.trim_end_matches('/'));

        let existing = ctx.executor.read_file(&path, ctx.command_timeout).await?;
        let contents = render_rprofile(
            existing.as_deref(),
            &ctx.config.cran_mirror,
            &ctx.config.r_library,
        );
        let written = ctx
            .executor
            .upload(contents.as_bytes(), &path, ctx.command_timeout)
            .await?;
        if !written.success() {
            bail!("writing {}: {}", path, written.error_excerpt(300));
        }
        Ok(format!("wrote {}", path))
    }
}
