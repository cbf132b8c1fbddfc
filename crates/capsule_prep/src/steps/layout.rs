use crate::context::PrepContext;
use crate::sequencer::PrepStep;
use anyhow::{bail, Result};
use async_trait::async_trait;
use capsule_os::CommandSpec;

// ============================================================================
// workdir
// ============================================================================

const RESOLVE_HOME: &str = "printf '%s' \"$HOME\"";
const ENTER_WORKDIR: &str = "mkdir -p \"$1\" && cd \"$1\" && pwd -P";

pub struct WorkdirStep;

#[async_trait]
impl PrepStep for WorkdirStep {
    fn name(&self) -> &str {
        "workdir"
    }

    fn mandatory(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        let home = ctx
            .run_checked(CommandSpec::shell(RESOLVE_HOME), "resolving $HOME")
            .await?
            .stdout
            .trim()
            .to_string();
        if home.is_empty() {
            bail!("$HOME is not set on the target");
        }
        ctx.home = Some(home.clone());

        let wanted = match ctx.config.workdir.clone() {
            Some(dir) if dir.starts_with('/') => dir,
            Some(dir) => format!("{}/{}", home, dir),
            None => home,
        };
        let entered = ctx
            .run_checked(
                CommandSpec::shell(ENTER_WORKDIR).arg(&wanted),
                "creating working directory",
            )
            .await?;
        let resolved = entered
            .stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&wanted)
            .to_string();
        ctx.workdir = Some(resolved.clone());
        Ok(resolved)
    }
}

// ============================================================================
// subdirectories
// ============================================================================

const MAKE_SUBDIRS: &str = r#"for d in "$@"; do
  if [ -d "$d" ]; then echo "existed $d";
  elif mkdir -p "$d"; then echo "created $d";
  else echo "failed $d"; fi
done"#;

pub struct SubdirectoriesStep;

#[async_trait]
impl PrepStep for SubdirectoriesStep {
    fn name(&self) -> &str {
        "subdirectories"
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        ctx.workdir()?;
        if ctx.config.subdirs.is_empty() {
            return Ok("none configured".to_string());
        }
        let result = ctx
            .run_checked(
                CommandSpec::shell(MAKE_SUBDIRS).args(ctx.config.subdirs.iter().cloned()),
                "creating subdirectories",
            )
            .await?;

        let (mut created, mut existed) = (0, 0);
        let mut failed = Vec::new();
        for line in result.stdout.lines() {
            match line.split_once(' ') {
                Some(("created", _)) => created += 1,
                Some(("existed", _)) => existed += 1,
                Some(("failed", dir)) => failed.push(dir.to_string()),
                _ => {}
            }
        }
        if !failed.is_empty() {
            bail!("could not create {}", failed.join(", "));
        }
        Ok(format!("{} created, {} already existed", created, existed))
    }
}

// ============================================================================
// symlinks
// ============================================================================

const LINK: &str = r#"link="$1"; target="$2"
if [ "$(readlink "$link" 2>/dev/null)" = "$target" ]; then echo skipped; exit 0; fi
if [ -e "$link" ] && [ ! -L "$link" ]; then echo "$link exists and is not a symlink" >&2; exit 1; fi
if ln -sfn "$target" "$link" 2>/dev/null; then echo linked; exit 0; fi
if [ "$3" = sudo ] && sudo -n ln -sfn "$target" "$link"; then echo linked; exit 0; fi
echo "permission denied creating $link" >&2; exit 1"#;

pub struct SymlinksStep;

#[async_trait]
impl PrepStep for SymlinksStep {
    fn name(&self) -> &str {
        "symlinks"
    }

    async fn run(&self, ctx: &mut PrepContext) -> Result<String> {
        let workdir = ctx.workdir()?.to_string();
        let sudo = if ctx.config.use_sudo { "sudo" } else { "nosudo" };

        let (mut linked, mut skipped) = (0, 0);
        let mut failures = Vec::new();
        for link in ctx.config.symlinks.clone() {
            let target = if link.target.starts_with('/') {
                link.target.clone()
            } else {
                format!("{}/{}", workdir, link.target)
            };
            let result = ctx
                .run(
                    CommandSpec::shell(LINK)
                        .arg(&link.link)
                        .arg(&target)
                        .arg(sudo),
                )
                .await?;
            if !result.success() {
                failures.push(format!("{}: {}", link.link, result.error_excerpt(200)));
            } else if result.stdout.trim() == "skipped" {
                skipped += 1;
            } else {
                linked += 1;
            }
        }
        if !failures.is_empty() {
            bail!(
                "{} linked, {} failed ({})",
                linked,
                failures.len(),
                failures.join("; ")
            );
        }
        Ok(format!("{} linked, {} already correct", linked, skipped))
    }
}
