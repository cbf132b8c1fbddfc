use crate::manager::PackageManager;
use capsule_core::{Ecosystem, PackageSpec};
use capsule_os::CommandSpec;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static CRAN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._]*$").unwrap());
static CRAN_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9][0-9.\-]*$").unwrap());

/// R packages from a CRAN mirror into a per-user library.
///
/// `install.packages` exits 0 even when a package fails to build, so every
/// install expression re-checks the library and exits 1 if anything is missing.
pub struct CranManager {
    mirror: String,
    library: String,
}

impl CranManager {
    pub fn new(mirror: impl Into<String>, library: impl Into<String>) -> Self {
        Self {
            mirror: mirror.into(),
            library: library.into(),
        }
    }

    fn rscript(&self, body: &str) -> CommandSpec {
        let prelude = format!(
            "lib <- path.expand({}); dir.create(lib, recursive = TRUE, showWarnings = FALSE); \
             .libPaths(c(lib, .libPaths())); ",
            r_string(&self.library)
        );
        CommandSpec::new("Rscript").arg("-e").arg(prelude + body)
    }
}

/// R string literal with backslashes and quotes escaped.
fn r_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

impl PackageManager for CranManager {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Statistical
    }

    fn tool(&self) -> &str {
        "Rscript"
    }

    fn list_installed(&self) -> CommandSpec {
        self.rscript(
            "ip <- installed.packages(); \
             cat(paste(ip[, \"Package\"], ip[, \"Version\"], sep = \"\\t\"), sep = \"\\n\")",
        )
    }

    fn parse_installed(&self, stdout: &str) -> HashMap<String, String> {
        stdout
            .lines()
            .filter_map(|line| {
                let (name, version) = line.split_once('\t')?;
                let name = name.trim();
                CRAN_NAME
                    .is_match(name)
                    .then(|| (name.to_string(), version.trim().to_string()))
            })
            .collect()
    }

    fn install(&self, packages: &[PackageSpec]) -> CommandSpec {
        let repos = r_string(&self.mirror);
        let (versioned, plain): (Vec<&PackageSpec>, Vec<&PackageSpec>) =
            packages.iter().partition(|p| p.version.is_some());

        let mut body = String::new();
        if !plain.is_empty() {
            let names: Vec<String> = plain.iter().map(|p| r_string(&p.name)).collect();
            body.push_str(&format!(
                "install.packages(c({}), repos = {}, lib = lib, dependencies = TRUE); ",
                names.join(", "),
                repos
            ));
        }
        if !versioned.is_empty() {
            body.push_str(&format!(
                "if (!requireNamespace(\"remotes\", quietly = TRUE)) \
                 install.packages(\"remotes\", repos = {}, lib = lib); ",
                repos
            ));
            for p in &versioned {
                body.push_str(&format!(
                    "remotes::install_version({}, version = {}, repos = {}, lib = lib, \
                     upgrade = \"never\"); ",
                    r_string(&p.name),
                    r_string(p.version.as_deref().unwrap_or_default()),
                    repos
                ));
            }
        }

        let wanted: Vec<String> = packages.iter().map(|p| r_string(&p.name)).collect();
        body.push_str(&format!(
            "missing <- setdiff(c({}), rownames(installed.packages())); \
             if (length(missing) > 0) {{ message(\"not installed: \", \
             paste(missing, collapse = \", \")); quit(status = 1) }}",
            wanted.join(", ")
        ));
        self.rscript(&body)
    }

    fn validate(&self, package: &PackageSpec) -> Result<(), String> {
        if !CRAN_NAME.is_match(&package.name) {
            return Err(format!("invalid R package name '{}'", package.name));
        }
        match &package.version {
            Some(v) if !CRAN_VERSION.is_match(v) => {
                Err(format!("invalid version '{}' for R package {}", v, package.name))
            }
            _ => Ok(()),
        }
    }
}
