//! Finds the R packages a task's sources depend on.

use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::{DirEntry, WalkDir};

static LIBRARY_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:library|require|requireNamespace)\s*\(\s*["']?([A-Za-z][A-Za-z0-9._]*)["']?"#)
        .unwrap()
});
static NAMESPACE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z][A-Za-z0-9._]*):::?[A-Za-z.]").unwrap());

/// Packages shipped with every R installation.
pub const BASE_R_PACKAGES: &[&str] = &[
    "base", "compiler", "datasets", "graphics", "grDevices", "grid", "methods", "parallel",
    "splines", "stats", "stats4", "tcltk", "tools", "utils",
];

/// Rendering R Markdown needs these even if no source names them.
const DOCUMENT_PACKAGES: &[&str] = &["rmarkdown", "tinytex"];

const R_EXTENSIONS: &[&str] = &["r", "rmd", "qmd", "rnw"];

/// Directories holding vendored libraries rather than task sources.
const SKIPPED_DIRS: &[&str] = &["renv", "packrat", "node_modules", "__pycache__"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RSourceScan {
    pub files_scanned: usize,
    pub packages: BTreeSet<String>,
}

impl RSourceScan {
    pub fn has_r_code(&self) -> bool {
        self.files_scanned > 0
    }

    /// Detected packages plus the document toolchain when any R code exists.
    pub fn required_packages(&self) -> Vec<String> {
        let mut all = self.packages.clone();
        if self.has_r_code() {
            all.extend(DOCUMENT_PACKAGES.iter().map(|s| s.to_string()));
        }
        all.into_iter().collect()
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.') || SKIPPED_DIRS.contains(&name))
            .unwrap_or(false)
}

fn is_r_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| R_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Package names referenced by one R source text, base packages excluded.
pub fn packages_in_source(text: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    for line in text.lines() {
        let code = line.trim_start();
        if code.starts_with('#') {
            continue;
        }
        for caps in LIBRARY_CALL
            .captures_iter(code)
            .chain(NAMESPACE_REF.captures_iter(code))
        {
            let name = &caps[1];
            if !BASE_R_PACKAGES.contains(&name) {
                found.insert(name.to_string());
            }
        }
    }
    found
}

/// Walk `root` and collect package references from every R source file.
/// Unreadable files are logged and skipped.
pub fn scan_r_sources(root: &Path) -> RSourceScan {
    let mut scan = RSourceScan::default();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| !is_skipped(e)).filter_map(Result::ok) {
        if !entry.file_type().is_file() || !is_r_source(entry.path()) {
            continue;
        }
        match std::fs::read(entry.path()) {
            Ok(bytes) => {
                scan.files_scanned += 1;
                scan.packages
                    .extend(packages_in_source(&String::from_utf8_lossy(&bytes)));
            }
            Err(e) => tracing::warn!("Skipping {}: {}", entry.path().display(), e),
        }
    }
    tracing::debug!(
        "Scanned {} R files under {}, found {} packages",
        scan.files_scanned,
        root.display(),
        scan.packages.len()
    );
    scan
}
