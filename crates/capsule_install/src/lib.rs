//! Package installation for the three supported ecosystems.
//!
//! Every ecosystem goes through the same pipeline (presence check, batch,
//! per-package fallback, abort policy) driven by [`PackageInstaller`]; the
//! [`PackageManager`] implementations only know how to spell commands.

pub mod apt;
pub mod conda;
pub mod cran;
pub mod detect;
pub mod installer;
pub mod manager;

pub use apt::AptManager;
pub use conda::CondaManager;
pub use cran::CranManager;
pub use detect::{scan_r_sources, RSourceScan};
pub use installer::{AbortPolicy, InstallPolicy, InstallReport, PackageInstaller};
pub use manager::PackageManager;
