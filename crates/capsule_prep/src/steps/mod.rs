//! The fixed preparation plan.

mod display;
mod layout;
mod packages;
mod r_profile;
mod tools;

pub use display::DisplayStep;
pub use layout::{SubdirectoriesStep, SymlinksStep, WorkdirStep};
pub use packages::{PythonPackagesStep, RPackagesStep, SystemPackagesStep};
pub use r_profile::{render_rprofile, RProfileStep};
pub use tools::ToolSweepStep;
