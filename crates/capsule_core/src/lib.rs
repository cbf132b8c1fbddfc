pub mod cloud;
pub mod command;
pub mod config;
pub mod host;
pub mod package;
pub mod report;

pub use cloud::{CloudResource, CloudResourceSet, ResourceKind, HOST_TAG};
pub use command::CommandResult;
pub use config::{CapsuleConfig, ConfigError};
pub use host::{Host, HostId, HostState, Readiness, TransitionError};
pub use package::{Ecosystem, InstallOutcome, InstallStatus, PackageSpec};
pub use report::ProvisioningReport;

/// Default bound on error excerpts kept in outcomes and reports.
pub const DEFAULT_EXCERPT_CHARS: usize = 500;

/// Keep at most `limit` characters from the end of `text`, never splitting a
/// UTF-8 sequence.
pub fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    text.chars().skip(count - limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_chars_short_input_untouched() {
        assert_eq!(tail_chars("abc", 10), "abc");
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("0123456789", 3), "789");
    }

    #[test]
    fn test_tail_chars_multibyte() {
        let s = "错误：安装失败";
        let tail = tail_chars(s, 4);
        assert_eq!(tail.chars().count(), 4);
        assert_eq!(tail, "安装失败");
    }
}
