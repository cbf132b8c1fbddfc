use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of one local or remote command.
///
/// A non-zero exit code is data, not an error: executors only fail the caller
/// on transport faults. `exit_code` is `None` when the process was killed,
/// which always happens on timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    pub fn timed_out(duration: Duration) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: format!("command timed out after {:.1}s", duration.as_secs_f64()),
            duration,
            timed_out: true,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Bounded tail of the diagnostic stream. Falls back to stdout when the
    /// command wrote nothing to stderr.
    pub fn error_excerpt(&self, limit: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        crate::tail_chars(source.trim_end(), limit)
    }

    /// Short human description used in log lines and report entries.
    pub fn describe(&self) -> String {
        if self.timed_out {
            return format!("timed out after {:.1}s", self.duration.as_secs_f64());
        }
        match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
