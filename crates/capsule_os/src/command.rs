//! Structured command construction.
//!
//! Commands are argument vectors end to end. The only place they become a
//! string is [`CommandSpec::render`], used by transports that can only carry
//! a command line, and there every token is quoted.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// A fixed, internally authored `sh -c` script. Data must go through
    /// [`CommandSpec::arg`], where it arrives as `$1`, `$2`, ...
    pub fn shell(script: &str) -> Self {
        Self::new("sh").arg("-c").arg(script).arg("sh")
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set the working directory only if none was chosen explicitly.
    pub fn with_default_cwd(mut self, dir: Option<&str>) -> Self {
        if self.cwd.is_none() {
            self.cwd = dir.map(str::to_string);
        }
        self
    }

    /// Merge environment defaults without overriding explicit values.
    pub fn with_default_env(mut self, env: &BTreeMap<String, String>) -> Self {
        for (k, v) in env {
            self.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    /// POSIX shell line: `cd 'dir' && K='v' 'prog' 'arg' ...`.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        for (k, v) in &self.env {
            parts.push(format!("{}={}", k, quote(v)));
        }
        parts.push(quote(&self.program));
        parts.extend(self.args.iter().map(|a| quote(a)));
        let line = parts.join(" ");
        match &self.cwd {
            Some(dir) => format!("cd {} && {}", quote(dir), line),
            None => line,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote one token for a POSIX shell. Plain tokens pass through unchanged.
pub fn quote(token: &str) -> String {
    let plain = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if plain {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r#"'\''"#))
    }
}
