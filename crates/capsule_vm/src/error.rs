use capsule_core::{ConfigError, HostId, TransitionError};
use capsule_os::ExecError;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("host creation failed: {0}")]
    Create(String),

    #[error(transparent)]
    Transport(#[from] ExecError),

    #[error("host {host} not reachable after {attempts} attempts: {reason}")]
    NotReady {
        host: HostId,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("unknown host {0}")]
    UnknownHost(HostId),

    #[error("cleanup of {host} failed: {message}")]
    Cleanup { host: HostId, message: String },

    #[error("interrupted")]
    Interrupted,

    #[error("artifact upload failed: {0}")]
    Artifact(String),
}

impl VmError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            VmError::Config(_) => 2,
            VmError::Interrupted => 130,
            _ => 1,
        }
    }
}
