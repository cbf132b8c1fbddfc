use crate::error::VmError;
use capsule_core::Host;
use capsule_os::{ExecError, Executor, SshExecutor};
use std::sync::Arc;
use std::time::Duration;

/// Builds an executor for a host once its address is known.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &Host) -> Result<Arc<dyn Executor>, VmError>;
}

pub struct SshConnector {
    port: u16,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(port: u16, connect_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
        }
    }
}

impl Connector for SshConnector {
    fn connect(&self, host: &Host) -> Result<Arc<dyn Executor>, VmError> {
        let address = host.address.clone().ok_or_else(|| {
            VmError::Transport(ExecError::Transport(format!("host {} has no address", host.id)))
        })?;
        Ok(Arc::new(
            SshExecutor::new(
                host.username.clone(),
                address,
                self.port,
                host.key_path.clone(),
            )
            .with_connect_timeout(self.connect_timeout),
        ))
    }
}
