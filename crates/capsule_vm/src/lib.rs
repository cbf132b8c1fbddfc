//! Host lifecycle on a cloud provider: create, prepare, run the workload,
//! and always tear down.

pub mod artifacts;
pub mod azure;
pub mod cloud;
pub mod connector;
pub mod error;
pub mod lifecycle;
pub mod retry;
pub mod submissions;
pub mod workload;

pub use artifacts::{upload_bundle, ArtifactBundle};
pub use azure::AzureCli;
pub use cloud::{CloudProvider, CreateFailure, HostRequest, Provisioned};
pub use connector::{Connector, SshConnector};
pub use error::VmError;
pub use lifecycle::{supervise, HostLease, LifecycleManager, Supervised, TestOutcome, TestPlan};
pub use retry::{with_retry, RetryConfig, RetryExhausted};
pub use submissions::SubmissionLog;
pub use workload::{RemoteWorkload, TaskOutcome, TaskSpec, Workload};
