use async_trait::async_trait;
use capsule_core::{CloudResourceSet, HostId};

#[derive(Debug, Clone)]
pub struct HostRequest {
    pub id: HostId,
    /// Select the GPU machine size.
    pub gpu: bool,
}

impl HostRequest {
    pub fn new(id: HostId) -> Self {
        Self { id, gpu: false }
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }
}

/// A host whose resources all exist.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub resources: CloudResourceSet,
    pub address: String,
}

/// Creation stopped part way. `partial` lists everything that may exist.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct CreateFailure {
    pub partial: CloudResourceSet,
    pub error: String,
}

/// Cloud seam: create, delete and look up the resources of one host.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, request: &HostRequest) -> Result<Provisioned, CreateFailure>;

    /// Delete every resource in the set. Resources that no longer exist
    /// count as deleted.
    async fn delete(&self, resources: &CloudResourceSet) -> anyhow::Result<()>;

    /// Look up an existing host by id.
    async fn discover(&self, host: &HostId) -> anyhow::Result<Option<Provisioned>>;
}
