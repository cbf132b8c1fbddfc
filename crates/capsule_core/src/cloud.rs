use crate::host::HostId;
use serde::{Deserialize, Serialize};

/// Tag key attached to every cloud resource created for a host.
pub const HOST_TAG: &str = "capsule-host";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    VirtualNetwork,
    PublicIp,
    NetworkInterface,
    VirtualMachine,
    OsDisk,
}

impl ResourceKind {
    /// Canonical name of this resource for `host`.
    pub fn name_for(self, host: &HostId) -> String {
        match self {
            ResourceKind::VirtualNetwork => format!("{}-vnet", host),
            ResourceKind::PublicIp => format!("{}-public-ip", host),
            ResourceKind::NetworkInterface => format!("{}-nic", host),
            ResourceKind::VirtualMachine => host.to_string(),
            ResourceKind::OsDisk => format!("{}-osdisk", host),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudResource {
    pub kind: ResourceKind,
    pub name: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("resource '{name}' does not belong to host '{host}'")]
pub struct ForeignResource {
    pub host: HostId,
    pub name: String,
}

/// All resources created for one host, in creation order.
///
/// Only resources whose name derives from the host id can be added, so a
/// teardown driven by this set can never touch another host's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudResourceSet {
    host: HostId,
    resources: Vec<CloudResource>,
}

impl CloudResourceSet {
    pub fn new(host: HostId) -> Self {
        Self {
            host,
            resources: Vec::new(),
        }
    }

    /// The complete set a successful provisioning produces.
    pub fn full(host: HostId) -> Self {
        let mut set = Self::new(host);
        for kind in [
            ResourceKind::VirtualNetwork,
            ResourceKind::PublicIp,
            ResourceKind::NetworkInterface,
            ResourceKind::VirtualMachine,
            ResourceKind::OsDisk,
        ] {
            set.record(kind);
        }
        set
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn owns(&self, name: &str) -> bool {
        let host = self.host.as_str();
        name == host || name.starts_with(&format!("{}-", host))
    }

    pub fn push(&mut self, resource: CloudResource) -> Result<(), ForeignResource> {
        if !self.owns(&resource.name) {
            return Err(ForeignResource {
                host: self.host.clone(),
                name: resource.name,
            });
        }
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
        Ok(())
    }

    /// Record a resource under its canonical name.
    pub fn record(&mut self, kind: ResourceKind) {
        let name = kind.name_for(&self.host);
        if !self.resources.iter().any(|r| r.kind == kind) {
            self.resources.push(CloudResource { kind, name });
        }
    }

    pub fn resources(&self) -> &[CloudResource] {
        &self.resources
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Deletion order: a VM must go before its disk and NIC, the NIC before
    /// the IP and network it references.
    pub fn teardown_order(&self) -> Vec<CloudResource> {
        let rank = |k: ResourceKind| match k {
            ResourceKind::VirtualMachine => 0,
            ResourceKind::OsDisk => 1,
            ResourceKind::NetworkInterface => 2,
            ResourceKind::PublicIp => 3,
            ResourceKind::VirtualNetwork => 4,
        };
        let mut ordered = self.resources.clone();
        ordered.sort_by_key(|r| rank(r.kind));
        ordered
    }
}
