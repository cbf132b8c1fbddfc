//! Azure provider driving the `az` CLI on the local machine.

use crate::cloud::{CloudProvider, CreateFailure, HostRequest, Provisioned};
use crate::error::VmError;
use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use capsule_core::config::CapsuleConfig;
use capsule_core::{CloudResource, CloudResourceSet, CommandResult, HostId, ResourceKind, HOST_TAG};
use capsule_os::{CommandSpec, Executor, LocalExecutor};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const SUBNET_NAME: &str = "default";

pub struct AzureCli {
    executor: Arc<dyn Executor>,
    subscription: String,
    resource_group: String,
    location: String,
    network_security_group: String,
    vm_size: String,
    gpu_vm_size: String,
    image: String,
    username: String,
    public_key_path: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmCreateOutput {
    #[serde(default)]
    public_ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmShowOutput {
    #[serde(default)]
    public_ips: Option<String>,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
    #[serde(default)]
    network_profile: Option<NetworkProfile>,
    #[serde(default)]
    storage_profile: Option<StorageProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkProfile {
    #[serde(default)]
    network_interfaces: Option<Vec<ResourceRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageProfile {
    #[serde(default)]
    os_disk: Option<OsDiskRef>,
}

#[derive(Debug, Deserialize)]
struct OsDiskRef {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NicShowOutput {
    #[serde(default)]
    ip_configurations: Option<Vec<IpConfiguration>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpConfiguration {
    #[serde(default)]
    public_ip_address: Option<ResourceRef>,
    #[serde(default)]
    subnet: Option<ResourceRef>,
}

impl VmShowOutput {
    fn tagged_for(&self, host: &HostId) -> bool {
        self.tags
            .as_ref()
            .and_then(|tags| tags.get(HOST_TAG))
            .is_some_and(|v| v.eq_ignore_ascii_case(host.as_str()))
    }

    fn nic_names(&self) -> Vec<&str> {
        self.network_profile
            .as_ref()
            .and_then(|p| p.network_interfaces.as_ref())
            .map(|nics| nics.iter().map(|n| last_segment(&n.id)).collect())
            .unwrap_or_default()
    }

    fn os_disk_name(&self) -> Option<&str> {
        self.storage_profile
            .as_ref()
            .and_then(|p| p.os_disk.as_ref())
            .and_then(|d| d.name.as_deref())
            .filter(|n| !n.is_empty())
    }
}

/// `/subscriptions/../networkInterfaces/vm-a-nic` -> `vm-a-nic`
fn last_segment(id: &str) -> &str {
    id.trim_end_matches('/').rsplit('/').next().unwrap_or(id)
}

/// Segment following `key` in an ARM id, e.g. the VNet of a subnet id.
fn segment_after<'a>(id: &'a str, key: &str) -> Option<&'a str> {
    let mut parts = id.split('/');
    parts.find(|p| p.eq_ignore_ascii_case(key))?;
    parts.next().filter(|p| !p.is_empty())
}

fn is_not_found(result: &CommandResult) -> bool {
    let text = format!("{}\n{}", result.stderr, result.stdout);
    text.contains("ResourceNotFound")
        || text.contains("was not found")
        || text.contains("could not be found")
}

impl AzureCli {
    /// Validates the cloud section before anything can be created.
    pub fn from_config(config: &CapsuleConfig) -> Result<Self, VmError> {
        config.validate_for_cloud()?;
        Ok(Self::new_unchecked(config, Arc::new(LocalExecutor::new())))
    }

    /// Enough to look up and delete an existing host.
    pub fn for_existing_host(config: &CapsuleConfig) -> Result<Self, VmError> {
        config.validate_for_existing_host()?;
        Ok(Self::new_unchecked(config, Arc::new(LocalExecutor::new())))
    }

    /// Build with an arbitrary executor for `az` calls.
    pub fn new_unchecked(config: &CapsuleConfig, executor: Arc<dyn Executor>) -> Self {
        let cloud = &config.cloud;
        Self {
            executor,
            subscription: cloud.subscription_id.clone().unwrap_or_default(),
            resource_group: cloud.resource_group.clone().unwrap_or_default(),
            location: cloud.location.clone(),
            network_security_group: cloud.network_security_group.clone().unwrap_or_default(),
            vm_size: cloud.vm_size.clone(),
            gpu_vm_size: cloud.gpu_vm_size.clone(),
            image: cloud.image.clone(),
            username: cloud.username.clone(),
            public_key_path: config.ssh.public_key_path.clone().unwrap_or_default(),
            timeout: Duration::from_secs(cloud.cli_timeout_secs),
        }
    }

    fn az(&self, args: &[&str]) -> CommandSpec {
        let mut cmd = CommandSpec::new("az")
            .args(args.iter().copied())
            .args(["--resource-group", self.resource_group.as_str()]);
        if !self.subscription.is_empty() {
            cmd = cmd.args(["--subscription", self.subscription.as_str()]);
        }
        cmd.args(["--output", "json", "--only-show-errors"])
    }

    async fn call(&self, cmd: CommandSpec) -> anyhow::Result<CommandResult> {
        let result = self.executor.run(&cmd, self.timeout).await?;
        if result.timed_out {
            return Err(anyhow!(
                "`az {}` timed out after {}s",
                cmd.args.first().map(String::as_str).unwrap_or_default(),
                self.timeout.as_secs()
            ));
        }
        Ok(result)
    }

    async fn call_ok(&self, cmd: CommandSpec, what: &str) -> anyhow::Result<CommandResult> {
        let result = self.call(cmd).await?;
        if !result.success() {
            return Err(anyhow!("{}: {}", what, result.error_excerpt(500)));
        }
        Ok(result)
    }

    fn tags(&self, host: &HostId) -> String {
        format!("{}={}", HOST_TAG, host)
    }

    async fn create_resources(
        &self,
        request: &HostRequest,
        set: &mut CloudResourceSet,
    ) -> anyhow::Result<String> {
        let id = &request.id;
        let vnet = ResourceKind::VirtualNetwork.name_for(id);
        let ip = ResourceKind::PublicIp.name_for(id);
        let nic = ResourceKind::NetworkInterface.name_for(id);
        let disk = ResourceKind::OsDisk.name_for(id);
        let tags = self.tags(id);

        // Each resource is recorded before it is requested: a timed-out call
        // may still have created it.
        set.record(ResourceKind::VirtualNetwork);
        self.call_ok(
            self.az(&[
                "network", "vnet", "create", "--name", &vnet, "--location", &self.location,
                "--address-prefix", "10.0.0.0/16", "--subnet-name", SUBNET_NAME,
                "--subnet-prefix", "10.0.0.0/24", "--tags", &tags,
            ]),
            "creating virtual network",
        )
        .await?;

        set.record(ResourceKind::PublicIp);
        self.call_ok(
            self.az(&[
                "network", "public-ip", "create", "--name", &ip, "--location", &self.location,
                "--sku", "Standard", "--allocation-method", "Static", "--tags", &tags,
            ]),
            "creating public IP",
        )
        .await?;

        set.record(ResourceKind::NetworkInterface);
        self.call_ok(
            self.az(&[
                "network", "nic", "create", "--name", &nic, "--location", &self.location,
                "--vnet-name", &vnet, "--subnet", SUBNET_NAME, "--public-ip-address", &ip,
                "--network-security-group", &self.network_security_group, "--tags", &tags,
            ]),
            "creating network interface",
        )
        .await?;

        let size = if request.gpu {
            &self.gpu_vm_size
        } else {
            &self.vm_size
        };
        let key = format!("@{}", self.public_key_path.display());
        set.record(ResourceKind::VirtualMachine);
        set.record(ResourceKind::OsDisk);
        let created = self
            .call_ok(
                self.az(&[
                    "vm", "create", "--name", id.as_str(), "--location", &self.location,
                    "--nics", &nic, "--image", &self.image, "--size", size,
                    "--admin-username", &self.username, "--ssh-key-values", &key,
                    "--os-disk-name", &disk, "--tags", &tags,
                ]),
                "creating virtual machine",
            )
            .await?;

        let from_create = serde_json::from_str::<VmCreateOutput>(&created.stdout)
            .ok()
            .and_then(|o| o.public_ip_address)
            .filter(|a| !a.is_empty());
        match from_create {
            Some(address) => Ok(address),
            None => self.lookup_address(&ip).await,
        }
    }

    async fn lookup_address(&self, ip_name: &str) -> anyhow::Result<String> {
        let shown = self
            .call_ok(
                self.az(&["network", "public-ip", "show", "--name", ip_name]),
                "reading public IP",
            )
            .await?;
        let value: serde_json::Value =
            serde_json::from_str(&shown.stdout).context("unparseable public-ip output")?;
        value
            .get("ipAddress")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .context("public IP has no address assigned")
    }

    /// Disk, NICs and what the NICs reference, as actually attached to the VM.
    async fn attached_resources(&self, details: &VmShowOutput) -> anyhow::Result<Vec<CloudResource>> {
        let mut found = Vec::new();
        if let Some(disk) = details.os_disk_name() {
            found.push(CloudResource {
                kind: ResourceKind::OsDisk,
                name: disk.to_string(),
            });
        }
        for nic in details.nic_names() {
            found.push(CloudResource {
                kind: ResourceKind::NetworkInterface,
                name: nic.to_string(),
            });
            let shown = self
                .call_ok(
                    self.az(&["network", "nic", "show", "--name", nic]),
                    "reading network interface",
                )
                .await?;
            let nic_details: NicShowOutput =
                serde_json::from_str(&shown.stdout).context("unparseable nic show output")?;
            for config in nic_details.ip_configurations.unwrap_or_default() {
                if let Some(ip) = config.public_ip_address {
                    found.push(CloudResource {
                        kind: ResourceKind::PublicIp,
                        name: last_segment(&ip.id).to_string(),
                    });
                }
                if let Some(vnet) = config
                    .subnet
                    .as_ref()
                    .and_then(|s| segment_after(&s.id, "virtualNetworks"))
                {
                    found.push(CloudResource {
                        kind: ResourceKind::VirtualNetwork,
                        name: vnet.to_string(),
                    });
                }
            }
        }
        Ok(found)
    }

    fn delete_command(&self, resource: &CloudResource) -> CommandSpec {
        let name = resource.name.as_str();
        match resource.kind {
            ResourceKind::VirtualMachine => self.az(&["vm", "delete", "--name", name, "--yes"]),
            ResourceKind::OsDisk => self.az(&["disk", "delete", "--name", name, "--yes"]),
            ResourceKind::NetworkInterface => self.az(&["network", "nic", "delete", "--name", name]),
            ResourceKind::PublicIp => self.az(&["network", "public-ip", "delete", "--name", name]),
            ResourceKind::VirtualNetwork => self.az(&["network", "vnet", "delete", "--name", name]),
        }
    }
}

#[async_trait]
impl CloudProvider for AzureCli {
    fn name(&self) -> &str {
        "azure"
    }

    async fn create(&self, request: &HostRequest) -> Result<Provisioned, CreateFailure> {
        tracing::info!(
            "Creating {} in {} ({})",
            request.id,
            self.resource_group,
            if request.gpu { &self.gpu_vm_size } else { &self.vm_size }
        );
        let mut set = CloudResourceSet::new(request.id.clone());
        match self.create_resources(request, &mut set).await {
            Ok(address) => {
                tracing::info!("{} is up at {}", request.id, address);
                Ok(Provisioned {
                    resources: set,
                    address,
                })
            }
            Err(e) => Err(CreateFailure {
                partial: set,
                error: format!("{:#}", e),
            }),
        }
    }

    async fn delete(&self, resources: &CloudResourceSet) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for resource in resources.teardown_order() {
            tracing::info!("Deleting {:?} {}", resource.kind, resource.name);
            match self.call(self.delete_command(&resource)).await {
                Ok(r) if r.success() => {}
                Ok(r) if is_not_found(&r) => {
                    tracing::debug!("{} already gone", resource.name);
                }
                Ok(r) => failures.push(format!("{}: {}", resource.name, r.error_excerpt(300))),
                Err(e) => failures.push(format!("{}: {:#}", resource.name, e)),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("could not delete {}", failures.join("; ")))
        }
    }

    async fn discover(&self, host: &HostId) -> anyhow::Result<Option<Provisioned>> {
        let shown = self
            .call(self.az(&["vm", "show", "--show-details", "--name", host.as_str()]))
            .await?;
        if !shown.success() {
            if is_not_found(&shown) {
                return Ok(None);
            }
            return Err(anyhow!("looking up {}: {}", host, shown.error_excerpt(300)));
        }
        let details: VmShowOutput =
            serde_json::from_str(&shown.stdout).context("unparseable vm show output")?;
        let address = details
            .public_ips
            .as_deref()
            .and_then(|ips| ips.split(',').next().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .with_context(|| format!("{} has no public IP", host))?;

        // The VM was named explicitly; anything attached to it is only ours
        // when the VM carries our tag and the name derives from the host id.
        let mut resources = CloudResourceSet::new(host.clone());
        resources.record(ResourceKind::VirtualMachine);
        if details.tagged_for(host) {
            for resource in self.attached_resources(&details).await? {
                if let Err(e) = resources.push(resource) {
                    tracing::warn!("Leaving {} in place: {}", e.name, e);
                }
            }
        } else {
            tracing::warn!(
                "{} has no {} tag; cleanup will remove the VM only",
                host,
                HOST_TAG
            );
        }
        Ok(Some(Provisioned { resources, address }))
    }
}
