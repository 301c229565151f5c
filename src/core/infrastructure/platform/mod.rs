//! Capability interface over the hypervisor control plane.

mod proxmox;

pub use proxmox::ProxmoxPlatform;

use crate::{
    PveKubeError, PveKubeResult,
    core::domain::model::{
        cluster_request::{PlatformMode, Placement, VmSizing},
        node::PlatformRef,
    },
};
use async_trait::async_trait;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Suspended,
}

/// A VM known to exist on the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub reference: PlatformRef,
    /// Platform host the VM is registered on.
    pub host: String,
    pub name: String,
}

/// Everything needed to create a VM from an image archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    pub archive: PathBuf,
    pub target_path: String,
    pub placement: Placement,
    pub network: String,
    pub sizing: VmSizing,
}

/// `/{datacenter}/vm[/{folder...}]/{name}`, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPath {
    pub datacenter: String,
    pub folder: String,
    pub name: String,
}

impl VmPath {
    pub fn parse(path: &str) -> PveKubeResult<Self> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            [datacenter, "vm", middle @ .., name]
                if !datacenter.is_empty() && !name.is_empty() =>
            {
                Ok(Self {
                    datacenter: datacenter.to_string(),
                    folder: middle.join("/"),
                    name: name.to_string(),
                })
            }
            _ => Err(PveKubeError::Data(format!(
                "'{path}' is not a VM path of the form /<datacenter>/vm/<folder>/<name>"
            ))),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Whether the endpoint fronts a multi-host cluster.
    async fn probe_mode(&self) -> PveKubeResult<PlatformMode>;

    /// Finds the VM at an inventory path.
    async fn locate(&self, path: &str) -> PveKubeResult<Option<VmHandle>>;

    /// Finds a VM by name on one datacenter, ignoring its folder.
    async fn locate_by_name(&self, datacenter: &str, name: &str)
    -> PveKubeResult<Option<VmHandle>>;

    async fn locate_ref(&self, reference: &PlatformRef) -> PveKubeResult<Option<VmHandle>>;

    /// Creates a VM from an image archive; returns the existing VM when the
    /// target path is already taken.
    async fn import_image(&self, spec: &ImportSpec) -> PveKubeResult<VmHandle>;

    /// Full clone of `template` named `target_name`.
    async fn clone_vm(
        &self,
        template: &VmHandle,
        target_name: &str,
        placement: &Placement,
    ) -> PveKubeResult<VmHandle>;

    async fn reconfigure(&self, vm: &VmHandle, sizing: &VmSizing) -> PveKubeResult<()>;

    async fn power_state(&self, vm: &VmHandle) -> PveKubeResult<PowerState>;

    async fn power_on(&self, vm: &VmHandle) -> PveKubeResult<()>;

    async fn power_off(&self, vm: &VmHandle) -> PveKubeResult<()>;

    /// Blocks until the guest reports an IPv4 address or `timeout` elapses.
    async fn wait_for_address(&self, vm: &VmHandle, timeout: Duration) -> PveKubeResult<String>;

    /// Powers the VM off and deletes it with its disks.
    async fn destroy(&self, vm: &VmHandle) -> PveKubeResult<()>;
}
