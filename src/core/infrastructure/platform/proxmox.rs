use super::{ImportSpec, PlatformClient, PowerState, VmHandle, VmPath};
use crate::{
    PveKubeError, PveKubeResult,
    core::{
        domain::model::{
            cluster_request::{NAME_PREFIX, Placement, PlatformMode, VmSizing},
            cluster_resource::{ClusterResource, QemuResource},
            node::PlatformRef,
            vm::{
                CloneRequest, ClusterStatusEntry, ConfigUpdate, GuestNetwork, ImportMetadata,
                StorageContent, TaskStatus, VmStatusCurrent,
            },
        },
        infrastructure::api_client::ApiClient,
    },
};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

const QEMU: &str = "qemu";

/// [`PlatformClient`] backed by the Proxmox VE REST API.
#[derive(Debug)]
pub struct ProxmoxPlatform {
    api: ApiClient,
}

impl ProxmoxPlatform {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    async fn qemu_resources(&self) -> PveKubeResult<Vec<QemuResource>> {
        let resources: Vec<ClusterResource> = self.api.get("cluster/resources?type=vm").await?;
        Ok(resources
            .into_iter()
            .filter_map(|resource| match resource {
                ClusterResource::Qemu(vm) => Some(vm),
                ClusterResource::Other => None,
            })
            .collect())
    }

    async fn next_vmid(&self) -> PveKubeResult<u32> {
        let raw: Value = self.api.get("cluster/nextid").await?;
        let parsed = match &raw {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| PveKubeError::Data(format!("unexpected next VM id: {raw}")))
    }

    /// Polls a task until it stops; a non-`OK` exit status is a failure.
    #[instrument(skip(self), level = "debug")]
    async fn wait_for_task(&self, host: &str, upid: &str) -> PveKubeResult<()> {
        let config = self.api.config();
        let deadline = Instant::now() + config.task_timeout;
        let encoded: String = url::form_urlencoded::byte_serialize(upid.as_bytes()).collect();
        loop {
            let status: TaskStatus = self
                .api
                .get(&format!("nodes/{host}/tasks/{encoded}/status"))
                .await?;
            if status.is_finished() {
                return if status.succeeded() {
                    Ok(())
                } else {
                    Err(PveKubeError::Platform(format!(
                        "task {upid} failed: {}",
                        status.exitstatus.as_deref().unwrap_or("no exit status")
                    )))
                };
            }
            if Instant::now() >= deadline {
                return Err(PveKubeError::Platform(format!(
                    "task {upid} still running after {:?}",
                    config.task_timeout
                )));
            }
            sleep(config.poll_interval).await;
        }
    }

    /// Uploads the archive into `import` content unless it is already there.
    async fn ensure_uploaded(
        &self,
        host: &str,
        storage: &str,
        spec: &ImportSpec,
    ) -> PveKubeResult<String> {
        let file_name = spec
            .archive
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PveKubeError::Precondition(format!(
                    "image archive {} has no usable file name",
                    spec.archive.display()
                ))
            })?;
        let volid = format!("{storage}:import/{file_name}");

        let content: Vec<StorageContent> = self
            .api
            .get(&format!("nodes/{host}/storage/{storage}/content?content=import"))
            .await?;
        if content.iter().any(|c| c.volid == volid) {
            debug!(%volid, "image already uploaded");
            return Ok(volid);
        }

        info!(archive = %spec.archive.display(), %host, %storage, "uploading guest image");
        let bytes = tokio::fs::read(&spec.archive).await?;
        let upid: String = self
            .api
            .upload(
                &format!("nodes/{host}/storage/{storage}/upload"),
                "import",
                file_name,
                &bytes,
            )
            .await?;
        self.wait_for_task(host, &upid).await?;
        Ok(volid)
    }

    async fn status(&self, vm: &VmHandle) -> PveKubeResult<VmStatusCurrent> {
        let vmid = vmid(vm)?;
        self.api
            .get(&format!("nodes/{}/qemu/{vmid}/status/current", vm.host))
            .await
    }

    async fn change_power(&self, vm: &VmHandle, action: &str) -> PveKubeResult<()> {
        let vmid = vmid(vm)?;
        let upid: String = self
            .api
            .post(
                &format!("nodes/{}/qemu/{vmid}/status/{action}", vm.host),
                &json!({}),
            )
            .await?;
        self.wait_for_task(&vm.host, &upid).await
    }

    async fn update_config(&self, host: &str, vmid: u32, update: &ConfigUpdate) -> PveKubeResult<()> {
        let upid: Option<String> = self
            .api
            .post(&format!("nodes/{host}/qemu/{vmid}/config"), update)
            .await?;
        match upid {
            Some(upid) => self.wait_for_task(host, &upid).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformClient for ProxmoxPlatform {
    async fn probe_mode(&self) -> PveKubeResult<PlatformMode> {
        let entries: Vec<ClusterStatusEntry> = self.api.get("cluster/status").await?;
        let mode = if entries.iter().any(|e| e.kind == "cluster") {
            PlatformMode::Clustered
        } else {
            PlatformMode::SingleHost
        };
        info!(?mode, "probed platform mode");
        Ok(mode)
    }

    async fn locate(&self, path: &str) -> PveKubeResult<Option<VmHandle>> {
        let path = VmPath::parse(path)?;
        let tag = folder_tag(&path.folder);
        let found = self.qemu_resources().await?.into_iter().find(|vm| {
            vm.node == path.datacenter
                && vm.is_named(&path.name)
                && tag.as_deref().is_none_or(|tag| vm.has_tag(tag))
        });
        Ok(found.map(handle))
    }

    async fn locate_by_name(
        &self,
        datacenter: &str,
        name: &str,
    ) -> PveKubeResult<Option<VmHandle>> {
        let mut matches: Vec<QemuResource> = self
            .qemu_resources()
            .await?
            .into_iter()
            .filter(|vm| vm.node == datacenter && vm.is_named(name))
            .collect();
        if matches.len() > 1 {
            warn!(
                %name,
                count = matches.len(),
                "several VMs share this name; using the first"
            );
        }
        Ok((!matches.is_empty()).then(|| handle(matches.swap_remove(0))))
    }

    async fn locate_ref(&self, reference: &PlatformRef) -> PveKubeResult<Option<VmHandle>> {
        if reference.kind() != QEMU {
            return Err(PveKubeError::Data(format!(
                "unsupported platform reference kind '{}'",
                reference.kind()
            )));
        }
        let wanted: u32 = reference
            .id()
            .parse()
            .map_err(|_| PveKubeError::Data(format!("'{reference}' has a non-numeric VM id")))?;
        let found = self
            .qemu_resources()
            .await?
            .into_iter()
            .find(|vm| vm.vmid == wanted);
        Ok(found.map(handle))
    }

    #[instrument(skip(self, spec), fields(target = %spec.target_path))]
    async fn import_image(&self, spec: &ImportSpec) -> PveKubeResult<VmHandle> {
        if let Some(existing) = self.locate(&spec.target_path).await? {
            debug!(reference = %existing.reference, "target path already populated");
            return Ok(existing);
        }
        let path = VmPath::parse(&spec.target_path)?;
        let host = path.datacenter.as_str();
        let image_storage = spec.placement.image_storage.as_str();

        let volid = self.ensure_uploaded(host, image_storage, spec).await?;
        let encoded: String = url::form_urlencoded::byte_serialize(volid.as_bytes()).collect();
        let metadata: ImportMetadata = self
            .api
            .get(&format!(
                "nodes/{host}/storage/{image_storage}/import-metadata?volume={encoded}"
            ))
            .await?;
        let Some(boot_disk) = metadata.disks.keys().next().cloned() else {
            return Err(PveKubeError::Platform(format!(
                "image {volid} does not describe any disk"
            )));
        };

        let vmid = self.next_vmid().await?;
        let mut body = Map::new();
        body.insert("vmid".into(), json!(vmid));
        body.insert("name".into(), json!(path.name));
        body.insert("cores".into(), json!(spec.sizing.cpus));
        body.insert("memory".into(), json!(spec.sizing.memory_mb));
        body.insert(
            "net0".into(),
            json!(format!("virtio,bridge={}", spec.network)),
        );
        body.insert("agent".into(), json!("1"));
        body.insert("scsihw".into(), json!("virtio-scsi-pci"));
        body.insert(
            "ostype".into(),
            metadata
                .create_args
                .get("ostype")
                .cloned()
                .unwrap_or_else(|| json!("l26")),
        );
        body.insert("tags".into(), json!(tags(&path.folder)));
        body.insert("boot".into(), json!(format!("order={boot_disk}")));
        if let Some(pool) = &spec.placement.resource_pool {
            body.insert("pool".into(), json!(pool));
        }
        for (slot, source) in &metadata.disks {
            body.insert(
                slot.clone(),
                json!(format!(
                    "{}:0,import-from={source}",
                    spec.placement.datastore
                )),
            );
        }

        info!(vmid, %host, "creating VM from image");
        let upid: String = self
            .api
            .post(&format!("nodes/{host}/qemu"), &Value::Object(body))
            .await?;
        self.wait_for_task(host, &upid).await?;

        Ok(VmHandle {
            reference: PlatformRef::new(QEMU, vmid.to_string()),
            host: host.to_string(),
            name: path.name,
        })
    }

    #[instrument(skip(self, template, placement), fields(template = %template.reference))]
    async fn clone_vm(
        &self,
        template: &VmHandle,
        target_name: &str,
        placement: &Placement,
    ) -> PveKubeResult<VmHandle> {
        let source = vmid(template)?;
        let newid = self.next_vmid().await?;
        let request = CloneRequest {
            newid,
            name: target_name.to_string(),
            target: placement.datacenter.clone(),
            full: 1,
            storage: placement.datastore.clone(),
            pool: placement.resource_pool.clone(),
        };
        let upid: String = self
            .api
            .post(
                &format!("nodes/{}/qemu/{source}/clone", template.host),
                &request,
            )
            .await?;
        self.wait_for_task(&template.host, &upid).await?;

        let update = ConfigUpdate {
            tags: Some(tags(&placement.folder)),
            ..Default::default()
        };
        self.update_config(&placement.datacenter, newid, &update)
            .await?;

        Ok(VmHandle {
            reference: PlatformRef::new(QEMU, newid.to_string()),
            host: placement.datacenter.clone(),
            name: target_name.to_string(),
        })
    }

    async fn reconfigure(&self, vm: &VmHandle, sizing: &VmSizing) -> PveKubeResult<()> {
        let update = ConfigUpdate {
            cores: Some(sizing.cpus),
            memory: Some(sizing.memory_mb),
            ..Default::default()
        };
        self.update_config(&vm.host, vmid(vm)?, &update).await
    }

    async fn power_state(&self, vm: &VmHandle) -> PveKubeResult<PowerState> {
        let status = self.status(vm).await?;
        let suspended = matches!(
            status.qmpstatus.as_deref(),
            Some("paused" | "suspended" | "prelaunch")
        );
        Ok(match (status.is_running(), suspended) {
            (true, true) => PowerState::Suspended,
            (true, false) => PowerState::On,
            (false, _) => PowerState::Off,
        })
    }

    async fn power_on(&self, vm: &VmHandle) -> PveKubeResult<()> {
        match self.power_state(vm).await? {
            PowerState::On => Ok(()),
            PowerState::Suspended => self.change_power(vm, "resume").await,
            PowerState::Off => self.change_power(vm, "start").await,
        }
    }

    async fn power_off(&self, vm: &VmHandle) -> PveKubeResult<()> {
        match self.power_state(vm).await? {
            PowerState::Off => Ok(()),
            PowerState::On | PowerState::Suspended => self.change_power(vm, "stop").await,
        }
    }

    async fn wait_for_address(&self, vm: &VmHandle, timeout: Duration) -> PveKubeResult<String> {
        let vmid = vmid(vm)?;
        let poll_interval = self.api.config().poll_interval;
        let path = format!(
            "nodes/{}/qemu/{vmid}/agent/network-get-interfaces",
            vm.host
        );
        let wait = async {
            loop {
                match self.api.get::<GuestNetwork>(&path).await {
                    Ok(network) => {
                        if let Some(address) = network.first_ipv4() {
                            return address;
                        }
                    }
                    Err(error) => debug!(%error, vm = %vm.name, "guest agent not ready"),
                }
                sleep(poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            PveKubeError::Platform(format!(
                "{} reported no IPv4 address within {timeout:?}",
                vm.name
            ))
        })
    }

    #[instrument(skip(self, vm), fields(vm = %vm.name, reference = %vm.reference))]
    async fn destroy(&self, vm: &VmHandle) -> PveKubeResult<()> {
        self.power_off(vm).await?;
        let vmid = vmid(vm)?;
        let upid: String = self
            .api
            .delete(&format!(
                "nodes/{}/qemu/{vmid}?purge=1&destroy-unreferenced-disks=1",
                vm.host
            ))
            .await?;
        self.wait_for_task(&vm.host, &upid).await?;
        info!("VM destroyed");
        Ok(())
    }
}

fn handle(vm: QemuResource) -> VmHandle {
    VmHandle {
        reference: PlatformRef::new(QEMU, vm.vmid.to_string()),
        host: vm.node,
        name: vm.name.unwrap_or_default(),
    }
}

fn vmid(vm: &VmHandle) -> PveKubeResult<u32> {
    vm.reference.id().parse().map_err(|_| {
        PveKubeError::Data(format!("'{}' has a non-numeric VM id", vm.reference))
    })
}

/// Tag standing in for an inventory folder; `None` for the root folder.
pub(crate) fn folder_tag(folder: &str) -> Option<String> {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        return None;
    }
    let sanitized: String = folder
        .chars()
        .map(|c| match c {
            '/' => '.',
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') => {
                c.to_ascii_lowercase()
            }
            _ => '-',
        })
        .collect();
    Some(format!("{NAME_PREFIX}.{sanitized}"))
}

fn tags(folder: &str) -> String {
    match folder_tag(folder) {
        Some(tag) => format!("{NAME_PREFIX};{tag}"),
        None => NAME_PREFIX.to_string(),
    }
}
