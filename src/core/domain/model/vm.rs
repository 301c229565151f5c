//! Wire shapes of the guest, task and storage endpoints.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every API response is wrapped as `{"data": ...}`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: T,
}

/// Entry of `GET /cluster/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterStatusEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// `GET /nodes/{node}/qemu/{vmid}/status/current`, reduced to what is used.
#[derive(Debug, Clone, Deserialize)]
pub struct VmStatusCurrent {
    pub status: String,
    #[serde(default)]
    pub qmpstatus: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl VmStatusCurrent {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.status == "stopped"
    }

    pub fn succeeded(&self) -> bool {
        self.exitstatus.as_deref() == Some("OK")
    }
}

/// `GET /nodes/{node}/qemu/{vmid}/agent/network-get-interfaces`.
#[derive(Debug, Clone, Deserialize)]
pub struct GuestNetwork {
    #[serde(default)]
    pub result: Vec<GuestInterface>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuestInterface {
    pub name: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<GuestAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuestAddress {
    #[serde(rename = "ip-address-type")]
    pub address_type: String,
    #[serde(rename = "ip-address")]
    pub address: String,
}

/// Interfaces the container runtime and pod network add on a node.
const VIRTUAL_INTERFACES: [&str; 4] = ["docker", "cni", "flannel", "veth"];

impl GuestNetwork {
    /// First IPv4 address on the node's own interface, skipping loopback and
    /// the bridges and tunnels Kubernetes networking creates.
    pub fn first_ipv4(&self) -> Option<String> {
        self.result
            .iter()
            .filter(|iface| {
                iface.name != "lo"
                    && !VIRTUAL_INTERFACES
                        .iter()
                        .any(|prefix| iface.name.starts_with(prefix))
            })
            .flat_map(|iface| iface.ip_addresses.iter())
            .find(|addr| addr.address_type == "ipv4" && !addr.address.starts_with("127."))
            .map(|addr| addr.address.clone())
    }
}

/// Entry of `GET /nodes/{node}/storage/{storage}/content`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageContent {
    pub volid: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// `GET /nodes/{node}/storage/{storage}/import-metadata`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportMetadata {
    /// Target disk slot (`scsi0`, ...) to the volume it imports from.
    #[serde(default)]
    pub disks: BTreeMap<String, String>,
    /// Suggested guest settings read from the image descriptor.
    #[serde(rename = "create-args", default)]
    pub create_args: BTreeMap<String, serde_json::Value>,
}

/// Body of `POST /nodes/{node}/qemu/{vmid}/clone`.
#[derive(Debug, Clone, Serialize)]
pub struct CloneRequest {
    pub newid: u32,
    pub name: String,
    pub target: String,
    pub full: u8,
    pub storage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

/// Body of `POST /nodes/{node}/qemu/{vmid}/config`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}
