use crate::core::domain::{
    error::{PveKubeError, PveKubeResult},
    model::cluster_request::Placement,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Worker,
}

/// Opaque platform identifier of a VM, rendered as `kind:id` (`qemu:104`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformRef {
    kind: String,
    id: String,
}

impl PlatformRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for PlatformRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for PlatformRef {
    type Err = PveKubeError;

    fn from_str(raw: &str) -> PveKubeResult<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [kind, id] if !kind.is_empty() && !id.is_empty() => Ok(Self::new(*kind, *id)),
            _ => Err(PveKubeError::Data(format!(
                "platform reference '{raw}' must have the form kind:id"
            ))),
        }
    }
}

impl TryFrom<String> for PlatformRef {
    type Error = PveKubeError;

    fn try_from(raw: String) -> PveKubeResult<Self> {
        raw.parse()
    }
}

impl From<PlatformRef> for String {
    fn from(reference: PlatformRef) -> Self {
        reference.to_string()
    }
}

/// One cluster member as recorded in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: NodeRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_ref: Option<PlatformRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub folder_path: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub datastore: String,
    #[serde(default)]
    pub ready: bool,
    /// Join command captured from `kubeadm init`; masters only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_command: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            role,
            platform_ref: None,
            address: None,
            folder_path: String::new(),
            datacenter: String::new(),
            datastore: String::new(),
            ready: false,
            join_command: None,
        }
    }

    pub fn master(name: impl Into<String>) -> Self {
        Self::new(name, NodeRole::Master)
    }

    pub fn worker(name: impl Into<String>) -> Self {
        Self::new(name, NodeRole::Worker)
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    pub fn is_materialized(&self) -> bool {
        self.platform_ref.is_some()
    }

    /// Records the VM backing this node.
    pub fn attach(&mut self, reference: PlatformRef, folder_path: &str, placement: &Placement) {
        self.platform_ref = Some(reference);
        self.folder_path = folder_path.to_string();
        self.datacenter = placement.datacenter.clone();
        self.datastore = placement.datastore.clone();
    }

    /// Drops everything learned about a VM that no longer exists.
    pub fn detach(&mut self) {
        self.platform_ref = None;
        self.address = None;
        self.ready = false;
    }

    /// Index encoded in a worker name (`...-worker-7` yields 7).
    pub fn worker_index(&self) -> Option<u32> {
        self.name
            .rsplit_once("-worker-")
            .and_then(|(_, index)| index.parse().ok())
    }
}
