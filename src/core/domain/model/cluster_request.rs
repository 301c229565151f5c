//! The operator's answers for one cluster: where it lives on the platform,
//! how its VMs are sized and which Kubernetes release it runs.

use crate::core::domain::{
    error::ValidationError,
    value_object::{validate_host, validate_password, validate_port, validate_realm, validate_username},
};
use serde::{Deserialize, Serialize};

/// Prefix shared by every VM this tool creates.
pub const NAME_PREFIX: &str = "pvekube";
/// Name of the powered-off template cloned in clustered mode.
pub const TEMPLATE_NAME: &str = "pvekube-template";
/// Placeholder written instead of platform credentials in shared copies.
pub const REDACTED: &str = "pvekube-redacted";

const MIN_CPUS: u32 = 2;
const MIN_MEMORY_MB: u64 = 1700;

/// Whether the endpoint manages a multi-host cluster or a single host.
///
/// Probed once during configuration and never re-probed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformMode {
    Clustered,
    SingleHost,
}

impl PlatformMode {
    /// Short label embedded in node names.
    pub fn label(self) -> &'static str {
        match self {
            PlatformMode::Clustered => "cluster",
            PlatformMode::SingleHost => "host",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEndpoint {
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCredentials {
    pub username: String,
    pub password: String,
    #[serde(default = "default_realm")]
    pub realm: String,
}

impl PlatformCredentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: realm.into(),
        }
    }

    pub fn is_redacted(&self) -> bool {
        self.username == REDACTED || self.password == REDACTED
    }
}

impl std::fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("realm", &self.realm)
            .finish()
    }
}

/// Where VMs are created.
///
/// `datacenter` is the platform host (node) that runs the VMs, `datastore`
/// the storage that receives their disks and `image_storage` the storage
/// that keeps uploaded guest image archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub datacenter: String,
    pub datastore: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    #[serde(default)]
    pub folder: String,
    #[serde(default = "default_image_storage")]
    pub image_storage: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSizing {
    pub cpus: u32,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub endpoint: PlatformEndpoint,
    pub credentials: PlatformCredentials,
    pub platform_mode: PlatformMode,
    pub placement: Placement,
    pub sizing: VmSizing,
    pub network: String,
    pub kubernetes_version: String,
    pub worker_count: u32,
    /// File name of the guest image archive inside the artifact cache.
    #[serde(default = "default_guest_image")]
    pub guest_image: String,
}

impl ClusterRequest {
    /// Checks every field; performs no I/O.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_host(&self.endpoint.host)?;
        validate_port(self.endpoint.port)?;
        validate_username(&self.credentials.username)?;
        validate_password(&self.credentials.password, None)?;
        validate_realm(&self.credentials.realm)?;

        require_name("datacenter", &self.placement.datacenter)?;
        require_name("datastore", &self.placement.datastore)?;
        require_name("image_storage", &self.placement.image_storage)?;
        if !self.placement.folder.is_empty() {
            for segment in self.placement.folder.split('/') {
                require_name("folder", segment)?;
            }
        }
        match (&self.platform_mode, &self.placement.resource_pool) {
            (PlatformMode::Clustered, None) => {
                return Err(ValidationError::field(
                    "resource_pool",
                    "a resource pool is required when the platform is clustered",
                ));
            }
            (_, Some(pool)) => require_name("resource_pool", pool)?,
            _ => {}
        }

        if self.sizing.cpus < MIN_CPUS {
            return Err(ValidationError::field(
                "cpus",
                format!("kubeadm needs at least {MIN_CPUS} vCPUs"),
            ));
        }
        if self.sizing.memory_mb < MIN_MEMORY_MB {
            return Err(ValidationError::field(
                "memory_mb",
                format!("kubeadm needs at least {MIN_MEMORY_MB} MB of memory"),
            ));
        }
        if self.network.trim().is_empty() {
            return Err(ValidationError::field("network", "network cannot be empty"));
        }
        validate_kubernetes_version(&self.kubernetes_version)?;
        if self.guest_image.trim().is_empty() || self.guest_image.contains('/') {
            return Err(ValidationError::field(
                "guest_image",
                "guest image must be a plain file name",
            ));
        }
        Ok(())
    }

    /// Copy safe to share: platform credentials replaced by a placeholder.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.credentials.username = REDACTED.to_string();
        copy.credentials.password = REDACTED.to_string();
        copy
    }

    pub fn with_credentials(mut self, credentials: PlatformCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn master_name(&self) -> String {
        master_name(self.platform_mode)
    }

    /// Name of the `index`-th worker, counting from 1.
    pub fn worker_name(&self, index: u32) -> String {
        format!("{NAME_PREFIX}-{}-worker-{index}", self.platform_mode.label())
    }

    /// Folder path VMs of this cluster live under, `/{datacenter}/vm[/{folder}]`.
    pub fn vm_folder(&self) -> String {
        let base = format!("/{}/vm", self.placement.datacenter);
        let folder = self.placement.folder.trim_matches('/');
        if folder.is_empty() {
            base
        } else {
            format!("{base}/{folder}")
        }
    }

    pub fn node_path(&self, name: &str) -> String {
        format!("{}/{name}", self.vm_folder())
    }

    pub fn template_path(&self) -> String {
        self.node_path(TEMPLATE_NAME)
    }
}

pub fn master_name(mode: PlatformMode) -> String {
    format!("{NAME_PREFIX}-{}-master", mode.label())
}

fn require_name(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::field(field, "cannot be empty"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::field(
            field,
            format!("'{value}' may only contain alphanumerics, '-', '_' and '.'"),
        ));
    }
    Ok(())
}

fn validate_kubernetes_version(version: &str) -> Result<(), ValidationError> {
    let numbers = version.strip_prefix('v').ok_or_else(|| {
        ValidationError::field("kubernetes_version", "version must look like v1.29.3")
    })?;
    let parts: Vec<&str> = numbers.split('.').collect();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(ValidationError::field(
            "kubernetes_version",
            format!("'{version}' is not a vMAJOR.MINOR.PATCH release"),
        ));
    }
    Ok(())
}

fn default_api_port() -> u16 {
    8006
}

fn default_realm() -> String {
    "pam".to_string()
}

fn default_image_storage() -> String {
    "local".to_string()
}

fn default_guest_image() -> String {
    "pvekube-guest.ova".to_string()
}
