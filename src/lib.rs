//! Kubernetes clusters on Proxmox VE.
//!
//! `pvekube` imports a guest image, clones or imports one VM per node,
//! configures each guest over SSH and runs `kubeadm` on it. A local
//! inventory records how far every node got, so any command can be re-run
//! after an interruption and picks up where it stopped.
//!
//! # Examples
//!
//! ```no_run
//! use pvekube::{
//!     ClusterLifecycleController, LocalArtifactCache, ProvisionConfig, ProxmoxPlatformFactory,
//!     PveKubeResult, SshConnector, StateLayout, TracingReporter, TrustStore,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> PveKubeResult<()> {
//!     let layout = StateLayout::from_home_dir()?;
//!     let trust = Arc::new(TrustStore::new(layout.known_hosts_path()));
//!     let config = ProvisionConfig::default();
//!     let controller = ClusterLifecycleController::new(
//!         Arc::new(ProxmoxPlatformFactory::default()),
//!         Arc::new(SshConnector::new(
//!             Arc::clone(&trust),
//!             config.connect_timeout,
//!             config.command_timeout,
//!         )),
//!         Arc::new(LocalArtifactCache::new(layout.cache_dir())),
//!         trust,
//!         Arc::new(TracingReporter),
//!         layout,
//!         config,
//!     );
//!
//!     let report = controller.deploy(false).await?;
//!     println!("join token: {}", report.token);
//!     Ok(())
//! }
//! ```

mod auth;
mod cluster;
mod core;

#[cfg(test)]
mod tests;

pub use crate::cluster::application::{
    config::ProvisionConfig,
    reporter::{ProgressReporter, RecordingReporter, TracingReporter},
    service::{
        bootstrap_service::{NodeBootstrapper, extract_join_command, merge_kubeconfig},
        lifecycle_service::{
            ClusterInfo, ClusterLifecycleController, DeployReport, NodeSummary, PlatformFactory,
            ScaleOutcome,
        },
        provision_service::{Checkpoint, InventoryCheckpoint, NodeProvisioner},
    },
};
pub use crate::core::domain::{
    error::{ErrorKind, PveKubeError, PveKubeResult, TransportError, ValidationError},
    model::{
        cluster_request::{
            ClusterRequest, NAME_PREFIX, Placement, PlatformCredentials, PlatformEndpoint,
            PlatformMode, REDACTED, TEMPLATE_NAME, VmSizing,
        },
        inventory::ClusterInventory,
        kubeconfig::Kubeconfig,
        node::{Node, NodeRole, PlatformRef},
        platform_auth::PlatformAuth,
        platform_connection::PlatformConnection,
    },
    value_object::{
        CsrfToken, JoinToken, PlatformHost, PlatformPassword, PlatformPort, PlatformRealm,
        PlatformUrl, PlatformUsername, SessionTicket, is_ipv4,
    },
};
pub use crate::core::infrastructure::{
    api_client::ApiClient,
    artifact_cache::{ArtifactCache, LocalArtifactCache},
    config_store::ConfigStore,
    inventory_store::InventoryStore,
    platform::{ImportSpec, PlatformClient, PowerState, ProxmoxPlatform, VmHandle, VmPath},
    remote::{
        InteractiveShell, PasswordRotation, RemoteAuth, RemoteCommandRunner, RemoteConnector,
        RemoteFile, RemoteTarget, RotationError, RotationState, SshConnector, rotate_password,
    },
    state_layout::StateLayout,
    trust_store::{HostKeyVerdict, TrustStore},
};

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::info;

/// Request throttling for the platform API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

/// Behaviour of the platform HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tickets older than this are refreshed before the next request.
    pub ticket_lifetime: Duration,
    pub rate_limit: Option<RateLimitConfig>,
    /// Delay between two polls of a running platform task.
    pub poll_interval: Duration,
    /// Longest a platform task may run before it counts as failed.
    pub task_timeout: Duration,
    /// Minimum `zxcvbn` score for the platform password, if any.
    pub min_password_score: Option<zxcvbn::Score>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ticket_lifetime: Duration::from_secs(2 * 60 * 60),
            rate_limit: None,
            poll_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(10 * 60),
            min_password_score: None,
        }
    }
}

/// Builder for an authenticated [`ProxmoxPlatform`].
#[derive(Debug, Clone)]
pub struct PlatformClientBuilder {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    realm: Option<String>,
    secure: bool,
    accept_invalid_certs: bool,
    config: ClientConfig,
}

impl Default for PlatformClientBuilder {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            username: None,
            password: None,
            realm: None,
            secure: true,
            accept_invalid_certs: false,
            config: ClientConfig::default(),
        }
    }
}

impl PlatformClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-fills host, port, certificate policy and credentials.
    pub fn from_settings(endpoint: &PlatformEndpoint, credentials: &PlatformCredentials) -> Self {
        Self::new()
            .host(endpoint.host.clone())
            .port(endpoint.port)
            .accept_invalid_certs(endpoint.accept_invalid_certs)
            .credentials(
                credentials.username.clone(),
                credentials.password.clone(),
                credentials.realm.clone(),
            )
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self.realm = Some(realm.into());
        self
    }

    /// `false` talks plain HTTP; only useful against test doubles.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the settings and builds an unauthenticated connection.
    pub fn connection(&self) -> PveKubeResult<PlatformConnection> {
        let host = PlatformHost::new(required("host", self.host.clone())?)?;
        let port = PlatformPort::new(self.port.unwrap_or(8006))?;
        let username = PlatformUsername::new(required("username", self.username.clone())?)?;
        let password = PlatformPassword::new(
            required("password", self.password.clone())?,
            self.config.min_password_score,
        )?;
        let realm = PlatformRealm::new(self.realm.clone().unwrap_or_else(|| "pam".to_string()))?;
        PlatformConnection::new(
            host,
            port,
            username,
            password,
            realm,
            self.secure,
            self.accept_invalid_certs,
        )
    }

    /// Builds the client and logs in.
    pub async fn build(self) -> PveKubeResult<ProxmoxPlatform> {
        let connection = self.connection()?;
        let api = ApiClient::new(connection, self.config)?;
        api.login().await?;
        info!(host = %api.connection().host(), "logged in to platform");
        Ok(ProxmoxPlatform::new(api))
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, ValidationError> {
    value.ok_or_else(|| ValidationError::field(field, format!("{field} is required")))
}

/// [`PlatformFactory`] that logs in to Proxmox VE.
#[derive(Debug, Clone, Default)]
pub struct ProxmoxPlatformFactory {
    config: ClientConfig,
}

impl ProxmoxPlatformFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PlatformFactory for ProxmoxPlatformFactory {
    async fn open(
        &self,
        endpoint: &PlatformEndpoint,
        credentials: &PlatformCredentials,
    ) -> PveKubeResult<Arc<dyn PlatformClient>> {
        let platform = PlatformClientBuilder::from_settings(endpoint, credentials)
            .config(self.config.clone())
            .build()
            .await?;
        Ok(Arc::new(platform))
    }
}
