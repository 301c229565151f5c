//! Deploy, scale, destroy and recover a cluster.
//!
//! Every operation starts from the inventory on disk and writes it back after
//! each change on the platform, never only at the end.

use crate::{
    ArtifactCache, ClusterInventory, ClusterRequest, ConfigStore, InventoryStore, JoinToken, Node,
    NodeRole, PlatformClient, PlatformCredentials, PlatformEndpoint, PlatformMode, PveKubeError,
    PveKubeResult, StateLayout, TrustStore,
    cluster::application::{
        assets::delete_node_command,
        config::ProvisionConfig,
        reporter::ProgressReporter,
        service::{
            bootstrap_service::{live_join_command, merge_kubeconfig},
            provision_service::{InventoryCheckpoint, NodeProvisioner},
        },
    },
    core::{
        domain::model::cluster_request::master_name,
        infrastructure::{
            atomic_file::{write_atomic, write_private},
            keypair::ensure_keypair,
            platform::PowerState,
            remote::{RemoteAuth, RemoteCommandRunner, RemoteConnector, RemoteFile, RemoteTarget},
            state_layout::{
                REMOTE_ADMIN_CONF, remote_config_path, remote_inventory_path,
                remote_private_key_path, remote_public_key_path,
            },
        },
    },
};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Opens an authenticated platform client for an endpoint.
#[async_trait]
pub trait PlatformFactory: Send + Sync {
    async fn open(
        &self,
        endpoint: &PlatformEndpoint,
        credentials: &PlatformCredentials,
    ) -> PveKubeResult<Arc<dyn PlatformClient>>;
}

/// Result of a deploy that got at least the master up.
#[derive(Debug)]
pub struct DeployReport {
    pub master: Node,
    pub workers: Vec<Node>,
    /// Workers that failed, each wrapped with its node name.
    pub failed: Vec<PveKubeError>,
    /// Set when copying state to the master failed; the cluster still works.
    pub mirror_error: Option<PveKubeError>,
    pub token: JoinToken,
}

#[derive(Debug)]
pub struct ScaleOutcome {
    pub before: u32,
    pub after: u32,
    /// First failure; scaling stopped there.
    pub failure: Option<PveKubeError>,
}

impl ScaleOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub name: String,
    pub role: NodeRole,
    pub address: Option<String>,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub platform_host: String,
    pub platform_mode: PlatformMode,
    pub kubernetes_version: String,
    pub nodes: Vec<NodeSummary>,
    pub token: Option<JoinToken>,
}

pub struct ClusterLifecycleController {
    platforms: Arc<dyn PlatformFactory>,
    connector: Arc<dyn RemoteConnector>,
    artifacts: Arc<dyn ArtifactCache>,
    trust: Arc<TrustStore>,
    reporter: Arc<dyn ProgressReporter>,
    layout: StateLayout,
    config: ProvisionConfig,
    inventory: InventoryStore,
    settings: ConfigStore,
}

impl ClusterLifecycleController {
    pub fn new(
        platforms: Arc<dyn PlatformFactory>,
        connector: Arc<dyn RemoteConnector>,
        artifacts: Arc<dyn ArtifactCache>,
        trust: Arc<TrustStore>,
        reporter: Arc<dyn ProgressReporter>,
        layout: StateLayout,
        config: ProvisionConfig,
    ) -> Self {
        let inventory = InventoryStore::new(layout.inventory_path());
        let settings = ConfigStore::new(layout.config_path());
        Self {
            platforms,
            connector,
            artifacts,
            trust,
            reporter,
            layout,
            config,
            inventory,
            settings,
        }
    }

    pub fn inventory_store(&self) -> &InventoryStore {
        &self.inventory
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.settings
    }

    /// Validates `request`, probes the platform mode once and saves it.
    ///
    /// An existing inventory is only dropped when `discard_confirmed`; its
    /// VMs are left alone.
    #[instrument(skip_all, fields(host = %request.endpoint.host))]
    pub async fn configure(
        &self,
        mut request: ClusterRequest,
        discard_confirmed: bool,
    ) -> PveKubeResult<ClusterRequest> {
        request.validate()?;
        let inventory = self.inventory.load().await?;
        if !inventory.is_empty() && !discard_confirmed {
            return Err(PveKubeError::Precondition(
                "a cluster is recorded locally; destroy it or confirm discarding its inventory"
                    .to_string(),
            ));
        }

        let platform = self
            .platforms
            .open(&request.endpoint, &request.credentials)
            .await?;
        request.platform_mode = platform.probe_mode().await?;
        request.validate()?;
        info!(mode = ?request.platform_mode, "platform probed");

        if !inventory.is_empty() {
            self.inventory.clear().await?;
        }
        self.settings.save(&request).await?;
        Ok(request)
    }

    /// Creates the master, then the workers in parallel.
    ///
    /// A failed master aborts the deploy; failed workers are reported in the
    /// returned [`DeployReport`] and the cluster runs without them.
    #[instrument(skip_all)]
    pub async fn deploy(&self, overwrite_confirmed: bool) -> PveKubeResult<DeployReport> {
        let mut request = self.settings.load().await?;
        request.validate()?;
        let mut inventory = self.inventory.load().await?;

        if inventory.has_ready_master() && !overwrite_confirmed {
            return Err(PveKubeError::Precondition(
                "a ready master already exists; confirm the overwrite to redeploy".to_string(),
            ));
        }

        let platform = self
            .platforms
            .open(&request.endpoint, &request.credentials)
            .await?;
        let master_name = request.master_name();
        let tracked = inventory
            .master
            .as_ref()
            .is_some_and(|m| m.name == master_name && m.is_materialized());
        if !tracked
            && !overwrite_confirmed
            && platform
                .locate_by_name(&request.placement.datacenter, &master_name)
                .await?
                .is_some()
        {
            return Err(PveKubeError::Precondition(format!(
                "{master_name} exists on the platform but not in the local inventory; \
                 run recover or confirm the overwrite"
            )));
        }

        ensure_keypair(&self.layout).await?;

        if overwrite_confirmed {
            for node in inventory.master.iter_mut().chain(inventory.workers.iter_mut()) {
                node.ready = false;
            }
            inventory.join_command = None;
        }
        let master = inventory
            .master
            .clone()
            .filter(|m| m.name == master_name)
            .unwrap_or_else(|| Node::master(&master_name));
        let workers: Vec<Node> = (1..=request.worker_count)
            .map(|index| {
                let name = request.worker_name(index);
                inventory
                    .node(&name)
                    .cloned()
                    .unwrap_or_else(|| Node::worker(name))
            })
            .collect();

        // a confirmed overwrite reinitialises nodes kubeadm already finished
        let provisioner = self.provisioner(platform).rebootstrap(overwrite_confirmed);
        let checkpoint = InventoryCheckpoint::new(self.inventory.clone(), inventory);

        self.reporter
            .emit(Some(&master.name), "provisioning master".to_string());
        let master_name = master.name.clone();
        let master = provisioner
            .provision(master, &request, None, &checkpoint)
            .await
            .map_err(|e| PveKubeError::for_node(&master_name, e))?;
        let join_command = master.join_command.clone();

        let results = join_all(workers.into_iter().map(|node| {
            let provisioner = &provisioner;
            let request = &request;
            let checkpoint = &checkpoint;
            let join_command = join_command.as_deref();
            async move {
                let name = node.name.clone();
                let result = provisioner
                    .provision(node, request, join_command, checkpoint)
                    .await;
                (name, result)
            }
        }))
        .await;

        let mut ready_workers = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(node) => ready_workers.push(node),
                Err(error) => {
                    self.reporter
                        .emit_warning(Some(&name), format!("worker failed: {error}"));
                    failed.push(PveKubeError::for_node(name, error));
                }
            }
        }

        let mut inventory = checkpoint.into_inventory();
        inventory.workers.retain(Node::is_materialized);
        inventory.join_command = join_command;
        self.inventory.save(&inventory).await?;

        request.worker_count = inventory.workers.len() as u32;
        self.settings.save(&request).await?;

        let mirror_error = self
            .mirror(&provisioner, &master, &inventory, &request)
            .await
            .err();
        if let Some(error) = &mirror_error {
            self.reporter.emit_warning(
                Some(&master.name),
                format!("cluster deployed, but copying state to the master failed: {error}"),
            );
        }

        let token = JoinToken::encode(master.address.as_deref().unwrap_or_default());
        Ok(DeployReport {
            master,
            workers: ready_workers,
            failed,
            mirror_error,
            token,
        })
    }

    /// Adds or removes workers at the tail until `target` remain.
    ///
    /// Unless shrinking, workers an earlier run left unready are finished
    /// before new ones are added.
    ///
    /// Stops at the first failing step; the inventory then matches the
    /// nodes that still exist.
    #[instrument(skip_all, fields(target))]
    pub async fn scale(&self, target: u32) -> PveKubeResult<ScaleOutcome> {
        let mut request = self.settings.load().await?;
        let mut inventory = self.inventory.load().await?;
        let master = inventory.ready_master().cloned().ok_or_else(|| {
            PveKubeError::Precondition("no ready master; deploy the cluster first".to_string())
        })?;
        let master_address = master.address.clone().ok_or_else(|| {
            PveKubeError::Data(format!("master {} has no recorded address", master.name))
        })?;

        let before = inventory.workers.len() as u32;
        let unfinished: Vec<Node> = inventory
            .workers
            .iter()
            .filter(|w| !w.ready)
            .cloned()
            .collect();
        if target == before && unfinished.is_empty() {
            return Ok(ScaleOutcome {
                before,
                after: before,
                failure: None,
            });
        }

        let platform = self
            .platforms
            .open(&request.endpoint, &request.credentials)
            .await?;
        let provisioner = self.provisioner(Arc::clone(&platform));
        let master_runner = provisioner.connect(&master_address).await?;

        let mut failure = None;
        if target < before {
            while inventory.workers.len() as u32 > target {
                let Some(node) = inventory.workers.last().cloned() else {
                    break;
                };
                let removal = remove_worker(
                    platform.as_ref(),
                    master_runner.as_ref(),
                    &mut inventory,
                    &self.inventory,
                    &node,
                )
                .await;
                if let Err(error) = removal {
                    failure = Some(PveKubeError::for_node(&node.name, error));
                    break;
                }
                self.reporter.emit(Some(&node.name), "removed".to_string());
            }
        } else {
            ensure_keypair(&self.layout).await?;
            let join_command = live_join_command(master_runner.as_ref()).await?;
            let checkpoint = InventoryCheckpoint::new(self.inventory.clone(), inventory);
            // workers a previous run left half done come first
            for node in unfinished {
                let name = node.name.clone();
                self.reporter.emit(Some(&name), "resuming worker".to_string());
                if let Err(error) = provisioner
                    .provision(node, &request, Some(&join_command), &checkpoint)
                    .await
                {
                    failure = Some(PveKubeError::for_node(name, error));
                    break;
                }
            }
            let pending = if failure.is_some() { 0 } else { target - before };
            for _ in 0..pending {
                let index = checkpoint.snapshot().await.next_worker_index();
                let node = Node::worker(request.worker_name(index));
                let name = node.name.clone();
                self.reporter.emit(Some(&name), "provisioning worker".to_string());
                if let Err(error) = provisioner
                    .provision(node, &request, Some(&join_command), &checkpoint)
                    .await
                {
                    failure = Some(PveKubeError::for_node(name, error));
                    break;
                }
            }
            inventory = checkpoint.into_inventory();
        }

        request.worker_count = inventory.workers.len() as u32;
        self.settings.save(&request).await?;
        if let Err(error) = self
            .mirror(&provisioner, &master, &inventory, &request)
            .await
        {
            self.reporter.emit_warning(
                Some(&master.name),
                format!("copying state to the master failed: {error}"),
            );
        }

        Ok(ScaleOutcome {
            before,
            after: inventory.workers.len() as u32,
            failure,
        })
    }

    /// Destroys the master, then every worker.
    ///
    /// Each node leaves `inventory` (and the file on disk) right after its
    /// VM is gone, so a failure leaves exactly the surviving nodes recorded.
    pub async fn destroy_all(
        &self,
        platform: &dyn PlatformClient,
        inventory: &mut ClusterInventory,
    ) -> PveKubeResult<()> {
        let names: Vec<String> = inventory.nodes().map(|n| n.name.clone()).collect();
        for name in names {
            let Some(node) = inventory.node(&name).cloned() else {
                continue;
            };
            destroy_vm(platform, &node)
                .await
                .map_err(|e| PveKubeError::for_node(&name, e))?;
            inventory.remove(&name);
            self.inventory.save(inventory).await?;
            self.reporter.emit(Some(&name), "destroyed".to_string());
        }
        Ok(())
    }

    /// Tears the whole cluster down; local state is cleared only on success.
    #[instrument(skip_all)]
    pub async fn destroy(&self, confirmed: bool) -> PveKubeResult<()> {
        if !confirmed {
            return Err(PveKubeError::Precondition(
                "destroying the cluster needs explicit confirmation".to_string(),
            ));
        }
        let mut inventory = self.inventory.load().await?;
        if inventory.is_empty() {
            return Err(PveKubeError::Precondition(
                "no cluster recorded in the local inventory".to_string(),
            ));
        }
        let request = self.settings.load().await?;
        let platform = self
            .platforms
            .open(&request.endpoint, &request.credentials)
            .await?;

        self.destroy_all(platform.as_ref(), &mut inventory).await?;
        self.inventory.clear().await?;
        self.settings.clear().await?;
        Ok(())
    }

    /// Rebuilds local state from the copy kept on a running master.
    ///
    /// The supplied endpoint and credentials replace the redacted ones found
    /// on the master.
    #[instrument(skip_all, fields(host = %endpoint.host))]
    pub async fn recover(
        &self,
        endpoint: PlatformEndpoint,
        credentials: PlatformCredentials,
        datacenter: &str,
    ) -> PveKubeResult<ClusterInventory> {
        let platform = self.platforms.open(&endpoint, &credentials).await?;
        let mode = platform.probe_mode().await?;
        let name = master_name(mode);
        let vm = platform
            .locate_by_name(datacenter, &name)
            .await?
            .ok_or_else(|| PveKubeError::NotFound(format!("no VM named {name} on {datacenter}")))?;
        if platform.power_state(&vm).await? != PowerState::On {
            return Err(PveKubeError::Precondition(format!(
                "{name} is not running; start it before recovering"
            )));
        }
        let address = platform
            .wait_for_address(&vm, self.config.address_timeout)
            .await?;
        info!(%address, "found master");

        let runner = self.password_session(&address).await?;
        let inventory = InventoryStore::parse(&runner.fetch(&remote_inventory_path()).await?)?;
        let mut request = ConfigStore::parse(&runner.fetch(&remote_config_path()).await?)?
            .with_credentials(credentials);
        request.endpoint = endpoint;
        let private_key = runner.fetch(&remote_private_key_path()).await?;
        let public_key = runner.fetch(&remote_public_key_path()).await?;
        let admin_conf = runner.fetch(REMOTE_ADMIN_CONF).await?;

        self.inventory.save(&inventory).await?;
        self.settings.save(&request).await?;
        write_private(&self.layout.private_key_path(), &private_key).await?;
        write_atomic(&self.layout.public_key_path(), &public_key).await?;
        merge_kubeconfig(self.layout.kubeconfig_path(), &admin_conf).await?;
        self.reporter
            .emit(Some(&name), format!("recovered {} nodes", inventory.nodes().count()));
        Ok(inventory)
    }

    /// Attaches this workstation to the cluster behind `token`.
    ///
    /// Locally known platform credentials survive; otherwise the redacted
    /// ones from the master are kept.
    #[instrument(skip_all)]
    pub async fn use_token(&self, token: &JoinToken) -> PveKubeResult<String> {
        let address = token.decode()?;
        let runner = self.password_session(&address).await?;
        let admin_conf = runner.fetch(REMOTE_ADMIN_CONF).await?;
        let mut request = ConfigStore::parse(&runner.fetch(&remote_config_path()).await?)?;
        if self.settings.exists().await {
            if let Ok(local) = self.settings.load().await {
                request = request.with_credentials(local.credentials);
            }
        }

        merge_kubeconfig(self.layout.kubeconfig_path(), &admin_conf).await?;
        self.settings.save(&request).await?;
        Ok(address)
    }

    pub async fn info(&self) -> PveKubeResult<ClusterInfo> {
        let request = self.settings.load().await?;
        let inventory = self.inventory.load().await?;
        let nodes = inventory
            .nodes()
            .map(|n| NodeSummary {
                name: n.name.clone(),
                role: n.role,
                address: n.address.clone(),
                ready: n.ready,
            })
            .collect();
        let token = inventory
            .master
            .as_ref()
            .and_then(|m| m.address.as_deref())
            .map(JoinToken::encode);
        Ok(ClusterInfo {
            platform_host: request.endpoint.host,
            platform_mode: request.platform_mode,
            kubernetes_version: request.kubernetes_version,
            nodes,
            token,
        })
    }

    fn provisioner(&self, platform: Arc<dyn PlatformClient>) -> NodeProvisioner {
        NodeProvisioner::new(
            platform,
            Arc::clone(&self.connector),
            Arc::clone(&self.artifacts),
            Arc::clone(&self.trust),
            Arc::clone(&self.reporter),
            self.layout.clone(),
            self.config.clone(),
        )
    }

    async fn password_session(&self, address: &str) -> PveKubeResult<Box<dyn RemoteCommandRunner>> {
        let target = RemoteTarget {
            address: address.to_string(),
            port: self.config.ssh_port,
            user: self.config.guest_user.clone(),
        };
        let auth = RemoteAuth::Password(self.config.guest_password.clone());
        Ok(self.connector.connect(&target, &auth).await?)
    }

    /// Copies inventory, redacted configuration and the node keypair to the
    /// master for a later recover.
    async fn mirror(
        &self,
        provisioner: &NodeProvisioner,
        master: &Node,
        inventory: &ClusterInventory,
        request: &ClusterRequest,
    ) -> PveKubeResult<()> {
        let address = master.address.as_deref().ok_or_else(|| {
            PveKubeError::Data(format!("master {} has no recorded address", master.name))
        })?;
        let files = [
            RemoteFile::new(
                serde_json::to_vec_pretty(inventory)?,
                &remote_inventory_path(),
                "0600",
            ),
            RemoteFile::new(
                ConfigStore::render_redacted(request)?.into_bytes(),
                &remote_config_path(),
                "0600",
            ),
            RemoteFile::new(
                tokio::fs::read(self.layout.private_key_path()).await?,
                &remote_private_key_path(),
                "0600",
            ),
            RemoteFile::new(
                tokio::fs::read(self.layout.public_key_path()).await?,
                &remote_public_key_path(),
                "0644",
            ),
        ];
        let runner = provisioner.connect(address).await?;
        for file in &files {
            runner.copy(file).await?;
        }
        Ok(())
    }
}

/// Destroys the VM behind `node`; a VM that is already gone is fine.
async fn destroy_vm(platform: &dyn PlatformClient, node: &Node) -> PveKubeResult<()> {
    let Some(reference) = &node.platform_ref else {
        return Ok(());
    };
    match platform.locate_ref(reference).await? {
        Some(vm) => platform.destroy(&vm).await,
        None => {
            warn!(node = %node.name, %reference, "VM already gone");
            Ok(())
        }
    }
}

/// Destroys the last worker's VM, drops it from the inventory, then removes
/// it from the cluster membership.
async fn remove_worker(
    platform: &dyn PlatformClient,
    master: &dyn RemoteCommandRunner,
    inventory: &mut ClusterInventory,
    store: &InventoryStore,
    node: &Node,
) -> PveKubeResult<()> {
    destroy_vm(platform, node).await?;
    inventory.remove(&node.name);
    store.save(inventory).await?;
    if node.ready {
        master.run(&delete_node_command(&node.name)).await?;
    }
    Ok(())
}
