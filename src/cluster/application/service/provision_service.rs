//! Brings one node from "named in the inventory" to "ready cluster member".
//!
//! Every externally visible step (VM created, address assigned, node ready)
//! is handed to a [`Checkpoint`] before the next one starts, so a process
//! killed half way leaves an inventory that matches what exists and a rerun
//! skips the finished steps.

use crate::{
    ArtifactCache, ClusterInventory, ClusterRequest, InventoryStore, Node, NodeRole,
    PlatformClient, PlatformMode, PveKubeError, PveKubeResult, StateLayout, TrustStore,
    cluster::application::{
        assets::install_key_command, config::ProvisionConfig, reporter::ProgressReporter,
        service::bootstrap_service::NodeBootstrapper,
    },
    core::infrastructure::{
        keypair::public_key,
        platform::{ImportSpec, PowerState, VmHandle},
        remote::{
            PasswordRotation, RemoteAuth, RemoteCommandRunner, RemoteConnector, RemoteTarget,
            rotate_password,
        },
    },
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Receives a node snapshot after every step that changed reality.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn record(&self, node: &Node) -> PveKubeResult<()>;
}

/// Folds node snapshots into an inventory and saves it each time.
pub struct InventoryCheckpoint {
    store: InventoryStore,
    inventory: Mutex<ClusterInventory>,
}

impl InventoryCheckpoint {
    pub fn new(store: InventoryStore, inventory: ClusterInventory) -> Self {
        Self {
            store,
            inventory: Mutex::new(inventory),
        }
    }

    pub async fn snapshot(&self) -> ClusterInventory {
        self.inventory.lock().await.clone()
    }

    pub fn into_inventory(self) -> ClusterInventory {
        self.inventory.into_inner()
    }
}

#[async_trait]
impl Checkpoint for InventoryCheckpoint {
    async fn record(&self, node: &Node) -> PveKubeResult<()> {
        let mut inventory = self.inventory.lock().await;
        inventory.upsert(node.clone());
        self.store.save(&inventory).await
    }
}

pub struct NodeProvisioner {
    platform: Arc<dyn PlatformClient>,
    connector: Arc<dyn RemoteConnector>,
    artifacts: Arc<dyn ArtifactCache>,
    bootstrapper: NodeBootstrapper,
    trust: Arc<TrustStore>,
    reporter: Arc<dyn ProgressReporter>,
    layout: StateLayout,
    config: ProvisionConfig,
    rebootstrap: bool,
    template_lock: Mutex<()>,
}

impl NodeProvisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        connector: Arc<dyn RemoteConnector>,
        artifacts: Arc<dyn ArtifactCache>,
        trust: Arc<TrustStore>,
        reporter: Arc<dyn ProgressReporter>,
        layout: StateLayout,
        config: ProvisionConfig,
    ) -> Self {
        let bootstrapper = NodeBootstrapper::new(
            Arc::clone(&artifacts),
            Arc::clone(&reporter),
            layout.kubeconfig_path(),
        );
        Self {
            platform,
            connector,
            artifacts,
            bootstrapper,
            trust,
            reporter,
            layout,
            config,
            rebootstrap: false,
            template_lock: Mutex::new(()),
        }
    }

    /// Runs kubeadm again even on nodes where it already finished.
    pub fn rebootstrap(mut self, yes: bool) -> Self {
        self.rebootstrap = yes;
        self
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Provisions `node` and returns its final snapshot.
    ///
    /// A node that is already ready and whose VM still exists is returned
    /// unchanged. A VM found on the platform is adopted without a reboot, and
    /// kubeadm only runs when the node has not finished it before (unless
    /// [`rebootstrap`](Self::rebootstrap) is set). Workers need
    /// `join_command`; without it nothing is created.
    #[instrument(skip_all, fields(node = %node.name))]
    pub async fn provision(
        &self,
        mut node: Node,
        request: &ClusterRequest,
        join_command: Option<&str>,
        checkpoint: &dyn Checkpoint,
    ) -> PveKubeResult<Node> {
        if !node.is_master() && join_command.is_none_or(|c| c.trim().is_empty()) {
            return Err(PveKubeError::Precondition(format!(
                "worker {} cannot join without a join command",
                node.name
            )));
        }

        if node.ready {
            if let Some(reference) = &node.platform_ref {
                if self.platform.locate_ref(reference).await?.is_some() {
                    debug!("already provisioned");
                    return Ok(node);
                }
            }
            warn!("node was ready but its VM is gone; rebuilding");
            node.detach();
            checkpoint.record(&node).await?;
        }

        let vm = self.materialize(&mut node, request, checkpoint).await?;
        self.start(&mut node, &vm, request, checkpoint).await?;
        let address = node
            .address
            .clone()
            .ok_or_else(|| PveKubeError::Platform(format!("{} has no address", node.name)))?;

        let purged = self.trust.purge(&address).await?;
        if purged > 0 {
            debug!(%address, purged, "dropped stale host keys");
        }

        let runner = self.access(&node, &address).await?;
        let finished = !self.rebootstrap
            && self
                .bootstrapper
                .is_bootstrapped(runner.as_ref(), node.role)
                .await?;
        match (node.role, finished) {
            (NodeRole::Master, true) => {
                self.bootstrapper
                    .adopt_master(runner.as_ref(), &mut node)
                    .await?
            }
            (NodeRole::Worker, true) => {
                self.reporter
                    .emit(Some(&node.name), "already a cluster member".to_string());
            }
            (NodeRole::Master, false) => {
                self.bootstrapper
                    .bootstrap_master(runner.as_ref(), &mut node, &request.kubernetes_version)
                    .await?
            }
            (NodeRole::Worker, false) => {
                self.bootstrapper
                    .bootstrap_worker(
                        runner.as_ref(),
                        &node,
                        join_command,
                        &request.kubernetes_version,
                    )
                    .await?
            }
        }

        node.ready = true;
        checkpoint.record(&node).await?;
        self.reporter.emit(Some(&node.name), "ready".to_string());
        Ok(node)
    }

    /// Key-authenticated session to a configured node.
    pub async fn connect(&self, address: &str) -> PveKubeResult<Box<dyn RemoteCommandRunner>> {
        Ok(self
            .connector
            .connect(&self.target(address), &self.key_auth())
            .await?)
    }

    /// Finds or creates the VM behind `node` and records it.
    async fn materialize(
        &self,
        node: &mut Node,
        request: &ClusterRequest,
        checkpoint: &dyn Checkpoint,
    ) -> PveKubeResult<VmHandle> {
        if let Some(reference) = node.platform_ref.clone() {
            match self.platform.locate_ref(&reference).await? {
                Some(vm) => return Ok(vm),
                None => {
                    warn!(%reference, "recorded VM no longer exists");
                    node.detach();
                }
            }
        }

        let path = request.node_path(&node.name);
        let vm = match self.platform.locate(&path).await? {
            Some(vm) => {
                info!(%path, "adopting existing VM");
                vm
            }
            None => match request.platform_mode {
                PlatformMode::Clustered => {
                    let template = self.ensure_template(request).await?;
                    self.reporter
                        .emit(Some(&node.name), "cloning template".to_string());
                    self.platform
                        .clone_vm(&template, &node.name, &request.placement)
                        .await?
                }
                PlatformMode::SingleHost => {
                    self.reporter
                        .emit(Some(&node.name), "importing guest image".to_string());
                    let spec = self.import_spec(request, path).await?;
                    self.platform.import_image(&spec).await?
                }
            },
        };

        node.attach(vm.reference.clone(), &request.vm_folder(), &request.placement);
        checkpoint.record(node).await?;
        Ok(vm)
    }

    /// Powered-off template to clone from, imported on first use.
    async fn ensure_template(&self, request: &ClusterRequest) -> PveKubeResult<VmHandle> {
        let _guard = self.template_lock.lock().await;
        let path = request.template_path();
        if let Some(template) = self.platform.locate(&path).await? {
            if self.platform.power_state(&template).await? == PowerState::Off {
                return Ok(template);
            }
            warn!(%path, "template is running; replacing it");
            self.platform.destroy(&template).await?;
        }
        self.reporter
            .emit(None, "importing guest image as template".to_string());
        let spec = self.import_spec(request, path).await?;
        self.platform.import_image(&spec).await
    }

    async fn import_spec(
        &self,
        request: &ClusterRequest,
        target_path: String,
    ) -> PveKubeResult<ImportSpec> {
        Ok(ImportSpec {
            archive: self.artifacts.resolve_image(&request.guest_image).await?,
            target_path,
            placement: request.placement.clone(),
            network: request.network.clone(),
            sizing: request.sizing,
        })
    }

    /// Sizes and boots the VM, then records its address. A running VM is
    /// never restarted; only its address is read.
    async fn start(
        &self,
        node: &mut Node,
        vm: &VmHandle,
        request: &ClusterRequest,
        checkpoint: &dyn Checkpoint,
    ) -> PveKubeResult<()> {
        let state = self.platform.power_state(vm).await?;
        if state == PowerState::On {
            let address = self
                .platform
                .wait_for_address(vm, self.config.address_timeout)
                .await?;
            if node.address.as_deref() != Some(address.as_str()) {
                node.address = Some(address);
                checkpoint.record(node).await?;
            }
            return Ok(());
        }

        if state != PowerState::Off {
            self.platform.power_off(vm).await?;
        }
        self.platform.reconfigure(vm, &request.sizing).await?;
        self.platform.power_on(vm).await?;
        self.reporter
            .emit(Some(&node.name), "waiting for an address".to_string());
        let address = self
            .platform
            .wait_for_address(vm, self.config.address_timeout)
            .await?;
        info!(%address, "VM is up");
        node.address = Some(address);
        checkpoint.record(node).await
    }

    /// Opens a key-authenticated session, configuring guest access first if
    /// the node does not accept the key yet.
    ///
    /// Probe order: node key, then the rotated password (install the key
    /// only), then the factory password (rotate, then install the key).
    async fn access(
        &self,
        node: &Node,
        address: &str,
    ) -> PveKubeResult<Box<dyn RemoteCommandRunner>> {
        let target = self.target(address);
        let key_auth = self.key_auth();
        match self.connector.connect(&target, &key_auth).await {
            Ok(runner) => return Ok(runner),
            Err(error) if error.is_auth_rejection() => {}
            Err(error) => return Err(error.into()),
        }

        let password = RemoteAuth::Password(self.config.guest_password.clone());
        let runner = match self.connector.connect(&target, &password).await {
            Ok(runner) => runner,
            Err(error) if error.is_auth_rejection() => {
                self.reporter
                    .emit(Some(&node.name), "rotating factory password".to_string());
                let mut shell = self
                    .connector
                    .open_shell(&target, &self.config.default_password)
                    .await?;
                let mut rotation = PasswordRotation::new(
                    self.config.default_password.as_str(),
                    self.config.guest_password.as_str(),
                );
                rotate_password(shell.as_mut(), &mut rotation, self.config.rotation_timeout)
                    .await?;
                drop(shell);
                self.connector.connect(&target, &password).await?
            }
            Err(error) => return Err(error.into()),
        };

        let key = public_key(&self.layout).await?;
        runner.run(&install_key_command(&key)).await?;
        debug!("installed node key");
        Ok(self.connector.connect(&target, &key_auth).await?)
    }

    fn target(&self, address: &str) -> RemoteTarget {
        RemoteTarget {
            address: address.to_string(),
            port: self.config.ssh_port,
            user: self.config.guest_user.clone(),
        }
    }

    fn key_auth(&self) -> RemoteAuth {
        RemoteAuth::PrivateKey(self.layout.private_key_path())
    }
}
