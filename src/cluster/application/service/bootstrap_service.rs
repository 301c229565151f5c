use crate::{
    ArtifactCache, Kubeconfig, Node, NodeRole, PveKubeError, PveKubeResult, TransportError,
    cluster::application::{assets::*, reporter::ProgressReporter},
    core::infrastructure::{
        atomic_file::{read_optional, write_private},
        remote::{RemoteCommandRunner, RemoteFile},
        state_layout::REMOTE_ADMIN_CONF,
    },
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, instrument};

const JOIN_MARKER: &str = "kubeadm join";

/// Installs Kubernetes on a reachable node and wires it into the cluster.
pub struct NodeBootstrapper {
    artifacts: Arc<dyn ArtifactCache>,
    reporter: Arc<dyn ProgressReporter>,
    kubeconfig_path: PathBuf,
}

impl NodeBootstrapper {
    pub fn new(
        artifacts: Arc<dyn ArtifactCache>,
        reporter: Arc<dyn ProgressReporter>,
        kubeconfig_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            artifacts,
            reporter,
            kubeconfig_path: kubeconfig_path.into(),
        }
    }

    /// Initialises the control plane on `node` and records its join command.
    ///
    /// The admin credential produced by `kubeadm init` is merged into the
    /// local kubeconfig.
    #[instrument(skip_all, fields(node = %node.name))]
    pub async fn bootstrap_master(
        &self,
        runner: &dyn RemoteCommandRunner,
        node: &mut Node,
        version: &str,
    ) -> PveKubeResult<()> {
        self.prepare(runner, node, version).await?;

        self.reporter
            .emit(Some(&node.name), format!("initialising control plane {version}"));
        let output = runner.run(&init_script(version)).await?;
        let join_command = extract_join_command(&output).ok_or_else(|| {
            PveKubeError::Data("kubeadm init finished without printing a join command".to_string())
        })?;
        node.join_command = Some(join_command);

        let admin_conf = runner.fetch(REMOTE_ADMIN_CONF).await?;
        merge_kubeconfig(&self.kubeconfig_path, &admin_conf).await?;
        info!(kubeconfig = %self.kubeconfig_path.display(), "control plane ready");
        Ok(())
    }

    /// Whether kubeadm already finished on this node: the admin credential
    /// exists on a master, the kubelet credential on a worker.
    pub async fn is_bootstrapped(
        &self,
        runner: &dyn RemoteCommandRunner,
        role: NodeRole,
    ) -> PveKubeResult<bool> {
        let marker = match role {
            NodeRole::Master => REMOTE_ADMIN_CONF,
            NodeRole::Worker => KUBELET_CONF,
        };
        match runner.run(&file_exists_command(marker)).await {
            Ok(_) => Ok(true),
            Err(TransportError::ExitStatus { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Takes over a master whose control plane is already up: asks it for a
    /// fresh join command and merges its admin credential locally.
    #[instrument(skip_all, fields(node = %node.name))]
    pub async fn adopt_master(
        &self,
        runner: &dyn RemoteCommandRunner,
        node: &mut Node,
    ) -> PveKubeResult<()> {
        self.reporter.emit(
            Some(&node.name),
            "control plane already initialised".to_string(),
        );
        node.join_command = Some(live_join_command(runner).await?);
        let admin_conf = runner.fetch(REMOTE_ADMIN_CONF).await?;
        merge_kubeconfig(&self.kubeconfig_path, &admin_conf).await?;
        Ok(())
    }

    /// Joins `node` to the cluster with `join_command`.
    ///
    /// # Errors
    /// Fails with a precondition error before touching the node when no join
    /// command is known.
    #[instrument(skip_all, fields(node = %node.name))]
    pub async fn bootstrap_worker(
        &self,
        runner: &dyn RemoteCommandRunner,
        node: &Node,
        join_command: Option<&str>,
        version: &str,
    ) -> PveKubeResult<()> {
        let join_command = join_command
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                PveKubeError::Precondition(format!(
                    "no join command for worker {}; deploy a master first",
                    node.name
                ))
            })?;

        self.prepare(runner, node, version).await?;
        runner.run(RESET_MEMBERSHIP).await?;
        self.reporter
            .emit(Some(&node.name), "joining cluster".to_string());
        runner.run(join_command).await?;
        Ok(())
    }

    /// Pushes binaries and units, opens the firewall, names the host and
    /// starts the node services.
    async fn prepare(
        &self,
        runner: &dyn RemoteCommandRunner,
        node: &Node,
        version: &str,
    ) -> PveKubeResult<()> {
        let files = self.node_files(version).await?;
        self.reporter.emit(
            Some(&node.name),
            format!("copying {} files", files.len()),
        );
        for file in &files {
            debug!(path = %file.target_path(), "copy");
            runner.copy(file).await?;
        }

        runner.run(OPEN_FIREWALL).await?;
        runner.run(&set_hostname_command(&node.name)).await?;
        self.reporter
            .emit(Some(&node.name), "starting services".to_string());
        runner.run(START_SERVICES).await?;
        Ok(())
    }

    async fn node_files(&self, version: &str) -> PveKubeResult<Vec<RemoteFile>> {
        let mut files = vec![
            RemoteFile::new(
                KUBELET_SERVICE.as_bytes().to_vec(),
                KUBELET_SERVICE_PATH,
                UNIT_MODE,
            ),
            RemoteFile::new(
                KUBEADM_DROP_IN.as_bytes().to_vec(),
                KUBEADM_DROP_IN_PATH,
                UNIT_MODE,
            ),
        ];

        for tool in NODE_TOOLS {
            let local = self.artifacts.resolve(tool, version).await?;
            files.push(RemoteFile::new(
                read_artifact(&local).await?,
                &format!("{BIN_DIR}/{tool}"),
                BINARY_MODE,
            ));
        }

        let kubectl = self.artifacts.resolve(GUEST_KUBECTL, version).await?;
        files.push(RemoteFile::new(
            read_artifact(&kubectl).await?,
            &format!("{BIN_DIR}/kubectl"),
            BINARY_MODE,
        ));

        let cni = self.artifacts.resolve_cni(version).await?;
        for plugin in CNI_PLUGINS {
            files.push(RemoteFile::new(
                read_artifact(&cni.join(plugin)).await?,
                &format!("{CNI_BIN_DIR}/{plugin}"),
                BINARY_MODE,
            ));
        }
        Ok(files)
    }
}

/// Asks the master for a fresh join command.
pub async fn live_join_command(master: &dyn RemoteCommandRunner) -> PveKubeResult<String> {
    let output = master.run(PRINT_JOIN_COMMAND).await?;
    extract_join_command(&output).ok_or_else(|| {
        PveKubeError::Data("master did not print a join command".to_string())
    })
}

/// First line mentioning `kubeadm join`, trimmed.
///
/// A line ending in `\` continues on the next one, as kubeadm prints it;
/// such lines are folded into a single command. A one-line join command
/// is returned exactly as trimmed.
pub fn extract_join_command(output: &str) -> Option<String> {
    let mut lines = output.lines().skip_while(|l| !l.contains(JOIN_MARKER));
    let mut command = lines.next()?.trim().to_string();
    while let Some(stripped) = command.strip_suffix('\\') {
        command = stripped.trim_end().to_string();
        match lines.next() {
            Some(next) => {
                command.push(' ');
                command.push_str(next.trim());
            }
            None => break,
        }
    }
    Some(command)
}

/// Merges a downloaded admin kubeconfig into the one at `path`.
pub async fn merge_kubeconfig(path: &Path, downloaded: &[u8]) -> PveKubeResult<Kubeconfig> {
    let incoming = std::str::from_utf8(downloaded)
        .map_err(|_| PveKubeError::Data("admin kubeconfig is not UTF-8".to_string()))?;
    let incoming = Kubeconfig::parse(incoming)?;

    let mut merged = match read_optional(path).await? {
        Some(raw) => Kubeconfig::parse(&String::from_utf8_lossy(&raw))?,
        None => Kubeconfig::default(),
    };
    merged.merge(incoming);
    write_private(path, merged.to_yaml()?.as_bytes()).await?;
    Ok(merged)
}

async fn read_artifact(path: &Path) -> PveKubeResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        PveKubeError::Precondition(format!("cannot read artifact {}: {e}", path.display()))
    })
}
