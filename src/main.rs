use clap::{Args, Parser, Subcommand};
use pvekube::{
    ClusterLifecycleController, ClusterRequest, DeployReport, ErrorKind, JoinToken,
    LocalArtifactCache, NodeRole, Placement, PlatformCredentials, PlatformEndpoint, PlatformMode,
    ProvisionConfig, ProxmoxPlatformFactory, PveKubeError, PveKubeResult, SshConnector,
    StateLayout, TracingReporter, TrustStore, VmSizing,
};
use std::{process::ExitCode, sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Kubernetes clusters on Proxmox VE
#[derive(Parser, Debug)]
#[command(name = "pvekube")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Seconds a booted VM may take to report its address
    #[arg(long, global = true, default_value_t = 300)]
    address_timeout: u64,

    /// Seconds after which a remote command is abandoned; waits forever when unset
    #[arg(long, global = true)]
    command_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the cluster settings, probe the platform and save them
    Configure(ConfigureArgs),
    /// Create the master and the workers
    Deploy {
        /// Re-bootstrap a cluster that is already running
        #[arg(long)]
        yes: bool,
    },
    /// Grow or shrink the worker pool to COUNT workers
    Scale { count: u32 },
    /// Delete every VM of the cluster and forget it locally
    Destroy {
        #[arg(long)]
        yes: bool,
    },
    /// Rebuild local state from the copy kept on the master
    Recover(RecoverArgs),
    /// Show the recorded cluster
    Info,
    /// Attach this workstation to an existing cluster
    Use {
        #[arg(long)]
        token: String,
    },
}

#[derive(Args, Debug)]
struct PlatformArgs {
    /// Proxmox VE host name or address
    #[arg(long, env = "PVEKUBE_HOST")]
    host: String,
    #[arg(long, env = "PVEKUBE_PORT", default_value_t = 8006)]
    port: u16,
    #[arg(long, env = "PVEKUBE_USERNAME", default_value = "root")]
    username: String,
    #[arg(long, env = "PVEKUBE_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long, env = "PVEKUBE_REALM", default_value = "pam")]
    realm: String,
    /// Accept a self-signed platform certificate
    #[arg(long)]
    insecure: bool,
}

impl PlatformArgs {
    fn split(self) -> (PlatformEndpoint, PlatformCredentials) {
        (
            PlatformEndpoint {
                host: self.host,
                port: self.port,
                accept_invalid_certs: self.insecure,
            },
            PlatformCredentials::new(self.username, self.password, self.realm),
        )
    }
}

#[derive(Args, Debug)]
struct ConfigureArgs {
    #[command(flatten)]
    platform: PlatformArgs,
    /// Platform node that runs the VMs
    #[arg(long)]
    datacenter: String,
    /// Storage that receives the VM disks
    #[arg(long, default_value = "local-lvm")]
    datastore: String,
    /// Resource pool; required on clustered platforms
    #[arg(long)]
    pool: Option<String>,
    /// Tag grouping the cluster's VMs
    #[arg(long, default_value = "")]
    folder: String,
    /// Storage that keeps uploaded guest images
    #[arg(long, default_value = "local")]
    image_storage: String,
    /// Bridge the VMs attach to
    #[arg(long, default_value = "vmbr0")]
    network: String,
    #[arg(long, default_value_t = 2)]
    cpus: u32,
    #[arg(long, default_value_t = 2048)]
    memory_mb: u64,
    #[arg(long = "kubernetes-version", default_value = "v1.29.3")]
    version: String,
    #[arg(long, default_value_t = 2)]
    workers: u32,
    /// Guest image archive inside the artifact cache
    #[arg(long, default_value = "pvekube-guest.ova")]
    guest_image: String,
    /// Discard a locally recorded cluster
    #[arg(long)]
    yes: bool,
}

impl ConfigureArgs {
    fn into_request(self) -> (ClusterRequest, bool) {
        let (endpoint, credentials) = self.platform.split();
        let request = ClusterRequest {
            endpoint,
            credentials,
            // replaced by the probed mode
            platform_mode: PlatformMode::SingleHost,
            placement: Placement {
                datacenter: self.datacenter,
                datastore: self.datastore,
                resource_pool: self.pool,
                folder: self.folder,
                image_storage: self.image_storage,
            },
            sizing: VmSizing {
                cpus: self.cpus,
                memory_mb: self.memory_mb,
            },
            network: self.network,
            kubernetes_version: self.version,
            worker_count: self.workers,
            guest_image: self.guest_image,
        };
        (request, self.yes)
    }
}

#[derive(Args, Debug)]
struct RecoverArgs {
    #[command(flatten)]
    platform: PlatformArgs,
    /// Platform node the master runs on
    #[arg(long)]
    datacenter: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            if let Some(hint) = hint(&e) {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> PveKubeResult<()> {
    let config = ProvisionConfig {
        address_timeout: Duration::from_secs(cli.address_timeout),
        command_timeout: cli.command_timeout.map(Duration::from_secs),
        ..Default::default()
    };
    let controller = controller(config)?;

    match cli.command {
        Commands::Configure(args) => {
            let (request, yes) = args.into_request();
            let saved = controller.configure(request, yes).await?;
            println!(
                "configured {} ({:?}), {} workers",
                saved.endpoint.host, saved.platform_mode, saved.worker_count
            );
        }
        Commands::Deploy { yes } => print_deploy(&controller.deploy(yes).await?),
        Commands::Scale { count } => {
            let outcome = controller.scale(count).await?;
            println!("workers: {} -> {}", outcome.before, outcome.after);
            if let Some(failure) = outcome.failure {
                return Err(failure);
            }
        }
        Commands::Destroy { yes } => {
            controller.destroy(yes).await?;
            println!("cluster destroyed");
        }
        Commands::Recover(args) => {
            let (endpoint, credentials) = args.platform.split();
            let inventory = controller
                .recover(endpoint, credentials, &args.datacenter)
                .await?;
            println!("recovered {} nodes", inventory.nodes().count());
        }
        Commands::Info => {
            let info = controller.info().await?;
            println!("platform:   {} ({:?})", info.platform_host, info.platform_mode);
            println!("kubernetes: {}", info.kubernetes_version);
            for node in &info.nodes {
                let role = match node.role {
                    NodeRole::Master => "master",
                    NodeRole::Worker => "worker",
                };
                println!(
                    "{:<28} {:<7} {:<16} {}",
                    node.name,
                    role,
                    node.address.as_deref().unwrap_or("-"),
                    if node.ready { "ready" } else { "incomplete" }
                );
            }
            if let Some(token) = info.token {
                println!("join token: {token}");
            }
        }
        Commands::Use { token } => {
            let address = controller
                .use_token(&JoinToken::from_string(token))
                .await?;
            println!("attached to the cluster at {address}");
        }
    }
    Ok(())
}

fn controller(config: ProvisionConfig) -> PveKubeResult<ClusterLifecycleController> {
    let layout = StateLayout::from_home_dir()?;
    let trust = Arc::new(TrustStore::new(layout.known_hosts_path()));
    let connector = SshConnector::new(
        Arc::clone(&trust),
        config.connect_timeout,
        config.command_timeout,
    );
    Ok(ClusterLifecycleController::new(
        Arc::new(ProxmoxPlatformFactory::default()),
        Arc::new(connector),
        Arc::new(LocalArtifactCache::new(layout.cache_dir())),
        trust,
        Arc::new(TracingReporter),
        layout,
        config,
    ))
}

fn print_deploy(report: &DeployReport) {
    println!(
        "master {} at {}",
        report.master.name,
        report.master.address.as_deref().unwrap_or("-")
    );
    for worker in &report.workers {
        println!(
            "worker {} at {}",
            worker.name,
            worker.address.as_deref().unwrap_or("-")
        );
    }
    for failure in &report.failed {
        eprintln!("failed: {failure}");
    }
    if let Some(e) = &report.mirror_error {
        eprintln!("state copy on the master is stale: {e}");
    }
    println!("join token: {}", report.token);
}

fn hint(error: &PveKubeError) -> Option<&'static str> {
    if error.is_retryable() {
        return Some("the guest did not answer in time; re-run the same command");
    }
    match error.kind() {
        ErrorKind::Precondition => Some("check `pvekube info` and the flags of the command"),
        ErrorKind::Transport => Some("the VM is kept; re-run the same command to resume"),
        ErrorKind::Platform => Some("nodes created so far are recorded; re-run to continue"),
        ErrorKind::Data => Some("local state is unreadable and was left untouched"),
        ErrorKind::Authentication => Some("check the platform username, password and realm"),
        _ => None,
    }
}
