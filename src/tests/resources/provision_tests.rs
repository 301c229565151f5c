use crate::{
    ErrorKind, InventoryStore, LocalArtifactCache, Node, PlatformMode, PowerState,
    RecordingReporter, StateLayout, TrustStore,
    cluster::application::{
        assets::KUBELET_CONF,
        service::provision_service::{InventoryCheckpoint, NodeProvisioner},
    },
    core::infrastructure::state_layout::REMOTE_ADMIN_CONF,
    core::domain::model::cluster_request::fixtures::request,
    tests::fakes::{FakeConnector, FakePlatform, Guest, seed_keypair, stage_artifacts, test_config},
};
use std::sync::Arc;
use tempfile::TempDir;

struct Bench {
    _dir: TempDir,
    layout: StateLayout,
    platform: Arc<FakePlatform>,
    connector: FakeConnector,
    provisioner: NodeProvisioner,
    checkpoint: InventoryCheckpoint,
}

impl Bench {
    fn new(mode: PlatformMode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path().join("state"), dir.path().join("kube/config"));
        stage_artifacts(&layout.cache_dir());
        seed_keypair(&layout);

        let platform = Arc::new(FakePlatform::new(mode));
        let connector = FakeConnector::new("changeme");
        let provisioner = provisioner(&layout, &platform, &connector);
        let checkpoint = InventoryCheckpoint::new(
            InventoryStore::new(layout.inventory_path()),
            Default::default(),
        );
        Self {
            _dir: dir,
            layout,
            platform,
            connector,
            provisioner,
            checkpoint,
        }
    }

    fn fresh_provisioner(&self) -> NodeProvisioner {
        provisioner(&self.layout, &self.platform, &self.connector)
    }

    async fn stored(&self) -> crate::ClusterInventory {
        InventoryStore::new(self.layout.inventory_path())
            .load()
            .await
            .unwrap()
    }
}

fn provisioner(
    layout: &StateLayout,
    platform: &Arc<FakePlatform>,
    connector: &FakeConnector,
) -> NodeProvisioner {
    NodeProvisioner::new(
        platform.clone(),
        Arc::new(connector.clone()),
        Arc::new(LocalArtifactCache::new(layout.cache_dir())),
        Arc::new(TrustStore::new(layout.known_hosts_path())),
        Arc::new(RecordingReporter::default()),
        layout.clone(),
        test_config(),
    )
}

#[tokio::test]
async fn fresh_guest_is_rotated_keyed_and_initialised() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);

    let master = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();

    assert!(master.ready);
    let address = master.address.clone().unwrap();
    assert_eq!(address, "10.0.0.100");
    assert_eq!(
        master.join_command.as_deref(),
        Some(
            "kubeadm join 10.0.0.100:6443 --token abcdef.0123456789abcdef \
             --discovery-token-ca-cert-hash sha256:feed"
        )
    );

    // key refused, rotated password refused, then the factory password shell
    let kinds: Vec<&str> = bench.connector.connections().iter().map(|c| c.1).collect();
    assert_eq!(kinds, vec!["shell", "password", "key"]);

    let guest = bench.connector.guest(&address);
    assert_eq!(guest.password, "kubernetes");
    assert!(guest.key_installed);
    assert_eq!(guest.hostname, "pvekube-host-master");
    assert!(guest.files.contains_key("/usr/bin/kubeadm"));
    assert!(guest.files.contains_key("/opt/cni/bin/flannel"));
    assert!(guest.files.contains_key("/etc/systemd/system/kubelet.service"));

    let kubeconfig = std::fs::read_to_string(bench.layout.kubeconfig_path()).unwrap();
    assert!(kubeconfig.contains("kubernetes-admin@kubernetes"));

    let stored = bench.stored().await;
    assert_eq!(stored.master.as_ref(), Some(&master));
    assert_eq!(stored.join_command, master.join_command);
}

#[tokio::test]
async fn rotated_guest_only_gets_the_key() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    bench.connector.seed(
        "10.0.0.100",
        Guest {
            password: "kubernetes".to_string(),
            ..Default::default()
        },
    );

    bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();

    let kinds: Vec<&str> = bench.connector.connections().iter().map(|c| c.1).collect();
    assert_eq!(kinds, vec!["password", "key"]);
}

#[tokio::test]
async fn keyed_guest_is_used_as_is() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    bench.connector.seed(
        "10.0.0.100",
        Guest {
            password: "kubernetes".to_string(),
            key_installed: true,
            ..Default::default()
        },
    );

    bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();

    let kinds: Vec<&str> = bench.connector.connections().iter().map(|c| c.1).collect();
    assert_eq!(kinds, vec!["key"]);
    let guest = bench.connector.guest("10.0.0.100");
    assert!(!guest.commands.iter().any(|c| c.contains("authorized_keys")));
}

#[tokio::test]
async fn ready_node_is_not_touched_again() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    let master = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    let logins = bench.connector.connections().len();

    let again = bench
        .provisioner
        .provision(master.clone(), &req, None, &bench.checkpoint)
        .await
        .unwrap();

    assert_eq!(again, master);
    assert_eq!(bench.connector.connections().len(), logins);
    assert_eq!(bench.platform.imports(), 1);
}

#[tokio::test]
async fn same_spec_twice_adopts_the_running_master() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    let first = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    let power_offs = bench.platform.power_offs();

    let second = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();

    assert!(second.ready);
    assert_eq!(second.platform_ref, first.platform_ref);
    assert_eq!(second.address, first.address);
    assert_eq!(
        second.join_command.as_deref(),
        Some(
            "kubeadm join 10.0.0.100:6443 --token fresh.0123456789abcdef \
             --discovery-token-ca-cert-hash sha256:feed"
        )
    );
    assert_eq!(bench.platform.imports(), 1);
    assert_eq!(bench.platform.power_offs(), power_offs);

    let guest = bench.connector.guest("10.0.0.100");
    let count = |needle: &str| guest.commands.iter().filter(|c| c.contains(needle)).count();
    assert_eq!(count("kubeadm init"), 1);
    assert_eq!(count("kubeadm reset"), 1);
    assert!(guest.files.contains_key(REMOTE_ADMIN_CONF));
    assert_eq!(bench.stored().await.join_command, second.join_command);
}

#[tokio::test]
async fn joined_worker_is_adopted_without_joining_again() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    let master = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    let join = master.join_command.as_deref();
    let first = bench
        .provisioner
        .provision(Node::worker(req.worker_name(1)), &req, join, &bench.checkpoint)
        .await
        .unwrap();

    let second = bench
        .provisioner
        .provision(Node::worker(req.worker_name(1)), &req, join, &bench.checkpoint)
        .await
        .unwrap();

    assert!(second.ready);
    assert_eq!(second.platform_ref, first.platform_ref);
    let guest = bench.connector.guest(first.address.as_deref().unwrap());
    let joins = guest
        .commands
        .iter()
        .filter(|c| c.starts_with("kubeadm join"))
        .count();
    assert_eq!(joins, 1);
    assert!(guest.files.contains_key(KUBELET_CONF));
}

#[tokio::test]
async fn rebootstrap_reinitialises_a_finished_master() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    let provisioner = bench.fresh_provisioner().rebootstrap(true);

    provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();

    let guest = bench.connector.guest("10.0.0.100");
    let inits = guest
        .commands
        .iter()
        .filter(|c| c.contains("kubeadm init"))
        .count();
    assert_eq!(inits, 2);
    assert_eq!(bench.platform.imports(), 1);
}

#[tokio::test]
async fn vanished_vm_is_rebuilt() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    let master = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    bench.platform.vanish(&master.name);

    let rebuilt = bench
        .provisioner
        .provision(master.clone(), &req, None, &bench.checkpoint)
        .await
        .unwrap();

    assert!(rebuilt.ready);
    assert_ne!(rebuilt.platform_ref, master.platform_ref);
    assert_eq!(rebuilt.address.as_deref(), Some("10.0.0.101"));
    assert_eq!(bench.platform.imports(), 2);
}

#[tokio::test]
async fn failed_creation_records_nothing_and_retry_succeeds() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    bench.platform.fail_create("pvekube-host-worker-1");

    let master = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    let worker = Node::worker(req.worker_name(1));
    let join = master.join_command.clone();
    let error = bench
        .provisioner
        .provision(worker.clone(), &req, join.as_deref(), &bench.checkpoint)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Platform);
    assert!(bench.stored().await.node(&worker.name).is_none());

    bench.platform.heal();
    let worker = bench
        .provisioner
        .provision(worker, &req, join.as_deref(), &bench.checkpoint)
        .await
        .unwrap();
    assert!(worker.ready);
    assert_eq!(bench.stored().await.workers, vec![worker]);
}

#[tokio::test]
async fn worker_without_join_command_creates_nothing() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);

    let error = bench
        .provisioner
        .provision(Node::worker(req.worker_name(1)), &req, None, &bench.checkpoint)
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Precondition);
    assert!(bench.platform.vm_names().is_empty());
    assert!(bench.connector.connections().is_empty());
}

#[tokio::test]
async fn failed_join_leaves_the_vm_recorded_but_not_ready() {
    let bench = Bench::new(PlatformMode::SingleHost);
    let req = request(PlatformMode::SingleHost);
    let master = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    bench.connector.fail_join("pvekube-host-worker-1");

    let error = bench
        .provisioner
        .provision(
            Node::worker(req.worker_name(1)),
            &req,
            master.join_command.as_deref(),
            &bench.checkpoint,
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Transport);
    let stored = bench.stored().await;
    let worker = stored.node("pvekube-host-worker-1").unwrap();
    assert!(worker.is_materialized());
    assert!(worker.address.is_some());
    assert!(!worker.ready);
}

#[tokio::test]
async fn clustered_nodes_are_cloned_from_one_template() {
    let bench = Bench::new(PlatformMode::Clustered);
    let req = request(PlatformMode::Clustered);
    let master = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    bench
        .provisioner
        .provision(
            Node::worker(req.worker_name(1)),
            &req,
            master.join_command.as_deref(),
            &bench.checkpoint,
        )
        .await
        .unwrap();

    assert_eq!(bench.platform.imports(), 1);
    assert_eq!(bench.platform.clones(), 2);
    let template = bench.platform.vm("pvekube-template").unwrap();
    assert_eq!(template.power, PowerState::Off);
    assert_eq!(template.path, "/pve1/vm/kube/pvekube-template");
}

#[tokio::test]
async fn running_template_is_replaced() {
    let bench = Bench::new(PlatformMode::Clustered);
    let req = request(PlatformMode::Clustered);
    let master = bench
        .provisioner
        .provision(Node::master(req.master_name()), &req, None, &bench.checkpoint)
        .await
        .unwrap();
    bench.platform.set_power("pvekube-template", PowerState::On);

    bench
        .provisioner
        .provision(
            Node::worker(req.worker_name(1)),
            &req,
            master.join_command.as_deref(),
            &bench.checkpoint,
        )
        .await
        .unwrap();

    assert_eq!(bench.platform.imports(), 2);
    assert_eq!(bench.platform.destroyed(), vec!["pvekube-template".to_string()]);
}
