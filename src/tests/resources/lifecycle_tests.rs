use crate::{
    ConfigStore, ErrorKind, InventoryStore, JoinToken, NodeRole, PlatformCredentials,
    PlatformMode, PowerState, REDACTED,
    core::domain::model::cluster_request::fixtures::request,
    tests::fakes::{FakeConnector, FakePlatform, Workstation},
};
use std::sync::Arc;

const MASTER: &str = "pvekube-host-master";
const MASTER_ADDRESS: &str = "10.0.0.100";

struct Lab {
    platform: Arc<FakePlatform>,
    connector: FakeConnector,
}

impl Lab {
    fn new(mode: PlatformMode) -> Self {
        Self {
            platform: Arc::new(FakePlatform::new(mode)),
            connector: FakeConnector::new("changeme"),
        }
    }

    async fn workstation(&self) -> Workstation {
        Workstation::configured(
            &self.platform,
            &self.connector,
            &request(PlatformMode::SingleHost),
        )
        .await
    }

    fn bare_workstation(&self) -> Workstation {
        Workstation::new(&self.platform, &self.connector)
    }
}

async fn stored(ws: &Workstation) -> crate::ClusterInventory {
    InventoryStore::new(ws.layout.inventory_path())
        .load()
        .await
        .unwrap()
}

async fn stored_config(ws: &Workstation) -> crate::ClusterRequest {
    ConfigStore::new(ws.layout.config_path()).load().await.unwrap()
}

fn worker_names(inventory: &crate::ClusterInventory) -> Vec<&str> {
    inventory.workers.iter().map(|w| w.name.as_str()).collect()
}

#[tokio::test]
async fn deploy_brings_up_master_and_workers() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;

    let report = ws.controller.deploy(false).await.unwrap();

    assert!(report.failed.is_empty());
    assert!(report.mirror_error.is_none());
    assert_eq!(report.workers.len(), 2);
    assert_eq!(report.token.decode().unwrap(), MASTER_ADDRESS);

    // a fresh load sees exactly what was deployed
    let inventory = stored(&ws).await;
    let master = inventory.master.as_ref().unwrap();
    assert!(master.ready);
    assert_eq!(master.address.as_deref(), Some(MASTER_ADDRESS));
    assert_eq!(
        worker_names(&inventory),
        vec!["pvekube-host-worker-1", "pvekube-host-worker-2"]
    );
    assert!(
        inventory
            .workers
            .iter()
            .all(|w| w.ready && w.address.is_some())
    );
    assert!(inventory.join_command.is_some());

    let master_guest = lab.connector.guest(MASTER_ADDRESS);
    let mirrored = String::from_utf8(master_guest.files["/root/.pvekube/config.yaml"].clone())
        .unwrap();
    assert!(mirrored.contains(REDACTED));
    assert!(!mirrored.contains("operator-secret"));
    assert!(master_guest.files.contains_key("/root/.pvekube/inventory.json"));
    assert!(master_guest.files.contains_key("/root/.pvekube/id_rsa"));

    let kubeconfig = std::fs::read_to_string(ws.layout.kubeconfig_path()).unwrap();
    assert!(kubeconfig.contains(&format!("https://{MASTER_ADDRESS}:6443")));
}

#[tokio::test]
async fn failed_worker_is_reported_and_finished_by_a_later_scale() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    lab.connector.fail_join("pvekube-host-worker-2");

    let report = ws.controller.deploy(false).await.unwrap();

    assert_eq!(report.workers.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].node(), Some("pvekube-host-worker-2"));
    assert_eq!(report.failed[0].kind(), ErrorKind::Transport);
    let inventory = stored(&ws).await;
    let broken = inventory.node("pvekube-host-worker-2").unwrap();
    assert!(broken.is_materialized());
    assert!(!broken.ready);
    assert!(
        ws.reporter
            .messages()
            .iter()
            .any(|m| m.starts_with("[pvekube-host-worker-2] warning:"))
    );

    lab.connector.heal();
    let outcome = ws.controller.scale(2).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!((outcome.before, outcome.after), (2, 2));
    assert!(stored(&ws).await.workers.iter().all(|w| w.ready));
    assert_eq!(lab.platform.vm_names().len(), 3);
}

#[tokio::test]
async fn redeploy_needs_confirmation() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();

    let error = ws.controller.deploy(false).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Precondition);

    let report = ws.controller.deploy(true).await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(lab.platform.vm_names().len(), 3);
    let inits = lab
        .connector
        .guest(MASTER_ADDRESS)
        .commands
        .iter()
        .filter(|c| c.contains("kubeadm init"))
        .count();
    assert_eq!(inits, 2);
}

#[tokio::test]
async fn untracked_master_on_the_platform_blocks_deploy() {
    let lab = Lab::new(PlatformMode::SingleHost);
    lab.workstation().await.controller.deploy(false).await.unwrap();

    let other = lab.workstation().await;
    let error = other.controller.deploy(false).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Precondition);
    assert!(error.to_string().contains("recover"));
    assert!(stored(&other).await.is_empty());
}

#[tokio::test]
async fn scale_adds_and_removes_workers_at_the_tail() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();

    let grown = ws.controller.scale(4).await.unwrap();
    assert!(grown.is_complete());
    assert_eq!((grown.before, grown.after), (2, 4));
    assert_eq!(
        worker_names(&stored(&ws).await),
        vec![
            "pvekube-host-worker-1",
            "pvekube-host-worker-2",
            "pvekube-host-worker-3",
            "pvekube-host-worker-4"
        ]
    );
    assert_eq!(stored_config(&ws).await.worker_count, 4);

    let shrunk = ws.controller.scale(1).await.unwrap();
    assert!(shrunk.is_complete());
    assert_eq!(shrunk.after, 1);
    assert_eq!(worker_names(&stored(&ws).await), vec!["pvekube-host-worker-1"]);
    assert_eq!(
        lab.platform.destroyed(),
        vec![
            "pvekube-host-worker-4".to_string(),
            "pvekube-host-worker-3".to_string(),
            "pvekube-host-worker-2".to_string()
        ]
    );
    let master_commands = lab.connector.guest(MASTER_ADDRESS).commands;
    assert!(master_commands.contains(&"kubectl delete node pvekube-host-worker-4".to_string()));
    assert_eq!(stored_config(&ws).await.worker_count, 1);
}

#[tokio::test]
async fn scale_to_the_current_size_changes_nothing() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();
    let logins = lab.connector.connections().len();

    let outcome = ws.controller.scale(2).await.unwrap();

    assert_eq!((outcome.before, outcome.after), (2, 2));
    assert_eq!(lab.connector.connections().len(), logins);
}

#[tokio::test]
async fn scale_stops_at_the_first_failure() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();
    lab.platform.fail_create("pvekube-host-worker-4");

    let outcome = ws.controller.scale(5).await.unwrap();

    assert!(!outcome.is_complete());
    assert_eq!(outcome.after, 3);
    assert_eq!(
        outcome.failure.as_ref().and_then(|e| e.node()),
        Some("pvekube-host-worker-4")
    );
    assert!(
        !lab
            .platform
            .vm_names()
            .contains(&"pvekube-host-worker-5".to_string())
    );
    assert_eq!(stored(&ws).await.workers.len(), 3);
    assert_eq!(stored_config(&ws).await.worker_count, 3);
}

#[tokio::test]
async fn scale_down_stops_at_the_first_failure() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();
    ws.controller.scale(4).await.unwrap();
    lab.platform.fail_destroy("pvekube-host-worker-3");

    let outcome = ws.controller.scale(1).await.unwrap();

    assert!(!outcome.is_complete());
    assert_eq!((outcome.before, outcome.after), (4, 3));
    assert_eq!(
        outcome.failure.as_ref().and_then(|e| e.node()),
        Some("pvekube-host-worker-3")
    );
    assert_eq!(
        worker_names(&stored(&ws).await),
        vec![
            "pvekube-host-worker-1",
            "pvekube-host-worker-2",
            "pvekube-host-worker-3"
        ]
    );
    assert_eq!(
        lab.platform.destroyed(),
        vec!["pvekube-host-worker-4".to_string()]
    );
    assert!(
        lab.platform
            .vm_names()
            .contains(&"pvekube-host-worker-3".to_string())
    );
    assert_eq!(stored_config(&ws).await.worker_count, 3);
}

#[tokio::test]
async fn failed_node_deletion_on_the_master_keeps_the_vm_removed() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();
    lab.connector
        .fail_command("kubectl delete node pvekube-host-worker-2");

    let outcome = ws.controller.scale(0).await.unwrap();

    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.kind(), ErrorKind::Transport);
    assert_eq!(failure.node(), Some("pvekube-host-worker-2"));
    assert_eq!(outcome.after, 1);
    assert!(
        !lab.platform
            .vm_names()
            .contains(&"pvekube-host-worker-2".to_string())
    );
    assert_eq!(worker_names(&stored(&ws).await), vec!["pvekube-host-worker-1"]);
    assert_eq!(stored_config(&ws).await.worker_count, 1);

    lab.connector.heal();
    let outcome = ws.controller.scale(0).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!((outcome.before, outcome.after), (1, 0));
    assert!(stored(&ws).await.workers.is_empty());
    assert_eq!(stored_config(&ws).await.worker_count, 0);
    assert_eq!(lab.platform.vm_names(), vec![MASTER.to_string()]);
    let deletions: Vec<String> = lab
        .connector
        .guest(MASTER_ADDRESS)
        .commands
        .into_iter()
        .filter(|c| c.starts_with("kubectl delete node"))
        .collect();
    assert_eq!(
        deletions,
        vec![
            "kubectl delete node pvekube-host-worker-2".to_string(),
            "kubectl delete node pvekube-host-worker-1".to_string()
        ]
    );
}

#[tokio::test]
async fn scale_without_a_cluster_is_refused() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;

    let error = ws.controller.scale(3).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Precondition);
    assert!(lab.platform.vm_names().is_empty());
}

#[tokio::test]
async fn destroy_keeps_survivors_recorded_after_a_failure() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();
    lab.platform.fail_destroy("pvekube-host-worker-2");

    let error = ws.controller.destroy(true).await.unwrap_err();

    assert_eq!(error.node(), Some("pvekube-host-worker-2"));
    let inventory = stored(&ws).await;
    assert!(inventory.master.is_none());
    assert_eq!(worker_names(&inventory), vec!["pvekube-host-worker-2"]);
    assert_eq!(lab.platform.vm_names(), vec!["pvekube-host-worker-2".to_string()]);
    assert!(ws.controller.config_store().exists().await);

    lab.platform.heal();
    ws.controller.destroy(true).await.unwrap();

    assert!(lab.platform.vm_names().is_empty());
    assert!(!ws.controller.inventory_store().exists().await);
    assert!(!ws.controller.config_store().exists().await);
}

#[tokio::test]
async fn destroy_needs_confirmation() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();

    let error = ws.controller.destroy(false).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Precondition);
    assert_eq!(lab.platform.vm_names().len(), 3);
}

#[tokio::test]
async fn recover_rebuilds_state_on_another_workstation() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let origin = lab.workstation().await;
    origin.controller.deploy(false).await.unwrap();

    let fresh = lab.bare_workstation();
    let credentials = PlatformCredentials::new("operator", "another-secret", "pve");
    let endpoint = request(PlatformMode::SingleHost).endpoint;
    let inventory = fresh
        .controller
        .recover(endpoint, credentials.clone(), "pve1")
        .await
        .unwrap();

    let original = stored(&origin).await;
    assert_eq!(inventory.master, original.master);
    assert_eq!(inventory.workers, original.workers);
    assert_eq!(stored(&fresh).await.workers, original.workers);

    let config = stored_config(&fresh).await;
    assert_eq!(config.credentials, credentials);
    assert_eq!(config.platform_mode, PlatformMode::SingleHost);
    assert_eq!(
        std::fs::read(fresh.layout.private_key_path()).unwrap(),
        std::fs::read(origin.layout.private_key_path()).unwrap()
    );
    let kubeconfig = std::fs::read_to_string(fresh.layout.kubeconfig_path()).unwrap();
    assert!(kubeconfig.contains("kubernetes-admin"));

    // the recovered workstation can operate the cluster
    let outcome = fresh.controller.scale(3).await.unwrap();
    assert!(outcome.is_complete());
}

#[tokio::test]
async fn recover_refuses_a_stopped_or_missing_master() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let fresh = lab.bare_workstation();
    let endpoint = request(PlatformMode::SingleHost).endpoint;
    let credentials = PlatformCredentials::new("root", "operator-secret", "pam");

    let missing = fresh
        .controller
        .recover(endpoint.clone(), credentials.clone(), "pve1")
        .await
        .unwrap_err();
    assert!(matches!(missing, crate::PveKubeError::NotFound(_)));

    lab.workstation().await.controller.deploy(false).await.unwrap();
    lab.platform.set_power(MASTER, PowerState::Off);
    let stopped = fresh
        .controller
        .recover(endpoint, credentials, "pve1")
        .await
        .unwrap_err();
    assert_eq!(stopped.kind(), ErrorKind::Precondition);
    assert!(!fresh.controller.inventory_store().exists().await);
}

#[tokio::test]
async fn join_token_attaches_a_workstation() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let origin = lab.workstation().await;
    let report = origin.controller.deploy(false).await.unwrap();

    let bare = lab.bare_workstation();
    let address = bare.controller.use_token(&report.token).await.unwrap();
    assert_eq!(address, MASTER_ADDRESS);
    assert!(stored_config(&bare).await.credentials.is_redacted());
    let kubeconfig = std::fs::read_to_string(bare.layout.kubeconfig_path()).unwrap();
    assert!(kubeconfig.contains("kubernetes-admin@kubernetes"));

    let configured = lab.workstation().await;
    configured.controller.use_token(&report.token).await.unwrap();
    assert_eq!(
        stored_config(&configured).await.credentials,
        request(PlatformMode::SingleHost).credentials
    );
}

#[tokio::test]
async fn malformed_join_token_is_rejected_before_connecting() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.bare_workstation();

    let error = ws
        .controller
        .use_token(&JoinToken::encode("not-an-address"))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Data);
    assert!(lab.connector.connections().is_empty());
}

#[tokio::test]
async fn info_summarises_the_recorded_cluster() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();

    let info = ws.controller.info().await.unwrap();

    assert_eq!(info.platform_host, "pve.lab.local");
    assert_eq!(info.platform_mode, PlatformMode::SingleHost);
    assert_eq!(info.kubernetes_version, "v1.29.3");
    assert_eq!(info.nodes.len(), 3);
    assert_eq!(info.nodes[0].role, NodeRole::Master);
    assert!(info.nodes.iter().all(|n| n.ready));
    assert_eq!(info.token.unwrap().decode().unwrap(), MASTER_ADDRESS);
}

#[tokio::test]
async fn configure_probes_the_platform_mode() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.bare_workstation();
    let mut req = request(PlatformMode::SingleHost);
    req.platform_mode = PlatformMode::Clustered;
    req.placement.resource_pool = Some("k8s".to_string());

    let saved = ws.controller.configure(req, false).await.unwrap();

    assert_eq!(saved.platform_mode, PlatformMode::SingleHost);
    assert_eq!(stored_config(&ws).await, saved);
}

#[tokio::test]
async fn clustered_platform_needs_a_resource_pool() {
    let lab = Lab::new(PlatformMode::Clustered);
    let ws = lab.bare_workstation();

    let error = ws
        .controller
        .configure(request(PlatformMode::SingleHost), false)
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(!ws.controller.config_store().exists().await);
}

#[tokio::test]
async fn reconfigure_over_a_cluster_needs_confirmation() {
    let lab = Lab::new(PlatformMode::SingleHost);
    let ws = lab.workstation().await;
    ws.controller.deploy(false).await.unwrap();
    let req = request(PlatformMode::SingleHost);

    let error = ws.controller.configure(req.clone(), false).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Precondition);

    ws.controller.configure(req, true).await.unwrap();
    assert!(stored(&ws).await.is_empty());
    assert_eq!(lab.platform.vm_names().len(), 3);
}
