use crate::{
    ApiClient, ClientConfig, CsrfToken, ImportSpec, PlatformAuth, PlatformClient,
    PlatformClientBuilder, PlatformConnection, PlatformHost, PlatformMode, PlatformPassword,
    PlatformPort, PlatformRealm, PlatformRef, PlatformUrl, PlatformUsername, PowerState,
    ProxmoxPlatform, SessionTicket, VmHandle,
    core::domain::model::cluster_request::fixtures::request,
};
use serde_json::json;
use std::time::Duration;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, method, path, path_regex, query_param},
};

const UPID: &str = "UPID:pve1:0000C530:0001A7F1:65F2A1B0:qmcreate:104:root@pam:";

fn fast_config() -> ClientConfig {
    ClientConfig {
        poll_interval: Duration::from_millis(10),
        task_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn platform(server: &MockServer) -> ProxmoxPlatform {
    let connection = PlatformConnection::with_url(
        PlatformHost::new("127.0.0.1").unwrap(),
        PlatformPort::default(),
        PlatformUsername::new("root").unwrap(),
        PlatformPassword::new("secret", None).unwrap(),
        PlatformRealm::new("pam").unwrap(),
        true,
        PlatformUrl::parse(&format!("{}/", server.uri())).unwrap(),
    );
    let api = ApiClient::new(connection, fast_config()).unwrap();
    api.set_auth(PlatformAuth::new(
        SessionTicket::new("PVE:root@pam:4EEC61E2::sig").unwrap(),
        Some(CsrfToken::new_unchecked("4EEC61E2:token".to_string())),
    ))
    .await;
    ProxmoxPlatform::new(api)
}

fn vm(vmid: u32) -> VmHandle {
    VmHandle {
        reference: PlatformRef::new("qemu", vmid.to_string()),
        host: "pve1".to_string(),
        name: "pvekube-host-worker-1".to_string(),
    }
}

async fn mount_task_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/api2/json/nodes/pve1/tasks/.+/status$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"status": "stopped", "exitstatus": "OK"}})),
        )
        .mount(server)
        .await;
}

async fn mount_resources(server: &MockServer, resources: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": resources})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn builder_logs_in_before_handing_out_the_client() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "ticket": "PVE:root@pam:4EEC61E2::sig",
                "CSRFPreventionToken": "4EEC61E2:token"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let platform = PlatformClientBuilder::new()
        .host("127.0.0.1")
        .port(server.address().port())
        .secure(false)
        .credentials("root", "secret", "pam")
        .config(fast_config())
        .build()
        .await
        .unwrap();

    assert!(platform.api().is_authenticated().await);
}

#[tokio::test]
async fn builder_refuses_missing_credentials() {
    let error = PlatformClientBuilder::new()
        .host("pve.lab.local")
        .connection()
        .unwrap_err();
    assert_eq!(error.kind(), crate::ErrorKind::Validation);
}

#[tokio::test]
async fn probe_reports_clustered_when_a_cluster_entry_exists() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"type": "cluster", "name": "lab", "nodes": 3, "quorate": 1},
                {"type": "node", "name": "pve1", "online": 1}
            ]
        })))
        .mount(&server)
        .await;

    let mode = platform(&server).await.probe_mode().await.unwrap();
    assert_eq!(mode, PlatformMode::Clustered);
}

#[tokio::test]
async fn probe_reports_single_host_for_a_lone_node() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"type": "node", "name": "pve1", "online": 1}]
        })))
        .mount(&server)
        .await;

    let mode = platform(&server).await.probe_mode().await.unwrap();
    assert_eq!(mode, PlatformMode::SingleHost);
}

#[tokio::test]
async fn locate_respects_the_folder_tag() {
    let server = MockServer::start().await;
    mount_resources(
        &server,
        json!([
            {"type": "qemu", "node": "pve1", "vmid": 120, "name": "pvekube-host-master",
             "status": "running", "tags": "pvekube;pvekube.other"},
            {"type": "qemu", "node": "pve1", "vmid": 121, "name": "pvekube-host-master",
             "status": "running", "tags": "pvekube;pvekube.kube"},
            {"type": "storage", "node": "pve1", "id": "storage/pve1/local"}
        ]),
    )
    .await;
    let platform = platform(&server).await;

    let found = platform
        .locate("/pve1/vm/kube/pvekube-host-master")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.reference, PlatformRef::new("qemu", "121"));

    assert!(
        platform
            .locate("/pve2/vm/kube/pvekube-host-master")
            .await
            .unwrap()
            .is_none()
    );
    let by_ref = platform
        .locate_ref(&PlatformRef::new("qemu", "120"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_ref.name, "pvekube-host-master");
}

#[tokio::test]
async fn power_state_distinguishes_paused_guests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/qemu/104/status/current"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"status": "running", "qmpstatus": "paused", "name": "w1"}
        })))
        .mount(&server)
        .await;

    let state = platform(&server).await.power_state(&vm(104)).await.unwrap();
    assert_eq!(state, PowerState::Suspended);
}

#[tokio::test]
async fn destroy_stops_then_purges() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/qemu/104/status/current"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"status": "running"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu/104/status/stop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": UPID})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api2/json/nodes/pve1/qemu/104"))
        .and(query_param("purge", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": UPID})))
        .expect(1)
        .mount(&server)
        .await;
    mount_task_ok(&server).await;

    platform(&server).await.destroy(&vm(104)).await.unwrap();
}

#[tokio::test]
async fn failed_task_is_a_platform_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/qemu/104/status/current"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"status": "stopped"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu/104/status/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": UPID})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api2/json/nodes/pve1/tasks/.+/status$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"status": "stopped", "exitstatus": "start failed: not enough memory"}
        })))
        .mount(&server)
        .await;

    let error = platform(&server).await.power_on(&vm(104)).await.unwrap_err();
    assert_eq!(error.kind(), crate::ErrorKind::Platform);
    assert!(error.to_string().contains("not enough memory"));
}

#[tokio::test]
async fn address_is_awaited_until_the_agent_reports_ipv4() {
    let server = MockServer::start().await;
    let agent = "/api2/json/nodes/pve1/qemu/104/agent/network-get-interfaces";
    Mock::given(method("GET"))
        .and(path(agent))
        .respond_with(ResponseTemplate::new(500).set_body_string("QEMU guest agent is not running"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(agent))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"result": [
                {"name": "lo", "ip-addresses": [
                    {"ip-address-type": "ipv4", "ip-address": "127.0.0.1", "prefix": 8}]},
                {"name": "eth0", "ip-addresses": [
                    {"ip-address-type": "ipv4", "ip-address": "10.0.0.31", "prefix": 24}]}
            ]}
        })))
        .mount(&server)
        .await;

    let address = platform(&server)
        .await
        .wait_for_address(&vm(104), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(address, "10.0.0.31");
}

#[tokio::test]
async fn address_wait_gives_up_after_the_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/qemu/104/agent/network-get-interfaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"result": []}})))
        .mount(&server)
        .await;

    let error = platform(&server)
        .await
        .wait_for_address(&vm(104), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), crate::ErrorKind::Platform);
}

#[tokio::test]
async fn import_reuses_an_uploaded_archive() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("pvekube-guest.ova");
    std::fs::write(&archive, b"OVA").unwrap();

    let server = MockServer::start().await;
    mount_resources(&server, json!([])).await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/storage/local/content"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"volid": "local:import/pvekube-guest.ova", "content": "import"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/storage/local/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": UPID})))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/storage/local/import-metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "type": "vm",
                "disks": {"scsi0": "local:import/pvekube-guest.ova/disk-0.vmdk"},
                "create-args": {"ostype": "l26"}
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "104"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu"))
        .and(body_partial_json(json!({
            "vmid": 104,
            "name": "pvekube-host-master",
            "tags": "pvekube;pvekube.kube",
            "net0": "virtio,bridge=vmbr0",
            "scsi0": "local-lvm:0,import-from=local:import/pvekube-guest.ova/disk-0.vmdk"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": UPID})))
        .expect(1)
        .mount(&server)
        .await;
    mount_task_ok(&server).await;

    let req = request(PlatformMode::SingleHost);
    let spec = ImportSpec {
        archive,
        target_path: req.node_path("pvekube-host-master"),
        placement: req.placement.clone(),
        network: req.network.clone(),
        sizing: req.sizing,
    };
    let created = platform(&server).await.import_image(&spec).await.unwrap();

    assert_eq!(created.reference, PlatformRef::new("qemu", "104"));
    assert_eq!(created.host, "pve1");
    assert_eq!(created.name, "pvekube-host-master");
}
