//! Files and scripts pushed to every node.

pub const KUBELET_SERVICE_PATH: &str = "/etc/systemd/system/kubelet.service";
pub const KUBEADM_DROP_IN_PATH: &str = "/etc/systemd/system/kubelet.service.d/10-kubeadm.conf";
pub const BIN_DIR: &str = "/usr/bin";
pub const CNI_BIN_DIR: &str = "/opt/cni/bin";

pub const BINARY_MODE: &str = "0750";
pub const UNIT_MODE: &str = "0640";

/// Tools copied under their own name into [`BIN_DIR`].
pub const NODE_TOOLS: &[&str] = &["kubeadm", "kubelet", "crictl"];
/// Cache entry of the guest `kubectl`, installed as `/usr/bin/kubectl`.
pub const GUEST_KUBECTL: &str = "kubectl.guest";

pub const CNI_PLUGINS: &[&str] = &[
    "bridge",
    "dhcp",
    "flannel",
    "host-device",
    "host-local",
    "ipvlan",
    "loopback",
    "macvlan",
    "portmap",
    "ptp",
    "sample",
    "tuning",
    "vlan",
];

pub const KUBELET_SERVICE: &str = "\
[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=https://kubernetes.io/docs/

[Service]
ExecStart=/usr/bin/kubelet
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
";

pub const KUBEADM_DROP_IN: &str = "\
[Service]
Environment=\"KUBELET_KUBECONFIG_ARGS=--bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf --kubeconfig=/etc/kubernetes/kubelet.conf\"
Environment=\"KUBELET_CONFIG_ARGS=--config=/var/lib/kubelet/config.yaml\"
EnvironmentFile=-/var/lib/kubelet/kubeadm-flags.env
EnvironmentFile=-/etc/sysconfig/kubelet
ExecStart=
ExecStart=/usr/bin/kubelet $KUBELET_KUBECONFIG_ARGS $KUBELET_CONFIG_ARGS $KUBELET_KUBEADM_ARGS $KUBELET_EXTRA_ARGS
";

pub const OPEN_FIREWALL: &str = "iptables --policy INPUT ACCEPT && \
iptables --policy OUTPUT ACCEPT && \
iptables --policy FORWARD ACCEPT";

pub const START_SERVICES: &str = "systemctl daemon-reload && \
systemctl enable kubelet && \
systemctl enable docker && \
systemctl start docker";

pub const RESET_MEMBERSHIP: &str = "kubeadm reset -f";
/// Written by a successful `kubeadm join`, removed by `kubeadm reset`.
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";
pub const PRINT_JOIN_COMMAND: &str = "kubeadm token create --print-join-command";

const POD_NETWORK_CIDR: &str = "10.244.0.0/16";
const CNI_MANIFEST: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";

/// Control-plane initialisation for `version`.
pub fn init_script(version: &str) -> String {
    format!(
        "sysctl net.bridge.bridge-nf-call-iptables=1 && \
kubeadm reset -f && \
kubeadm init --kubernetes-version {version} --pod-network-cidr {POD_NETWORK_CIDR} && \
mkdir -p /root/.kube && \
cp /etc/kubernetes/admin.conf /root/.kube/config && \
(kubectl taint nodes --all node-role.kubernetes.io/control-plane- || true) && \
kubectl apply -f {CNI_MANIFEST}"
    )
}

pub fn set_hostname_command(name: &str) -> String {
    format!("hostname {name}")
}

pub fn file_exists_command(path: &str) -> String {
    format!("test -f {path}")
}

pub fn delete_node_command(name: &str) -> String {
    format!("kubectl delete node {name}")
}

/// Replaces `authorized_keys` of the guest account with `public_key`.
pub fn install_key_command(public_key: &str) -> String {
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && \
echo '{public_key}' > ~/.ssh/authorized_keys && \
chmod 600 ~/.ssh/authorized_keys"
    )
}
