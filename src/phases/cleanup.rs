//! Node teardown run before an instance is released.

use super::REMOTE_TMP_DIR;

const NETWORK_RESET: &[&str] = &[
    "iptables -F",
    "iptables -X",
    "iptables -F -t nat",
    "iptables -X -t nat",
    "ipvsadm -C",
    "ip link del kube-ipvs0",
    "ip link del nodelocaldns",
];

const REMOVE_PATHS: &[&str] = &[
    "/etc/kubernetes",
    "/usr/local/bin/kube-scripts",
    "/var/log/calico",
    "/etc/cni",
    "/var/log/pods/",
    "/var/lib/cni",
    "/var/lib/calico",
    "/var/lib/kubelet",
    "/var/lib/etcd",
    "/var/lib/rook",
    "/run/calico",
    "/run/flannel",
    "/etc/flannel",
    "/var/openebs",
    "/etc/systemd/system/kubelet.service",
    "/etc/systemd/system/kubelet.service.d",
    "/run/cluster-api",
    "/run/kubeadm/*",
    "$HOME/.kube",
];

/// Teardown commands. Network resets tolerate missing tools and
/// interfaces; `kubeadm reset` and the file removal must succeed.
pub fn commands() -> Vec<String> {
    let mut commands = vec![
        "systemctl stop kubelet || true".to_string(),
        "if command -v kubeadm >/dev/null 2>&1; then kubeadm reset -f; fi".to_string(),
    ];
    commands.push(
        NETWORK_RESET
            .iter()
            .map(|c| format!("{c} 2>/dev/null || true"))
            .collect::<Vec<_>>()
            .join("; "),
    );
    commands.push(format!("rm -rf {} {REMOTE_TMP_DIR}", REMOVE_PATHS.join(" ")));
    commands.push("systemctl daemon-reload".to_string());
    commands
}
