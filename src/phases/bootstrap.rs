//! Host preparation: hostname, directories, swap, kernel modules and sysctl.

use super::{PhaseInput, REMOTE_TMP_DIR};

const KUBE_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/etc/kubernetes",
    "/etc/kubernetes/pki",
    "/etc/kubernetes/manifests",
    "/usr/local/bin/kube-scripts",
    "/usr/libexec/kubernetes/kubelet-plugins/volume/exec",
    "/etc/cni/net.d",
    "/opt/cni/bin",
];

const SYSCTL_CONF: &str = "net.ipv4.ip_forward = 1\n\
net.bridge.bridge-nf-call-iptables = 1\n\
net.bridge.bridge-nf-call-ip6tables = 1\n";

pub fn commands(input: &PhaseInput<'_>) -> Vec<String> {
    let hostname = &input.instance.spec.name;
    let mut commands = vec![
        format!(
            "hostnamectl set-hostname {hostname} && sed -i '/^127.0.1.1/s/.*/127.0.1.1      {hostname}/g' /etc/hosts"
        ),
        format!("mkdir -p {}", KUBE_DIRS.join(" ")),
        format!("rm -rf {REMOTE_TMP_DIR} && mkdir -p {REMOTE_TMP_DIR} && chmod 0777 {REMOTE_TMP_DIR}"),
        r"swapoff -a && sed -i '/ swap / s/^\(.*\)$/#\1/g' /etc/fstab".to_string(),
        "modprobe br_netfilter && modprobe overlay && printf 'br_netfilter\\noverlay\\n' > /etc/modules-load.d/sko.conf"
            .to_string(),
        format!("printf '{SYSCTL_CONF}' > /etc/sysctl.d/99-sko.conf && sysctl --system"),
    ];

    // Resolve the control plane endpoint to the load balancer on every host.
    if let Some(lb) = input.cluster.spec.control_plane_load_balancer.as_ref() {
        let endpoint = &input.cluster.spec.control_plane_endpoint.host;
        let entry = format!("{}  {}", lb.host, endpoint);
        commands.push(format!(
            "sed -i '/\\s{endpoint}$/d' /etc/hosts && echo '{entry}' >> /etc/hosts"
        ));
    }
    commands
}
