//! kubeadm, kubelet and kubectl downloads plus the kubelet unit.

use super::{PhaseInput, REMOTE_TMP_DIR};

pub const BIN_DIR: &str = "/usr/local/bin";

pub const KUBE_BINARIES: &[&str] = &["kubeadm", "kubelet", "kubectl"];

const KUBELET_SERVICE: &str = "[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=https://kubernetes.io/docs/
Wants=network-online.target
After=network-online.target

[Service]
ExecStart=/usr/local/bin/kubelet
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
";

/// Command whose output contains the binary's version.
fn version_command(path: &str, binary: &str) -> String {
    match binary {
        "kubeadm" => format!("{path} version -o short"),
        "kubectl" => format!("{path} version --client"),
        _ => format!("{path} --version"),
    }
}

pub fn download_url(base_url: &str, version: &str, arch: &str, binary: &str) -> String {
    format!(
        "{}/{version}/bin/linux/{arch}/{binary}",
        base_url.trim_end_matches('/')
    )
}

/// Download `binary` into `dir` unless the file there already reports
/// `version`.
fn fetch_command(dir: &str, base_url: &str, version: &str, arch: &str, binary: &str) -> String {
    let path = format!("{dir}/{binary}");
    format!(
        "if {check} 2>/dev/null | grep -qF -- '{version}'; then echo '{binary} {version} present'; \
else curl -fsSL --retry 3 -o {path}.download {url} && chmod +x {path}.download && mv -f {path}.download {path}; fi",
        check = version_command(&path, binary),
        url = download_url(base_url, version, arch, binary),
    )
}

/// Install all binaries of `version` into [`BIN_DIR`].
pub fn install_commands(base_url: &str, version: &str, arch: &str) -> Vec<String> {
    let mut commands: Vec<String> = KUBE_BINARIES
        .iter()
        .map(|b| fetch_command(BIN_DIR, base_url, version, arch, b))
        .collect();
    commands.push(
        KUBE_BINARIES
            .iter()
            .map(|b| format!("ln -snf {BIN_DIR}/{b} /usr/bin/{b}"))
            .collect::<Vec<_>>()
            .join(" && "),
    );
    commands
}

/// Unit file, kubeadm drop-in and enablement of the kubelet service.
pub fn kubelet_service_commands(input: &PhaseInput<'_>) -> Vec<String> {
    let dropin = format!(
        "[Service]
Environment=\"KUBELET_KUBECONFIG_ARGS=--bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf --kubeconfig=/etc/kubernetes/kubelet.conf\"
Environment=\"KUBELET_CONFIG_ARGS=--config=/var/lib/kubelet/config.yaml\"
EnvironmentFile=-/var/lib/kubelet/kubeadm-flags.env
EnvironmentFile=-/etc/default/kubelet
Environment=\"KUBELET_EXTRA_ARGS=--node-ip={ip} --hostname-override={name} --provider-id={provider_id}\"
ExecStart=
ExecStart=/usr/local/bin/kubelet $KUBELET_KUBECONFIG_ARGS $KUBELET_CONFIG_ARGS $KUBELET_KUBEADM_ARGS $KUBELET_EXTRA_ARGS
",
        ip = input.instance.spec.internal_address,
        name = input.instance.spec.name,
        provider_id = input.provider_id,
    );
    vec![
        format!("cat > /etc/systemd/system/kubelet.service <<'SKO_EOF'\n{KUBELET_SERVICE}SKO_EOF"),
        format!(
            "mkdir -p /etc/systemd/system/kubelet.service.d && cat > /etc/systemd/system/kubelet.service.d/10-kubeadm.conf <<'SKO_EOF'\n{dropin}SKO_EOF"
        ),
        "systemctl daemon-reload && systemctl disable kubelet; systemctl enable kubelet".to_string(),
    ]
}

/// Directory holding binaries downloaded ahead of an in-place upgrade.
pub fn staging_dir(version: &str) -> String {
    format!("{REMOTE_TMP_DIR}/{version}")
}

/// Download the upgrade binaries without touching the running ones.
pub fn stage_commands(base_url: &str, version: &str, arch: &str) -> Vec<String> {
    let dir = staging_dir(version);
    let mut commands = vec![format!("mkdir -p {dir}")];
    commands.extend(
        KUBE_BINARIES
            .iter()
            .map(|b| fetch_command(&dir, base_url, version, arch, b)),
    );
    commands
}

/// Replace the installed binaries with the staged ones.
pub fn install_staged_command(version: &str) -> String {
    let dir = staging_dir(version);
    KUBE_BINARIES
        .iter()
        .map(|b| format!("install -m 755 {dir}/{b} {BIN_DIR}/{b}"))
        .collect::<Vec<_>>()
        .join(" && ")
}
