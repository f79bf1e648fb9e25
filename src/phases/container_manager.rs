//! containerd installation.

use tracing::info;

use super::{PhaseInput, REMOTE_TMP_DIR, run_all};
use crate::error::SkoError;
use crate::exec::CommandRunner;

pub const CONTAINERD: &str = "containerd";

const RUNC_VERSION: &str = "1.1.12";

/// Prints `not exist` when containerd is missing or not running.
pub const CHECK_COMMAND: &str = "if [ -z $(which containerd) ] || [ ! -e /run/containerd/containerd.sock ]; then echo 'not exist'; fi";

const CONTAINERD_SERVICE: &str = "[Unit]
Description=containerd container runtime
Documentation=https://containerd.io
After=network.target local-fs.target

[Service]
ExecStartPre=-/sbin/modprobe overlay
ExecStart=/usr/local/bin/containerd
Type=notify
Delegate=yes
KillMode=process
Restart=always
RestartSec=5
LimitNPROC=infinity
LimitCORE=infinity
LimitNOFILE=infinity
TasksMax=infinity
OOMScoreAdjust=-999

[Install]
WantedBy=multi-user.target
";

pub fn install_commands(version: &str, arch: &str) -> Vec<String> {
    let version = version.trim_start_matches('v');
    let tarball = format!("{REMOTE_TMP_DIR}/containerd-{version}-linux-{arch}.tar.gz");
    let runc = format!("{REMOTE_TMP_DIR}/runc.{arch}");
    vec![
        format!("mkdir -p {REMOTE_TMP_DIR}"),
        format!(
            "curl -fsSL --retry 3 -o {tarball} https://github.com/containerd/containerd/releases/download/v{version}/containerd-{version}-linux-{arch}.tar.gz"
        ),
        format!("tar Cxzvf /usr/local {tarball}"),
        format!(
            "curl -fsSL --retry 3 -o {runc} https://github.com/opencontainers/runc/releases/download/v{RUNC_VERSION}/runc.{arch} && install -m 755 {runc} /usr/local/sbin/runc && rm -f {runc}"
        ),
        format!("cat > /etc/systemd/system/containerd.service <<'SKO_EOF'\n{CONTAINERD_SERVICE}SKO_EOF"),
        "mkdir -p /etc/containerd && containerd config default | sed 's/SystemdCgroup = false/SystemdCgroup = true/' > /etc/containerd/config.toml"
            .to_string(),
        "systemctl daemon-reload && systemctl enable containerd && systemctl start containerd"
            .to_string(),
    ]
}

/// Install the configured container manager unless it is already running.
pub async fn ensure(runner: &dyn CommandRunner, input: &PhaseInput<'_>) -> Result<(), SkoError> {
    let spec = &input.cluster.spec.container_manager;
    if spec.kind != CONTAINERD {
        return Err(SkoError::InvalidConfiguration(format!(
            "unsupported container manager type: {}",
            spec.kind
        )));
    }

    let output = runner.run_privileged(CHECK_COMMAND).await?;
    if !output.contains("not exist") {
        info!(host = %runner.host(), "containerd already present, skipping installation");
        return Ok(());
    }
    run_all(
        runner,
        &install_commands(&spec.version, &input.instance.spec.arch),
    )
    .await
}
