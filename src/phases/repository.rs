//! OS package installation.

use crate::crd::RepositorySpec;

/// Packages kubeadm and kube-proxy need on every node.
pub const BASE_PACKAGES: &[&str] = &["socat", "conntrack", "ipset", "ebtables", "chrony", "ipvsadm"];

/// Single script that picks the package manager from `/etc/os-release`.
pub fn install_command(repo: &RepositorySpec) -> String {
    let mut packages: Vec<&str> = BASE_PACKAGES.to_vec();
    for extra in &repo.packages {
        if !packages.contains(&extra.as_str()) {
            packages.push(extra);
        }
    }
    let packages = packages.join(" ");

    let (apt_update, yum_update) = if repo.update {
        ("apt-get update -y && ", "yum makecache -y && ")
    } else {
        ("", "")
    };

    format!(
        ". /etc/os-release; case \" $ID $ID_LIKE \" in \
*' debian '*|*' ubuntu '*) {apt_update}DEBIAN_FRONTEND=noninteractive apt-get install -y {packages} ;; \
*' rhel '*|*' centos '*|*' fedora '*) {yum_update}yum install -y {packages} ;; \
*) echo \"unsupported OS: $ID\" >&2; exit 1 ;; esac"
    )
}
