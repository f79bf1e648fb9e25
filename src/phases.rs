//! Provisioning phases run over ssh on a new instance.
//!
//! Phases run in declaration order. Each one owns a condition on the
//! instance; a phase whose condition is already `True` is skipped, so the
//! whole sequence can be re-entered on every reconcile.

pub mod binaries;
pub mod bootstrap;
pub mod cleanup;
pub mod cloud_config;
pub mod container_manager;
pub mod repository;

use tracing::{debug, info};

use crate::crd::condition::{reasons, types};
use crate::crd::{Cluster, ConditionSeverity, Instance};
use crate::error::SkoError;
use crate::exec::CommandRunner;

/// Scratch directory on the remote host.
pub const REMOTE_TMP_DIR: &str = "/tmp/sko";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionPhase {
    Bootstrap,
    Repository,
    Binaries,
    ContainerManager,
    Provisioning,
}

/// Everything the phase commands are built from.
pub struct PhaseInput<'a> {
    pub instance: &'a Instance,
    pub cluster: &'a Cluster,
    /// Kubernetes version from the owning machine.
    pub version: &'a str,
    pub provider_id: &'a str,
    /// Contents of the machine's bootstrap data secret.
    pub bootstrap_data: &'a str,
}

impl ProvisionPhase {
    pub const ALL: [Self; 5] = [
        Self::Bootstrap,
        Self::Repository,
        Self::Binaries,
        Self::ContainerManager,
        Self::Provisioning,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "Bootstrap",
            Self::Repository => "Repository",
            Self::Binaries => "Binaries",
            Self::ContainerManager => "ContainerManager",
            Self::Provisioning => "Provisioning",
        }
    }

    /// Condition type marked when the phase finishes.
    pub const fn condition(self) -> &'static str {
        match self {
            Self::Bootstrap => types::INSTANCE_BOOTSTRAPPED,
            Self::Repository => types::INSTANCE_REPOSITORY_READY,
            Self::Binaries => types::INSTANCE_BINARIES_READY,
            Self::ContainerManager => types::INSTANCE_CRI_READY,
            Self::Provisioning => types::INSTANCE_PROVISIONED,
        }
    }

    pub const fn failure_reason(self) -> &'static str {
        match self {
            Self::Bootstrap => reasons::INIT_OS_FAILED,
            Self::Repository => reasons::REPOSITORY_FAILED,
            Self::Binaries => reasons::GET_BINARY_FAILED,
            Self::ContainerManager => reasons::INSTALL_CRI_FAILED,
            Self::Provisioning => reasons::RUN_CLOUD_CONFIG_FAILED,
        }
    }

    /// Host preparation failures are warnings; failures past that point
    /// leave a half-installed node and are errors.
    pub const fn severity(self) -> ConditionSeverity {
        match self {
            Self::Bootstrap | Self::Repository => ConditionSeverity::Warning,
            Self::Binaries | Self::ContainerManager | Self::Provisioning => {
                ConditionSeverity::Error
            }
        }
    }

    /// Run the phase once on the remote host.
    pub async fn run(
        self,
        runner: &dyn CommandRunner,
        input: &PhaseInput<'_>,
    ) -> Result<(), SkoError> {
        info!(
            host = %runner.host(),
            phase = self.as_str(),
            "Running provisioning phase"
        );
        match self {
            Self::Bootstrap => run_all(runner, &bootstrap::commands(input)).await,
            Self::Repository => match input.cluster.spec.repository.as_ref() {
                Some(repo) => run_all(runner, &[repository::install_command(repo)]).await,
                None => {
                    debug!("No repository settings, skipping package installation");
                    Ok(())
                }
            },
            Self::Binaries => {
                run_all(
                    runner,
                    &binaries::install_commands(
                        &input.cluster.spec.binary_base_url,
                        input.version,
                        &input.instance.spec.arch,
                    ),
                )
                .await?;
                run_all(runner, &binaries::kubelet_service_commands(input)).await
            }
            Self::ContainerManager => container_manager::ensure(runner, input).await,
            Self::Provisioning => {
                let exists = runner
                    .run_privileged(&cloud_config::sentinel_check_command())
                    .await?;
                if exists.contains("exists") {
                    debug!("Bootstrap sentinel present, skipping bootstrap data");
                    return Ok(());
                }
                let commands = cloud_config::to_commands(input.bootstrap_data)?;
                run_all(runner, &commands).await?;
                run_all(runner, &[cloud_config::sentinel_write_command()]).await
            }
        }
    }
}

impl std::fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run commands in order, stopping at the first failure.
pub async fn run_all(runner: &dyn CommandRunner, commands: &[String]) -> Result<(), SkoError> {
    for command in commands {
        runner.run_privileged(command).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockCommandRunner;
    use crate::testing;

    #[test]
    fn test_phase_order_and_conditions() {
        let conditions: Vec<&str> = ProvisionPhase::ALL.iter().map(|p| p.condition()).collect();
        assert_eq!(
            conditions,
            vec![
                "InstanceBootstrapped",
                "InstanceRepositoryReady",
                "InstanceBinariesReady",
                "InstanceCRIReady",
                "InstanceProvisioned",
            ]
        );
        assert_eq!(ProvisionPhase::Binaries.failure_reason(), "GetBinaryFailed");
        assert_eq!(
            ProvisionPhase::Bootstrap.severity(),
            ConditionSeverity::Warning
        );
        assert_eq!(
            ProvisionPhase::Provisioning.severity(),
            ConditionSeverity::Error
        );
    }

    #[tokio::test]
    async fn test_repository_skipped_without_settings() {
        let cluster = testing::cluster("demo");
        let instance = testing::instance("cp-0", true, "demo");
        let input = PhaseInput {
            instance: &instance,
            cluster: &cluster,
            version: "v1.24.0",
            provider_id: "sko:///demo/cp-0",
            bootstrap_data: "",
        };
        let mut runner = MockCommandRunner::new();
        runner.expect_host().return_const("10.0.0.10".to_string());
        runner.expect_run_privileged().never();
        ProvisionPhase::Repository
            .run(&runner, &input)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_provisioning_skipped_when_sentinel_exists() {
        let cluster = testing::cluster("demo");
        let instance = testing::instance("cp-0", true, "demo");
        let input = PhaseInput {
            instance: &instance,
            cluster: &cluster,
            version: "v1.24.0",
            provider_id: "sko:///demo/cp-0",
            bootstrap_data: "#!/bin/bash\nkubeadm join",
        };
        let mut runner = MockCommandRunner::new();
        runner.expect_host().return_const("10.0.0.10".to_string());
        runner
            .expect_run_privileged()
            .times(1)
            .returning(|_| Ok("exists".to_string()));
        ProvisionPhase::Provisioning
            .run(&runner, &input)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_all_stops_at_first_failure() {
        let mut runner = MockCommandRunner::new();
        runner.expect_host().return_const("10.0.0.10".to_string());
        runner
            .expect_run_privileged()
            .withf(|c| c == "first")
            .times(1)
            .returning(|_| {
                Err(crate::error::ExecError::NonZeroExit {
                    host: "10.0.0.10".to_string(),
                    code: 2,
                    output: "boom".to_string(),
                })
            });
        let err = run_all(&runner, &["first".to_string(), "second".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
