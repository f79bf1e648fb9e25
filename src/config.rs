//! Operator configuration loaded from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    // Provisioning
    pub instance_poll_interval: Duration,
    pub instance_poll_timeout: Duration,

    // Remote execution
    pub command_timeout: Duration,
    pub ssh_connect_timeout: Duration,
    pub ssh_key_dir: PathBuf,

    // Servers
    pub health_port: u16,
    pub metrics_port: u16,

    /// Restrict all watches to one namespace. Cluster-wide when unset.
    pub watch_namespace: Option<String>,
}

impl OperatorConfig {
    pub fn load() -> Result<Self> {
        let instance_poll_interval =
            Duration::from_secs(get_env_u64_with_default("SKO_INSTANCE_POLL_INTERVAL_SECS", 5));
        let instance_poll_timeout =
            Duration::from_secs(get_env_u64_with_default("SKO_INSTANCE_POLL_TIMEOUT_SECS", 600));

        let command_timeout =
            Duration::from_secs(get_env_u64_with_default("SKO_COMMAND_TIMEOUT_SECS", 300));
        let ssh_connect_timeout =
            Duration::from_secs(get_env_u64_with_default("SKO_SSH_CONNECT_TIMEOUT_SECS", 10));
        let ssh_key_dir = PathBuf::from(get_env_with_default("SKO_SSH_KEY_DIR", "/tmp/sko-keys"));

        let health_port = get_env_u16_with_default("SKO_HEALTH_PORT", 8080);
        let metrics_port = get_env_u16_with_default("SKO_METRICS_PORT", 8081);

        let watch_namespace = get_env_optional("SKO_WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let config = Self {
            instance_poll_interval,
            instance_poll_timeout,
            command_timeout,
            ssh_connect_timeout,
            ssh_key_dir,
            health_port,
            metrics_port,
            watch_namespace,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_poll_interval.is_zero() {
            return Err(anyhow!(
                "SKO_INSTANCE_POLL_INTERVAL_SECS must be greater than zero"
            ));
        }
        if self.instance_poll_timeout < self.instance_poll_interval {
            return Err(anyhow!(
                "SKO_INSTANCE_POLL_TIMEOUT_SECS ({}s) must not be smaller than the poll interval ({}s)",
                self.instance_poll_timeout.as_secs(),
                self.instance_poll_interval.as_secs()
            ));
        }
        if self.command_timeout.is_zero() {
            return Err(anyhow!("SKO_COMMAND_TIMEOUT_SECS must be greater than zero"));
        }
        if self.health_port == self.metrics_port {
            return Err(anyhow!(
                "SKO_HEALTH_PORT and SKO_METRICS_PORT must differ (both {})",
                self.health_port
            ));
        }
        Ok(())
    }
}

fn get_env_optional(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn get_env_with_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_u64_with_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_u16_with_default(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
impl OperatorConfig {
    pub fn new_for_test() -> Self {
        Self {
            instance_poll_interval: Duration::from_millis(10),
            instance_poll_timeout: Duration::from_millis(50),
            command_timeout: Duration::from_secs(5),
            ssh_connect_timeout: Duration::from_secs(1),
            ssh_key_dir: env::temp_dir().join("sko-test-keys"),
            health_port: 8080,
            metrics_port: 8081,
            watch_namespace: None,
        }
    }
}
