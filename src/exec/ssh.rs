//! `CommandRunner` over the system `ssh` client.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::debug;

use super::{CommandRunner, Connector, shell_quote};
use crate::crd::Instance;
use crate::error::ExecError;

/// Secret key holding the PEM private key.
pub const PRIVATE_KEY_SECRET_KEY: &str = "ssh-privatekey";

/// Opens ssh sessions using the key named by the instance's auth secret.
pub struct SshConnector {
    client: kube::Client,
    key_dir: PathBuf,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshConnector {
    pub const fn new(
        client: kube::Client,
        key_dir: PathBuf,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            client,
            key_dir,
            connect_timeout,
            command_timeout,
        }
    }

    async fn private_key(
        &self,
        host: &str,
        namespace: &str,
        secret_name: &str,
    ) -> Result<SecretString, ExecError> {
        let auth_err = |message: String| ExecError::Auth {
            host: host.to_string(),
            message,
        };
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get(secret_name)
            .await
            .map_err(|e| auth_err(format!("reading secret {namespace}/{secret_name}: {e}")))?;
        let bytes = secret
            .data
            .and_then(|mut d| d.remove(PRIVATE_KEY_SECRET_KEY))
            .ok_or_else(|| {
                auth_err(format!(
                    "secret {namespace}/{secret_name} has no {PRIVATE_KEY_SECRET_KEY} key"
                ))
            })?;
        let pem = String::from_utf8(bytes.0)
            .map_err(|_| auth_err(format!("secret {namespace}/{secret_name} is not UTF-8")))?;
        Ok(SecretString::from(pem))
    }

    async fn write_key_file(
        &self,
        host: &str,
        file_name: &str,
        key: &SecretString,
    ) -> Result<PathBuf, ExecError> {
        let io_err = |e: std::io::Error| ExecError::Auth {
            host: host.to_string(),
            message: format!("writing key file: {e}"),
        };
        tokio::fs::create_dir_all(&self.key_dir)
            .await
            .map_err(io_err)?;
        let path = self.key_dir.join(file_name);
        let mut pem = key.expose_secret().to_string();
        if !pem.ends_with('\n') {
            pem.push('\n');
        }
        tokio::fs::write(&path, pem).await.map_err(io_err)?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
        Ok(path)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, instance: &Instance) -> Result<Arc<dyn CommandRunner>, ExecError> {
        let host = instance.spec.address.clone();
        let namespace = instance.metadata.namespace.as_deref().unwrap_or("default");

        let key_file = match instance.spec.auth.private_key_secret.as_deref() {
            Some(secret_name) => {
                let key = self.private_key(&host, namespace, secret_name).await?;
                Some(
                    self.write_key_file(&host, &format!("{namespace}_{secret_name}"), &key)
                        .await?,
                )
            }
            None => None,
        };

        Ok(Arc::new(SshCommandRunner {
            program: PathBuf::from("ssh"),
            host,
            port: instance.spec.port,
            user: instance.spec.user.clone(),
            key_file,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
        }))
    }
}

/// One ssh target. Every command is a fresh `ssh` process.
pub struct SshCommandRunner {
    program: PathBuf,
    host: String,
    port: u16,
    user: String,
    key_file: Option<PathBuf>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshCommandRunner {
    fn args(&self, command: &str) -> Vec<String> {
        ssh_args(
            &self.host,
            self.port,
            &self.user,
            self.key_file.as_deref(),
            self.connect_timeout,
            command,
        )
    }
}

fn ssh_args(
    host: &str,
    port: u16,
    user: &str,
    key_file: Option<&Path>,
    connect_timeout: Duration,
    command: &str,
) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-p".to_string(),
        port.to_string(),
    ];
    if let Some(key) = key_file {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    args.push(format!("{user}@{host}"));
    args.push(format!("sudo -E /bin/bash -c {}", shell_quote(command)));
    args
}

#[async_trait]
impl CommandRunner for SshCommandRunner {
    fn host(&self) -> String {
        self.host.clone()
    }

    async fn run_privileged(&self, command: &str) -> Result<String, ExecError> {
        debug!(host = %self.host, "Running remote command: {}", command);

        let result = tokio::time::timeout(
            self.command_timeout,
            Command::new(&self.program)
                .args(self.args(command))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecError::Spawn {
                    host: self.host.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ExecError::Timeout {
                    host: self.host.clone(),
                    timeout: self.command_timeout,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ExecError::NonZeroExit {
                host: self.host.clone(),
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }
}
