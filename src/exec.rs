//! Remote command execution on instances.

pub mod ssh;

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::Instance;
use crate::error::ExecError;

pub use ssh::SshConnector;

/// Runs privileged shell commands on one remote host.
///
/// Each call is one command with no retry. Implementations enforce their
/// own deadline and return the combined output.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Address of the host, used in logs and errors.
    fn host(&self) -> String;

    async fn run_privileged(&self, command: &str) -> Result<String, ExecError>;
}

/// Opens a [`CommandRunner`] for an instance.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, instance: &Instance) -> Result<Arc<dyn CommandRunner>, ExecError>;
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
