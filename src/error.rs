//! Error types for sko.

use std::time::Duration;

use thiserror::Error;

use crate::crd::condition::reasons;

/// Errors returned by the object store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("conflict writing {kind} {namespace}/{name}: object was modified")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("Kubernetes API error: {0}")]
    Api(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors from running a command on a remote host.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("[{host}] failed to start ssh: {message}")]
    Spawn { host: String, message: String },

    #[error("[{host}] command timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("[{host}] command exited with code {code}: {output}")]
    NonZeroExit {
        host: String,
        code: i32,
        output: String,
    },

    #[error("[{host}] ssh credentials unavailable: {message}")]
    Auth { host: String, message: String },
}

/// Errors from workload cluster node access.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("workload cluster kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("workload cluster API error: {0}")]
    Client(String),

    #[error("node {0} not found in the workload cluster")]
    NotFound(String),
}

/// Returned when a bounded poll runs out of time.
#[derive(Error, Debug)]
#[error("timed out after {elapsed:?}: {last}")]
pub struct PollError {
    pub elapsed: Duration,
    /// Message of the last failed attempt.
    pub last: String,
}

/// Errors surfaced by the reconcilers.
#[derive(Error, Debug)]
pub enum SkoError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("phase {phase} failed: {source}")]
    Phase {
        phase: String,
        #[source]
        source: PollError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown instance state: {0}")]
    UnknownState(String),

    #[error("Required object missing: {0}")]
    MissingObject(String),
}

impl SkoError {
    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Exec(_) | Self::Node(_) | Self::Phase { .. }
        )
    }

    /// `status.failureReason` recorded for a terminal error.
    pub const fn failure_reason(&self) -> &'static str {
        match self {
            Self::UnknownState(_) => reasons::UNKNOWN_STATE,
            _ => reasons::INVALID_CONFIGURATION,
        }
    }
}
