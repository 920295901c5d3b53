//! Error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime could not be reached at all (socket missing, connection
    /// refused, timeout).
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    /// The container went away between listing and inspection.
    #[error("container {0} not found")]
    NotFound(String),

    /// The runtime answered, but with an error.
    #[error("container runtime returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl RuntimeError {
    /// Returns `true` when the runtime itself is down, as opposed to a
    /// single container failing to resolve.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Errors that terminate the daemon.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Writing the hosts file failed. Never retried.
    #[error("failed to publish {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {executable}: {source}")]
    ResolverStart {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resolver process: {0}")]
    Resolver(#[source] std::io::Error),

    #[error("failed to remove {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("reconciliation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn publish(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Publish {
            path: path.into(),
            source,
        }
    }
}
