// ABOUTME: Cluster driver error types with SNAFU pattern.
// ABOUTME: Separates cancellation aborts from command and API failures.

use snafu::Snafu;
use std::path::PathBuf;

/// Unified error for cluster driver operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClusterError {
    #[snafu(display("failed to run `{command}`: {source}"))]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("`{command}` exited with code {code:?}: {output}"))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[snafu(display("operation aborted by cancellation"))]
    Aborted,

    #[snafu(display("docker API request failed: {source}"))]
    Api { source: bollard::errors::Error },

    #[snafu(display("invalid compose file {}: {source}", path.display()))]
    Compose {
        path: PathBuf,
        source: super::stack_file::StackFileError,
    },

    #[snafu(display("file operation failed for {}: {source}", path.display()))]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterErrorKind {
    /// A command could not be started or exited non-zero.
    Command,
    /// The deployment was cancelled while the operation ran.
    Aborted,
    /// The Docker Engine API returned an error.
    Api,
    /// The compose or stack file could not be read, parsed or written.
    File,
}

impl ClusterError {
    pub fn kind(&self) -> ClusterErrorKind {
        match self {
            ClusterError::Spawn { .. } | ClusterError::CommandFailed { .. } => {
                ClusterErrorKind::Command
            }
            ClusterError::Aborted => ClusterErrorKind::Aborted,
            ClusterError::Api { .. } => ClusterErrorKind::Api,
            ClusterError::Compose { .. } | ClusterError::File { .. } => ClusterErrorKind::File,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.kind() == ClusterErrorKind::Aborted
    }
}
