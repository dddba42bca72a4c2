// ABOUTME: Error taxonomy of the deployment pipeline, stop and rollback.
// ABOUTME: Kinds separate precondition rejections, stage failures and cancellation.

use std::path::PathBuf;

use crate::cancel::Cancelled;
use crate::cluster::{ClusterError, PortConflict};
use crate::progress::Stage;
use crate::routing::RoutingError;
use crate::store::StoreError;
use crate::types::{ApplicationId, DeploymentId, RepositoryId, StackNameError};

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("application not found: {0}")]
    ApplicationNotFound(ApplicationId),

    #[error("repository {0} of the application was not found")]
    RepositoryNotFound(RepositoryId),

    #[error("application '{0}' is already building")]
    AlreadyBuilding(String),

    #[error("application name '{name}' cannot be used as a stack name: {source}")]
    InvalidStackName {
        name: String,
        #[source]
        source: StackNameError,
    },

    #[error("compose file not found: {}", .0.display())]
    ComposeFileMissing(PathBuf),

    /// A routed service is missing its container port or has a bad domain.
    #[error(transparent)]
    InvalidExposure(RoutingError),

    #[error("port conflict: {}", format_conflicts(.0))]
    PortConflict(Vec<PortConflict>),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(DeploymentId),

    #[error("deployment {deployment} does not belong to application {application}")]
    DeploymentMismatch {
        deployment: DeploymentId,
        application: ApplicationId,
    },

    #[error("{stage} failed: {source}")]
    Cluster {
        stage: Stage,
        #[source]
        source: ClusterError,
    },

    #[error("failed to remove stack {stack}: {source}")]
    StackRemoval {
        stack: String,
        #[source]
        source: ClusterError,
    },

    #[error("routing failed: {0}")]
    Routing(RoutingError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("deployment cancelled")]
    Cancelled,
}

fn format_conflicts(conflicts: &[PortConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployErrorKind {
    /// Rejected before anything was mutated, or a bad request on its face.
    Precondition,
    /// A stage failed; recorded on the deployment row.
    Stage,
    /// The user aborted the deployment.
    Cancelled,
}

impl DeployError {
    pub fn kind(&self) -> DeployErrorKind {
        match self {
            DeployError::ApplicationNotFound(_)
            | DeployError::RepositoryNotFound(_)
            | DeployError::AlreadyBuilding(_)
            | DeployError::InvalidStackName { .. }
            | DeployError::ComposeFileMissing(_)
            | DeployError::InvalidExposure(_)
            | DeployError::PortConflict(_)
            | DeployError::DeploymentNotFound(_)
            | DeployError::DeploymentMismatch { .. } => DeployErrorKind::Precondition,
            DeployError::Cluster { source, .. } if source.is_aborted() => {
                DeployErrorKind::Cancelled
            }
            DeployError::Routing(e) if e.is_aborted() => DeployErrorKind::Cancelled,
            DeployError::Cancelled => DeployErrorKind::Cancelled,
            DeployError::Cluster { .. }
            | DeployError::StackRemoval { .. }
            | DeployError::Routing(_)
            | DeployError::Store(_) => DeployErrorKind::Stage,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == DeployErrorKind::Cancelled
    }
}

impl From<Cancelled> for DeployError {
    fn from(_: Cancelled) -> Self {
        DeployError::Cancelled
    }
}

impl From<RoutingError> for DeployError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::MissingContainerPort(_) | RoutingError::InvalidDomain { .. } => {
                DeployError::InvalidExposure(err)
            }
            other => DeployError::Routing(other),
        }
    }
}

/// Attach the running stage to cluster failures.
pub(crate) trait StageResultExt<T> {
    fn during(self, stage: Stage) -> Result<T, DeployError>;
}

impl<T> StageResultExt<T> for Result<T, ClusterError> {
    fn during(self, stage: Stage) -> Result<T, DeployError> {
        self.map_err(|source| DeployError::Cluster { stage, source })
    }
}
