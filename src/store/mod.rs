// ABOUTME: Persistence interface consumed by the deployment engine.
// ABOUTME: Point updates keyed by id, plus an in-memory implementation.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::model::{
    AppService, AppStatus, Application, CommitInfo, DeployedBy, Deployment, DeploymentFinish,
    Repository, Tunnel,
};
use crate::types::{ApplicationId, DeploymentId, RepositoryId};

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("deployment {0} already has a terminal status")]
    AlreadyFinished(DeploymentId),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD over the records the pipeline touches.
///
/// Implementations must make `claim_building` atomic: it is the only thing
/// standing between two concurrent deploys of the same application.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_application(&self, id: &ApplicationId) -> StoreResult<Option<Application>>;

    async fn get_repository(&self, id: &RepositoryId) -> StoreResult<Option<Repository>>;

    /// Flip the application to `building` unless it already is.
    ///
    /// Returns the previous status when the claim succeeded, `None` when the
    /// application was already building.
    async fn claim_building(&self, id: &ApplicationId) -> StoreResult<Option<AppStatus>>;

    async fn set_app_status(&self, id: &ApplicationId, status: AppStatus) -> StoreResult<()>;

    async fn set_app_env(
        &self,
        id: &ApplicationId,
        env: BTreeMap<String, String>,
    ) -> StoreResult<()>;

    /// Mark the application running and record last-deploy metadata.
    async fn mark_app_deployed(
        &self,
        id: &ApplicationId,
        commit: Option<CommitInfo>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn list_services(&self, app: &ApplicationId) -> StoreResult<Vec<AppService>>;

    /// Insert or replace the service keyed by (application, service name).
    async fn save_service(&self, service: &AppService) -> StoreResult<()>;

    /// Create a `pending` deployment row.
    async fn create_deployment(
        &self,
        app: &ApplicationId,
        deployed_by: DeployedBy,
    ) -> StoreResult<Deployment>;

    /// Apply the single terminal update to a pending deployment.
    async fn finish_deployment(
        &self,
        id: &DeploymentId,
        finish: DeploymentFinish,
    ) -> StoreResult<Deployment>;

    async fn get_deployment(&self, id: &DeploymentId) -> StoreResult<Option<Deployment>>;

    /// Deployments of an application, oldest first.
    async fn list_deployments(&self, app: &ApplicationId) -> StoreResult<Vec<Deployment>>;

    async fn get_tunnel(&self, app: &ApplicationId) -> StoreResult<Option<Tunnel>>;

    async fn save_tunnel(&self, tunnel: &Tunnel) -> StoreResult<()>;

    async fn delete_tunnel(&self, app: &ApplicationId) -> StoreResult<()>;
}
