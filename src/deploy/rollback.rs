// ABOUTME: Rollback as a redeploy of the current compose state.
// ABOUTME: The target deployment only has to exist and belong to the application.

use super::error::DeployError;
use super::pipeline::DeployOutcome;
use super::service::DeployService;
use crate::model::DeployedBy;
use crate::progress::ProgressCallback;
use crate::types::{ApplicationId, DeploymentId};

impl DeployService {
    /// Redeploy an application, tagged as a rollback to `target`.
    ///
    /// The target's commit and compose snapshot are not restored; the
    /// repository's current state is deployed again.
    pub async fn rollback(
        &self,
        app_id: &ApplicationId,
        target: &DeploymentId,
        on_progress: Option<ProgressCallback>,
    ) -> DeployOutcome {
        let deployment = match self.store.get_deployment(target).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                return DeployOutcome::rejected(DeployError::DeploymentNotFound(target.clone()));
            }
            Err(e) => return DeployOutcome::rejected(e.into()),
        };
        if &deployment.application_id != app_id {
            return DeployOutcome::rejected(DeployError::DeploymentMismatch {
                deployment: target.clone(),
                application: app_id.clone(),
            });
        }

        tracing::info!(
            "Rolling back {} to deployment {} (commit {})",
            app_id,
            target,
            deployment.commit_hash.as_deref().unwrap_or("unknown")
        );
        self.deploy(app_id, DeployedBy::Rollback, on_progress).await
    }
}
