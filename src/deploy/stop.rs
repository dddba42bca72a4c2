// ABOUTME: Stopping an application: stack removal plus best-effort routing teardown.
// ABOUTME: Only the stack removal can fail the operation; cleanups become warnings.

use super::error::DeployError;
use super::service::DeployService;
use crate::diagnostics::{Diagnostics, Warning};
use crate::model::{AppStatus, ServiceStatus};
use crate::types::{ApplicationId, StackName};

/// What a stop did besides removing the stack.
#[derive(Debug, Default)]
pub struct StopReport {
    pub routing_removed: bool,
    pub tunnel_removed: bool,
    pub warnings: Vec<Warning>,
}

impl DeployService {
    /// Remove an application's stack and tear down its external routing.
    ///
    /// Routes and DNS records survive when `preserve_routing` is set. The
    /// tunnel always goes: its agent ran inside the removed stack.
    pub async fn stop(&self, app_id: &ApplicationId) -> Result<StopReport, DeployError> {
        let app = self
            .store
            .get_application(app_id)
            .await?
            .ok_or_else(|| DeployError::ApplicationNotFound(app_id.clone()))?;
        if app.status == AppStatus::Building {
            return Err(DeployError::AlreadyBuilding(app.name));
        }
        let stack =
            StackName::from_app_name(&app.name).map_err(|source| DeployError::InvalidStackName {
                name: app.name.clone(),
                source,
            })?;

        tracing::info!("Stopping {} (stack {})", app.name, stack);
        self.cluster
            .remove_stack(&stack)
            .await
            .map_err(|source| DeployError::StackRemoval {
                stack: stack.to_string(),
                source,
            })?;

        let mut diagnostics = Diagnostics::default();
        let mut report = StopReport::default();
        let services = self.store.list_services(app_id).await?;

        if self.options.preserve_routing {
            tracing::info!("Keeping routes and DNS records of {}", app.name);
        } else {
            self.routing
                .remove_routing(app_id, &app.name, &services, &mut diagnostics)
                .await;
            report.routing_removed = true;
        }

        for service in &services {
            let mut service = service.clone();
            service.status = ServiceStatus::Stopped;
            service.container_id = None;
            if let Err(e) = self.store.save_service(&service).await {
                diagnostics.warn(Warning::cleanup_failed(format!(
                    "Failed to mark service {} stopped: {}",
                    service.service_name, e
                )));
            }
        }

        match self.routing.remove_tunnel(app_id, &stack, &mut diagnostics).await {
            Ok(removed) => report.tunnel_removed = removed,
            Err(e) => diagnostics.warn(Warning::cleanup_failed(format!(
                "Failed to remove tunnel of {}: {}",
                app.name, e
            ))),
        }

        self.store.set_app_status(app_id, AppStatus::Stopped).await?;
        tracing::info!("Stopped {}", app.name);

        report.warnings = diagnostics.into_warnings();
        Ok(report)
    }
}
