// ABOUTME: The deployment pipeline: ports, infrastructure, build, stack, health, routing.
// ABOUTME: Only the top level turns a stage result into persisted state and a final event.

use chrono::Utc;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use super::error::{DeployError, StageResultExt};
use super::log::BuildLog;
use super::service::DeployService;
use crate::cancel::DeployContext;
use crate::cluster::{BuildSpec, ServiceReplicaStatus, StackDeploySpec};
use crate::diagnostics::{Diagnostics, Warning};
use crate::git;
use crate::model::{
    AppService, AppStatus, Application, CommitInfo, DeployedBy, Deployment, DeploymentFinish,
    DeploymentStatus, Repository, ServiceStatus,
};
use crate::notify::{Notification, NotificationKind};
use crate::progress::{ProgressBroadcaster, ProgressCallback, ProgressEvent, Stage};
use crate::routing::{Exposure, RoutingRequest, TUNNEL_AGENT_SERVICE, plan_exposures};
use crate::types::{ApplicationId, StackName};

const CANCELLED_MESSAGE: &str = "Deployment cancelled by user";

/// Result of one deployment attempt.
///
/// `deployment` is the finished row; it is absent when the attempt was
/// rejected before a row was created.
#[derive(Debug)]
pub struct DeployOutcome {
    pub success: bool,
    pub cancelled: bool,
    pub deployment: Option<Deployment>,
    pub error: Option<DeployError>,
    pub warnings: Vec<Warning>,
}

impl DeployOutcome {
    pub(super) fn rejected(error: DeployError) -> Self {
        Self {
            success: false,
            cancelled: false,
            deployment: None,
            error: Some(error),
            warnings: Vec::new(),
        }
    }
}

/// Fans one attempt's progress out to the broadcaster, the per-call callback
/// and the build log.
struct Reporter {
    app_id: ApplicationId,
    broadcaster: Arc<ProgressBroadcaster>,
    callback: Option<ProgressCallback>,
    log: BuildLog,
}

impl Reporter {
    fn emit(&self, stage: Stage, message: impl Into<String>) {
        let event = ProgressEvent::new(stage, message);
        self.log.push(&format!("[{}] {}", stage, event.message));
        if let Some(callback) = &self.callback
            && catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err()
        {
            tracing::warn!("Progress callback for {} panicked", self.app_id);
        }
        self.broadcaster.emit(&self.app_id, event);
    }
}

/// Everything loaded and validated before the attempt mutates anything.
struct Plan {
    app: Application,
    previous_status: AppStatus,
    repo: Repository,
    stack: StackName,
    services: Vec<AppService>,
    exposures: Vec<Exposure>,
    compose_file: PathBuf,
    /// Repository HEAD before anything is built.
    commit: Option<CommitInfo>,
}

/// Mutable state of an attempt that outlives a failing stage.
struct Attempt {
    deployment: Deployment,
    ctx: Arc<DeployContext>,
    diagnostics: Diagnostics,
    /// A stack deploy was started, so cancellation must clean it up.
    stack_touched: bool,
}

struct StagesDone {
    still_starting: Vec<String>,
}

impl DeployService {
    /// Run one deployment attempt for an application.
    ///
    /// Precondition failures return without side effects. Once the deployment
    /// row exists, every outcome is persisted on it exactly once.
    pub async fn deploy(
        &self,
        app_id: &ApplicationId,
        deployed_by: DeployedBy,
        on_progress: Option<ProgressCallback>,
    ) -> DeployOutcome {
        let mut plan = match self.plan(app_id).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::info!("Deployment of {} rejected: {}", app_id, e);
                return DeployOutcome::rejected(e);
            }
        };

        match self.store.claim_building(app_id).await {
            Ok(Some(previous)) => plan.previous_status = previous,
            Ok(None) => {
                return DeployOutcome::rejected(DeployError::AlreadyBuilding(plan.app.name));
            }
            Err(e) => return DeployOutcome::rejected(e.into()),
        }

        let deployment = match self.store.create_deployment(app_id, deployed_by).await {
            Ok(deployment) => deployment,
            Err(e) => {
                if let Err(restore) = self
                    .store
                    .set_app_status(app_id, plan.previous_status)
                    .await
                {
                    tracing::error!("Failed to restore status of {}: {}", app_id, restore);
                }
                return DeployOutcome::rejected(e.into());
            }
        };

        let ctx = self.registry.register(&deployment.id);
        self.broadcaster.reset(app_id);
        let reporter = Reporter {
            app_id: app_id.clone(),
            broadcaster: Arc::clone(&self.broadcaster),
            callback: on_progress,
            log: BuildLog::new(),
        };
        let mut attempt = Attempt {
            deployment,
            ctx,
            diagnostics: Diagnostics::default(),
            stack_touched: false,
        };

        tracing::info!(
            "Deploying {} as stack {} (deployment {}, by {})",
            plan.app.name,
            plan.stack,
            attempt.deployment.id,
            deployed_by
        );
        reporter.emit(
            Stage::Starting,
            format!("Starting deployment of {}", plan.app.name),
        );

        let result = self.run_stages(&mut plan, &mut attempt, &reporter).await;
        match result {
            Ok(done) => self.succeed(&plan, attempt, &reporter, done).await,
            Err(e) if e.is_cancelled() => self.cancelled(&plan, attempt, &reporter).await,
            Err(e) => self.fail(&plan, attempt, &reporter, e).await,
        }
    }

    async fn plan(&self, app_id: &ApplicationId) -> Result<Plan, DeployError> {
        let app = self
            .store
            .get_application(app_id)
            .await?
            .ok_or_else(|| DeployError::ApplicationNotFound(app_id.clone()))?;
        let repo = self
            .store
            .get_repository(&app.repository_id)
            .await?
            .ok_or_else(|| DeployError::RepositoryNotFound(app.repository_id.clone()))?;
        if app.status == AppStatus::Building {
            return Err(DeployError::AlreadyBuilding(app.name));
        }

        let stack =
            StackName::from_app_name(&app.name).map_err(|source| DeployError::InvalidStackName {
                name: app.name.clone(),
                source,
            })?;
        let services = self.store.list_services(app_id).await?;
        let exposures = plan_exposures(&services)?;

        let compose_file = repo.path.join(&app.compose_path);
        if !compose_file.is_file() {
            return Err(DeployError::ComposeFileMissing(compose_file));
        }
        let commit = git::head_commit(&repo.path).await;

        Ok(Plan {
            previous_status: app.status,
            app,
            repo,
            stack,
            services,
            exposures,
            compose_file,
            commit,
        })
    }

    async fn run_stages(
        &self,
        plan: &mut Plan,
        attempt: &mut Attempt,
        reporter: &Reporter,
    ) -> Result<StagesDone, DeployError> {
        let ctx = Arc::clone(&attempt.ctx);

        // Ports
        ctx.check()?;
        reporter.emit(Stage::Ports, "Checking published ports");
        let check = self
            .cluster
            .validate_and_allocate_ports(
                &plan.stack,
                &plan.compose_file,
                &plan.app.env,
                plan.app.auto_port_allocation,
            )
            .await
            .during(Stage::Ports)?;
        if !check.valid {
            return Err(DeployError::PortConflict(check.conflicts));
        }
        if !check.allocations.is_empty() {
            let mut env = plan.app.env.clone();
            for allocation in &check.allocations {
                env.insert(allocation.env_var.clone(), allocation.to.to_string());
            }
            self.store.set_app_env(&plan.app.id, env.clone()).await?;
            plan.app.env = env;
            for allocation in &check.allocations {
                reporter.emit(
                    Stage::Ports,
                    format!(
                        "Port {} of {} was taken; using {} ({}={})",
                        allocation.from,
                        allocation.service,
                        allocation.to,
                        allocation.env_var,
                        allocation.to
                    ),
                );
            }
        }

        // Infrastructure
        ctx.check()?;
        reporter.emit(Stage::Infrastructure, "Preparing cluster and reverse proxy");
        self.cluster
            .ensure_cluster_mode()
            .await
            .during(Stage::Infrastructure)?;
        self.cluster
            .ensure_network(&self.options.network)
            .await
            .during(Stage::Infrastructure)?;
        self.routing.check_credentials(&plan.exposures)?;
        let proxy = self.routing.ensure_proxy(ctx.token()).await?;
        reporter.emit(
            Stage::Infrastructure,
            format!("Reverse proxy ready at {}", proxy.admin_url),
        );

        // Build
        ctx.check()?;
        reporter.emit(Stage::Building, "Building images");
        let build = BuildSpec {
            stack: plan.stack.clone(),
            compose_file: plan.compose_file.clone(),
            project_dir: plan.repo.path.clone(),
            env: plan.app.env.clone(),
            no_cache: plan.app.no_cache_build,
        };
        let build_sink = |line: &str| reporter.emit(Stage::Building, line);
        self.cluster
            .build_images(&build, &ctx, &build_sink)
            .await
            .during(Stage::Building)?;

        // Stack file
        ctx.check()?;
        reporter.emit(Stage::Stack, "Generating stack file");
        let stack_file = self
            .cluster
            .generate_stack_file(&plan.stack, &plan.compose_file, &self.options.network)
            .await
            .during(Stage::Stack)?;
        reporter.emit(
            Stage::Stack,
            format!("Stack file written to {}", stack_file.display()),
        );

        // Deploy
        ctx.check()?;
        reporter.emit(Stage::Deploying, format!("Deploying stack {}", plan.stack));
        let deploy_spec = StackDeploySpec {
            stack: plan.stack.clone(),
            stack_file: stack_file.clone(),
            project_dir: plan.repo.path.clone(),
            env: plan.app.env.clone(),
        };
        attempt.stack_touched = true;
        let deploy_sink = |line: &str| reporter.emit(Stage::Deploying, line);
        self.cluster
            .deploy_stack(&deploy_spec, &ctx, &deploy_sink)
            .await
            .during(Stage::Deploying)?;

        // Health
        ctx.check()?;
        reporter.emit(Stage::Health, "Waiting for services to start");
        let health = self
            .cluster
            .wait_healthy(&plan.stack, self.options.health_timeout, ctx.token())
            .await
            .during(Stage::Health)?;
        let still_starting = if health.healthy {
            reporter.emit(Stage::Health, "All services running");
            Vec::new()
        } else {
            let message = format!(
                "Services still starting after {}s: {}",
                self.options.health_timeout.as_secs(),
                health.failed_services.join(", ")
            );
            reporter.emit(Stage::Health, format!("Warning: {}", message));
            attempt.diagnostics.warn(Warning::health_timeout(message));
            health.failed_services
        };

        // Routing
        ctx.check()?;
        if plan.exposures.is_empty() {
            reporter.emit(Stage::Routing, "No exposed services");
        } else {
            reporter.emit(
                Stage::Routing,
                format!("Configuring routing for {} service(s)", plan.exposures.len()),
            );
            let request = RoutingRequest {
                app: &plan.app,
                stack: &plan.stack,
                exposures: &plan.exposures,
                stack_file: &stack_file,
                redeploy: &deploy_spec,
                ctx: &ctx,
            };
            let routing_sink = |line: &str| reporter.emit(Stage::Routing, line);
            self.routing
                .configure(&request, &mut attempt.diagnostics, &routing_sink)
                .await?;
        }

        let statuses = self
            .cluster
            .list_service_status(&plan.stack)
            .await
            .during(Stage::Routing)?;
        self.record_service_statuses(&plan.app.id, &plan.services, &statuses)
            .await?;

        Ok(StagesDone { still_starting })
    }

    /// Upsert one service row per compose service the cluster reports.
    async fn record_service_statuses(
        &self,
        app_id: &ApplicationId,
        known: &[AppService],
        statuses: &[ServiceReplicaStatus],
    ) -> Result<(), DeployError> {
        for status in statuses {
            if status.service_name == TUNNEL_AGENT_SERVICE {
                continue;
            }
            let mut service = known
                .iter()
                .find(|s| s.service_name == status.service_name)
                .cloned()
                .unwrap_or_else(|| AppService::new(app_id.clone(), &status.service_name));
            service.status = if status.running > 0 {
                ServiceStatus::Running
            } else {
                ServiceStatus::Stopped
            };
            service.container_id = status.container_id.clone();
            self.store.save_service(&service).await?;
        }
        Ok(())
    }

    async fn succeed(
        &self,
        plan: &Plan,
        attempt: Attempt,
        reporter: &Reporter,
        done: StagesDone,
    ) -> DeployOutcome {
        let deployment = self
            .finish(
                &attempt.deployment,
                DeploymentStatus::Running,
                reporter,
                plan.commit.clone(),
                None,
            )
            .await;
        if let Err(e) = self
            .store
            .mark_app_deployed(&plan.app.id, plan.commit.clone(), Utc::now())
            .await
        {
            tracing::error!("Failed to mark {} as deployed: {}", plan.app.name, e);
        }

        let message = if done.still_starting.is_empty() {
            format!("{} deployed", plan.app.name)
        } else {
            format!(
                "{} deployed; still starting: {}",
                plan.app.name,
                done.still_starting.join(", ")
            )
        };
        reporter.emit(Stage::Done, message.clone());
        if plan.app.notifications_enabled {
            self.notifier.notify(Notification {
                title: "Deployment succeeded".to_string(),
                message,
                app_id: plan.app.id.clone(),
                app_name: plan.app.name.clone(),
                kind: NotificationKind::Success,
            });
        }
        self.registry.release(&attempt.deployment.id);
        tracing::info!("Deployment {} of {} succeeded", attempt.deployment.id, plan.app.name);

        DeployOutcome {
            success: true,
            cancelled: false,
            deployment,
            error: None,
            warnings: attempt.diagnostics.into_warnings(),
        }
    }

    async fn cancelled(&self, plan: &Plan, attempt: Attempt, reporter: &Reporter) -> DeployOutcome {
        self.registry.release(&attempt.deployment.id);
        let deployment = self
            .finish(
                &attempt.deployment,
                DeploymentStatus::Cancelled,
                reporter,
                None,
                Some(CANCELLED_MESSAGE.to_string()),
            )
            .await;
        if let Err(e) = self
            .store
            .set_app_status(&plan.app.id, AppStatus::Stopped)
            .await
        {
            tracing::error!("Failed to mark {} as stopped: {}", plan.app.name, e);
        }
        if attempt.stack_touched
            && let Err(e) = self.cluster.remove_stack(&plan.stack).await
        {
            tracing::warn!("Failed to remove partial stack {}: {}", plan.stack, e);
        }
        reporter.emit(Stage::Cancelled, CANCELLED_MESSAGE);
        tracing::info!("Deployment {} of {} cancelled", attempt.deployment.id, plan.app.name);

        DeployOutcome {
            success: false,
            cancelled: true,
            deployment,
            error: Some(DeployError::Cancelled),
            warnings: attempt.diagnostics.into_warnings(),
        }
    }

    async fn fail(
        &self,
        plan: &Plan,
        attempt: Attempt,
        reporter: &Reporter,
        error: DeployError,
    ) -> DeployOutcome {
        let message = error.to_string();
        tracing::error!(
            "Deployment {} of {} failed: {}",
            attempt.deployment.id,
            plan.app.name,
            message
        );
        let deployment = self
            .finish(
                &attempt.deployment,
                DeploymentStatus::Failed,
                reporter,
                None,
                Some(message.clone()),
            )
            .await;
        if let Err(e) = self
            .store
            .set_app_status(&plan.app.id, AppStatus::Failed)
            .await
        {
            tracing::error!("Failed to mark {} as failed: {}", plan.app.name, e);
        }
        reporter.emit(Stage::Failed, message.clone());
        if plan.app.notifications_enabled {
            self.notifier.notify(Notification {
                title: "Deployment failed".to_string(),
                message,
                app_id: plan.app.id.clone(),
                app_name: plan.app.name.clone(),
                kind: NotificationKind::Failure,
            });
        }
        self.registry.release(&attempt.deployment.id);

        DeployOutcome {
            success: false,
            cancelled: false,
            deployment,
            error: Some(error),
            warnings: attempt.diagnostics.into_warnings(),
        }
    }

    /// Apply the terminal update. Persistence errors are logged, not raised,
    /// since the outcome is already decided.
    async fn finish(
        &self,
        deployment: &Deployment,
        status: DeploymentStatus,
        reporter: &Reporter,
        commit: Option<CommitInfo>,
        error: Option<String>,
    ) -> Option<Deployment> {
        let finish = DeploymentFinish {
            status,
            build_log: reporter.log.contents(),
            commit,
            error,
        };
        match self.store.finish_deployment(&deployment.id, finish).await {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::error!("Failed to record deployment {}: {}", deployment.id, e);
                None
            }
        }
    }
}
