// ABOUTME: In-memory Store used by the CLI and tests.
// ABOUTME: A single parking_lot mutex serializes every operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{Store, StoreError, StoreResult};
use crate::model::{
    AppService, AppStatus, Application, CommitInfo, DeployedBy, Deployment, DeploymentFinish,
    DeploymentStatus, Repository, Tunnel,
};
use crate::types::{ApplicationId, DeploymentId, RepositoryId};

#[derive(Default)]
struct Tables {
    applications: HashMap<ApplicationId, Application>,
    repositories: HashMap<RepositoryId, Repository>,
    services: Vec<AppService>,
    deployments: Vec<Deployment>,
    tunnels: HashMap<ApplicationId, Tunnel>,
    next_deployment: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_application(&self, app: Application) {
        self.tables.lock().applications.insert(app.id.clone(), app);
    }

    pub fn insert_repository(&self, repo: Repository) {
        self.tables.lock().repositories.insert(repo.id.clone(), repo);
    }

    pub fn insert_service(&self, service: AppService) {
        upsert_service(&mut self.tables.lock(), service);
    }

    /// Number of deployment rows across all applications.
    pub fn deployment_count(&self) -> usize {
        self.tables.lock().deployments.len()
    }
}

fn upsert_service(tables: &mut Tables, service: AppService) {
    match tables.services.iter_mut().find(|s| {
        s.application_id == service.application_id && s.service_name == service.service_name
    }) {
        Some(existing) => *existing = service,
        None => tables.services.push(service),
    }
}

fn app_mut<'a>(tables: &'a mut Tables, id: &ApplicationId) -> StoreResult<&'a mut Application> {
    tables
        .applications
        .get_mut(id)
        .ok_or_else(|| StoreError::NotFound(format!("application {}", id)))
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_application(&self, id: &ApplicationId) -> StoreResult<Option<Application>> {
        Ok(self.tables.lock().applications.get(id).cloned())
    }

    async fn get_repository(&self, id: &RepositoryId) -> StoreResult<Option<Repository>> {
        Ok(self.tables.lock().repositories.get(id).cloned())
    }

    async fn claim_building(&self, id: &ApplicationId) -> StoreResult<Option<AppStatus>> {
        let mut tables = self.tables.lock();
        let app = app_mut(&mut tables, id)?;
        if app.status == AppStatus::Building {
            return Ok(None);
        }
        let previous = app.status;
        app.status = AppStatus::Building;
        Ok(Some(previous))
    }

    async fn set_app_status(&self, id: &ApplicationId, status: AppStatus) -> StoreResult<()> {
        app_mut(&mut self.tables.lock(), id)?.status = status;
        Ok(())
    }

    async fn set_app_env(
        &self,
        id: &ApplicationId,
        env: BTreeMap<String, String>,
    ) -> StoreResult<()> {
        app_mut(&mut self.tables.lock(), id)?.env = env;
        Ok(())
    }

    async fn mark_app_deployed(
        &self,
        id: &ApplicationId,
        commit: Option<CommitInfo>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let app = app_mut(&mut tables, id)?;
        app.status = AppStatus::Running;
        app.last_deployed_at = Some(at);
        if let Some(commit) = commit {
            app.last_commit_hash = Some(commit.hash);
            app.last_commit_message = Some(commit.message);
        }
        Ok(())
    }

    async fn list_services(&self, app: &ApplicationId) -> StoreResult<Vec<AppService>> {
        Ok(self
            .tables
            .lock()
            .services
            .iter()
            .filter(|s| &s.application_id == app)
            .cloned()
            .collect())
    }

    async fn save_service(&self, service: &AppService) -> StoreResult<()> {
        upsert_service(&mut self.tables.lock(), service.clone());
        Ok(())
    }

    async fn create_deployment(
        &self,
        app: &ApplicationId,
        deployed_by: DeployedBy,
    ) -> StoreResult<Deployment> {
        let mut tables = self.tables.lock();
        if !tables.applications.contains_key(app) {
            return Err(StoreError::NotFound(format!("application {}", app)));
        }
        tables.next_deployment += 1;
        let deployment = Deployment {
            id: DeploymentId::new(format!("dep-{}", tables.next_deployment)),
            application_id: app.clone(),
            status: DeploymentStatus::Pending,
            deployed_by,
            build_log: String::new(),
            commit_hash: None,
            commit_message: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        tables.deployments.push(deployment.clone());
        Ok(deployment)
    }

    async fn finish_deployment(
        &self,
        id: &DeploymentId,
        finish: DeploymentFinish,
    ) -> StoreResult<Deployment> {
        let mut tables = self.tables.lock();
        let deployment = tables
            .deployments
            .iter_mut()
            .find(|d| &d.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("deployment {}", id)))?;
        if deployment.status.is_terminal() {
            return Err(StoreError::AlreadyFinished(id.clone()));
        }
        deployment.status = finish.status;
        deployment.build_log = finish.build_log;
        deployment.error = finish.error;
        if let Some(commit) = finish.commit {
            deployment.commit_hash = Some(commit.hash);
            deployment.commit_message = Some(commit.message);
        }
        deployment.completed_at = Some(Utc::now());
        Ok(deployment.clone())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> StoreResult<Option<Deployment>> {
        Ok(self
            .tables
            .lock()
            .deployments
            .iter()
            .find(|d| &d.id == id)
            .cloned())
    }

    async fn list_deployments(&self, app: &ApplicationId) -> StoreResult<Vec<Deployment>> {
        Ok(self
            .tables
            .lock()
            .deployments
            .iter()
            .filter(|d| &d.application_id == app)
            .cloned()
            .collect())
    }

    async fn get_tunnel(&self, app: &ApplicationId) -> StoreResult<Option<Tunnel>> {
        Ok(self.tables.lock().tunnels.get(app).cloned())
    }

    async fn save_tunnel(&self, tunnel: &Tunnel) -> StoreResult<()> {
        self.tables
            .lock()
            .tunnels
            .insert(tunnel.application_id.clone(), tunnel.clone());
        Ok(())
    }

    async fn delete_tunnel(&self, app: &ApplicationId) -> StoreResult<()> {
        self.tables.lock().tunnels.remove(app);
        Ok(())
    }
}
