// ABOUTME: Application, repository and per-service records.
// ABOUTME: Status enums serialize lowercase to match stored values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::types::{ApplicationId, RepositoryId};

/// Lifecycle status of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    #[default]
    Stopped,
    Building,
    Running,
    Failed,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Stopped => write!(f, "stopped"),
            AppStatus::Building => write!(f, "building"),
            AppStatus::Running => write!(f, "running"),
            AppStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A deployable application backed by a compose file in a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub name: String,
    pub repository_id: RepositoryId,
    /// Compose file path, relative to the repository root.
    pub compose_path: PathBuf,
    #[serde(default)]
    pub status: AppStatus,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_deploy_enabled: bool,
    #[serde(default)]
    pub no_cache_build: bool,
    #[serde(default)]
    pub auto_port_allocation: bool,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default)]
    pub last_commit_hash: Option<String>,
    #[serde(default)]
    pub last_commit_message: Option<String>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Application {
    pub fn new(
        id: ApplicationId,
        name: impl Into<String>,
        repository_id: RepositoryId,
        compose_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            repository_id,
            compose_path: compose_path.into(),
            status: AppStatus::Stopped,
            env: BTreeMap::new(),
            auto_deploy_enabled: false,
            no_cache_build: false,
            auto_port_allocation: false,
            notifications_enabled: true,
            last_commit_hash: None,
            last_commit_message: None,
            last_deployed_at: None,
        }
    }
}

/// A git checkout on disk. Read-only to the deployment engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub path: PathBuf,
}

/// How an exposed service is reached from the internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMethod {
    #[default]
    Dns,
    Tunnel,
}

/// Runtime status of one compose service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    #[default]
    Stopped,
}

/// One compose service belonging to an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppService {
    pub application_id: ApplicationId,
    pub service_name: String,
    #[serde(default)]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub exposed: bool,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub exposure_method: ExposureMethod,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub container_id: Option<String>,
}

impl AppService {
    pub fn new(application_id: ApplicationId, service_name: impl Into<String>) -> Self {
        Self {
            application_id,
            service_name: service_name.into(),
            container_port: None,
            exposed: false,
            domain: None,
            exposure_method: ExposureMethod::Dns,
            status: ServiceStatus::Stopped,
            container_id: None,
        }
    }

    /// The trimmed domain, if one is configured.
    pub fn domain(&self) -> Option<&str> {
        self.domain
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }

    /// Exposed with a non-empty domain: these services get routing.
    pub fn is_routed(&self) -> bool {
        self.exposed && self.domain().is_some()
    }
}
