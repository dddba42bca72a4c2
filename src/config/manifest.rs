// ABOUTME: Application manifests: one app, its repository checkout and its services.
// ABOUTME: The CLI loads a manifest into a MemoryStore before running the pipeline.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::env_value::{EnvValue, resolve_env_map};
use crate::error::{Error, Result};
use crate::model::{AppService, Application, ExposureMethod, Repository};
use crate::store::MemoryStore;
use crate::types::{ApplicationId, RepositoryId, StackName};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppManifest {
    pub app: ManifestApp,
    #[serde(default)]
    pub repository: ManifestRepository,
    #[serde(default)]
    pub services: Vec<ManifestService>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestApp {
    /// Defaults to the name, lowercased and hyphenated.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_compose")]
    pub compose: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub no_cache_build: bool,
    #[serde(default)]
    pub auto_port_allocation: bool,
    #[serde(default = "default_true")]
    pub notifications: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestRepository {
    /// Checkout directory, relative to the manifest file.
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for ManifestRepository {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestService {
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub exposed: bool,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub exposure: ExposureMethod,
}

fn default_compose() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

impl AppManifest {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: AppManifest = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a manifest, resolving the repository path against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut manifest = Self::from_yaml(&content)?;
        if manifest.repository.path.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            manifest.repository.path = base.join(&manifest.repository.path);
        }
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        StackName::from_app_name(&self.app.name)
            .map_err(|e| Error::InvalidConfig(format!("app.name: {}", e)))?;
        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "service '{}' is listed twice",
                    service.name
                )));
            }
        }
        Ok(())
    }

    /// Explicit id, else the stack-safe form of the name.
    pub fn application_id(&self) -> ApplicationId {
        let id = self.app.id.clone().unwrap_or_else(|| {
            StackName::from_app_name(&self.app.name)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| self.app.name.clone())
        });
        ApplicationId::new(id)
    }

    fn repository_id(&self) -> RepositoryId {
        RepositoryId::new(format!("{}-repo", self.application_id()))
    }

    /// Build the application record, resolving env references.
    pub fn application(&self) -> Result<Application> {
        let mut app = Application::new(
            self.application_id(),
            self.app.name.clone(),
            self.repository_id(),
            self.app.compose.clone(),
        );
        app.env = resolve_env_map(&self.app.env)?;
        app.no_cache_build = self.app.no_cache_build;
        app.auto_port_allocation = self.app.auto_port_allocation;
        app.notifications_enabled = self.app.notifications;
        Ok(app)
    }

    pub fn repository(&self) -> Repository {
        let name = self.repository.name.clone().unwrap_or_else(|| {
            self.repository
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.app.name.clone())
        });
        Repository {
            id: self.repository_id(),
            name,
            path: self.repository.path.clone(),
        }
    }

    pub fn services(&self) -> Vec<AppService> {
        let app_id = self.application_id();
        self.services
            .iter()
            .map(|s| {
                let mut service = AppService::new(app_id.clone(), s.name.clone());
                service.container_port = s.port;
                service.exposed = s.exposed;
                service.domain = s.domain.clone();
                service.exposure_method = s.exposure;
                service
            })
            .collect()
    }

    /// Seed a store with this manifest's records.
    pub fn seed(&self, store: &MemoryStore) -> Result<ApplicationId> {
        let app = self.application()?;
        let id = app.id.clone();
        store.insert_repository(self.repository());
        store.insert_application(app);
        for service in self.services() {
            store.insert_service(service);
        }
        Ok(id)
    }
}
