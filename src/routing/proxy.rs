// ABOUTME: Reverse-proxy abstraction mapping public hostnames to stack services.
// ABOUTME: Routes are keyed per application so stop can remove them in bulk.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::types::{ApplicationId, Domain};

/// Errors from reverse-proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("reverse proxy admin API unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("reverse proxy rejected request: {0}")]
    Rejected(String),

    #[error("failed to start reverse proxy: {0}")]
    StartFailed(String),
}

/// A reachable reverse-proxy instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub admin_url: String,
    /// HTTP server block routes are added to.
    pub server: String,
}

/// Where a route forwards traffic to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn dial(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.dial())
    }
}

/// Certificate files served for a route's hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOptions {
    /// Explicit certificate; without one the proxy manages its own.
    pub certificate: Option<CertificateFiles>,
}

/// Route identifier for one hostname of an application.
pub fn route_id(app_id: &ApplicationId, domain: &Domain) -> String {
    format!("{}{}", route_prefix(app_id), domain.as_str().replace('.', "-"))
}

/// Prefix shared by every route of an application.
pub fn route_prefix(app_id: &ApplicationId) -> String {
    format!("dockyard:{}:", app_id)
}

#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Look for a running instance; `None` when nothing answers.
    async fn detect_existing(&self) -> Option<ProxyConfig>;

    /// Add or replace the route for `domain`.
    async fn add_route(
        &self,
        config: &ProxyConfig,
        app_id: &ApplicationId,
        domain: &Domain,
        upstream: &Upstream,
        options: &RouteOptions,
    ) -> Result<(), ProxyError>;

    /// Remove every route belonging to `app_id`.
    async fn remove_route(
        &self,
        config: &ProxyConfig,
        app_id: &ApplicationId,
        app_name: &str,
    ) -> Result<(), ProxyError>;

    async fn start_own_instance(&self, admin_email: Option<&str>) -> Result<(), ProxyError>;
}
