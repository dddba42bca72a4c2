// ABOUTME: DNS and tunnel provider abstraction used by the routing configurator.
// ABOUTME: Covers A records, origin certificates, tunnels, ingress and CNAMEs.

use async_trait::async_trait;
use nonempty::NonEmpty;
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::types::TunnelId;

/// Service the provider answers unmatched tunnel requests with.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("{0} credential is not configured")]
    NotConfigured(&'static str),

    #[error("credential lacks permission: {0}")]
    Permission(String),

    #[error("no zone found for {0}")]
    ZoneNotFound(String),

    #[error("provider API error: {0}")]
    Api(String),

    #[error("certificate error: {0}")]
    Certificate(String),
}

impl DnsError {
    pub fn is_permission(&self) -> bool {
        matches!(self, DnsError::Permission(_))
    }
}

/// Origin certificate written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// A tunnel freshly created at the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct CreatedTunnel {
    pub id: TunnelId,
    pub name: String,
    pub token: String,
}

impl std::fmt::Debug for CreatedTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedTunnel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &"[redacted]")
            .finish()
    }
}

/// One tunnel ingress entry mapping a hostname to an internal service URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

impl IngressRule {
    pub fn route(hostname: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            service: service.into(),
        }
    }

    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            service: CATCH_ALL_SERVICE.to_string(),
        }
    }
}

/// Complete ingress set for a tunnel: the given routes followed by the catch-all.
pub fn ingress_rules(routes: impl IntoIterator<Item = IngressRule>) -> NonEmpty<IngressRule> {
    let mut routes = routes.into_iter();
    let Some(first) = routes.next() else {
        return NonEmpty::new(IngressRule::catch_all());
    };
    let mut rules = NonEmpty::new(first);
    for rule in routes {
        rules.push(rule);
    }
    rules.push(IngressRule::catch_all());
    rules
}

/// Fully qualified record name for `subdomain` inside `root_domain`.
pub fn record_name(subdomain: &str, root_domain: &str) -> String {
    if subdomain == "@" || subdomain.is_empty() {
        root_domain.to_string()
    } else {
        format!("{}.{}", subdomain, root_domain)
    }
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Whether a DNS credential is configured.
    fn dns_configured(&self) -> bool;

    /// Whether a tunnel-capable credential is configured.
    fn tunnel_available(&self) -> bool;

    async fn detect_public_ip(&self) -> Option<IpAddr>;

    async fn issue_origin_cert(&self, root_domain: &str) -> Result<OriginCertificate, DnsError>;

    async fn upsert_dns_record(
        &self,
        subdomain: &str,
        root_domain: &str,
        ip: IpAddr,
    ) -> Result<(), DnsError>;

    async fn delete_dns_record(&self, subdomain: &str, root_domain: &str) -> Result<(), DnsError>;

    async fn create_tunnel(&self, name: &str) -> Result<CreatedTunnel, DnsError>;

    /// A live tunnel called `name`, with a fresh run token.
    async fn find_tunnel(&self, name: &str) -> Result<Option<CreatedTunnel>, DnsError>;

    /// Replace the tunnel's whole ingress configuration.
    async fn configure_ingress(
        &self,
        tunnel_id: &TunnelId,
        rules: &NonEmpty<IngressRule>,
    ) -> Result<(), DnsError>;

    async fn create_cname(
        &self,
        subdomain: &str,
        root_domain: &str,
        tunnel_id: &TunnelId,
    ) -> Result<(), DnsError>;

    async fn delete_tunnel(&self, tunnel_id: &TunnelId) -> Result<(), DnsError>;
}
