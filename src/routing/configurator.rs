// ABOUTME: Routing configurator deciding between DNS and tunnel exposure per service.
// ABOUTME: Owns proxy bootstrap, route/record creation, tunnel lifecycle and stop teardown.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::cache::RoutingCache;
use super::dns::{DnsError, DnsProvider, IngressRule, ingress_rules};
use super::proxy::{
    CertificateFiles, ProxyConfig, ProxyError, ReverseProxy, RouteOptions, Upstream,
};
use crate::cancel::{CancelToken, DeployContext};
use crate::cluster::{AgentService, ClusterDriver, ClusterError, StackDeploySpec};
use crate::diagnostics::{Diagnostics, Warning};
use crate::model::{AppService, Application, ExposureMethod, Tunnel, TunnelStatus};
use crate::process::LineSink;
use crate::store::{Store, StoreError};
use crate::types::{ApplicationId, Domain, DomainError, StackName};

/// Name of the agent service added to tunnel-exposed stacks.
pub const TUNNEL_AGENT_SERVICE: &str = "tunnel-agent";

const PROXY_DETECT_ATTEMPTS: u32 = 5;
const PROXY_DETECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("service '{0}' is exposed with a domain but has no container port")]
    MissingContainerPort(String),

    #[error("service '{service}' has an invalid domain: {source}")]
    InvalidDomain {
        service: String,
        #[source]
        source: DomainError,
    },

    #[error(
        "service '{0}' uses tunnel exposure but no tunnel is configured; set tunnel.account_id and tunnel.api_token"
    )]
    TunnelNotConfigured(String),

    #[error("could not detect this host's public IP; the DNS record cannot be created")]
    PublicIpUnavailable,

    #[error("reverse proxy is not available after starting it")]
    ProxyUnavailable,

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("DNS provider: {0}")]
    Dns(#[from] DnsError),

    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RoutingError {
    /// The error came from a cluster operation cut short by cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, RoutingError::Cluster(e) if e.is_aborted())
    }
}

/// A service that gets a public hostname.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub service_name: String,
    pub domain: Domain,
    pub port: u16,
    pub method: ExposureMethod,
}

impl Exposure {
    pub fn upstream(&self, stack: &StackName) -> Upstream {
        Upstream::new(stack.service_host(&self.service_name), self.port)
    }
}

/// Routed services of an application, validated.
///
/// Fails on the first routed service without a positive container port or
/// with an unparseable domain.
pub fn plan_exposures(services: &[AppService]) -> Result<Vec<Exposure>, RoutingError> {
    let mut exposures = Vec::new();
    for service in services.iter().filter(|s| s.is_routed()) {
        let port = service
            .container_port
            .filter(|p| *p > 0)
            .ok_or_else(|| RoutingError::MissingContainerPort(service.service_name.clone()))?;
        let raw = service.domain().unwrap_or_default();
        let domain = Domain::parse(raw).map_err(|source| RoutingError::InvalidDomain {
            service: service.service_name.clone(),
            source,
        })?;
        exposures.push(Exposure {
            service_name: service.service_name.clone(),
            domain,
            port,
            method: service.exposure_method,
        });
    }
    Ok(exposures)
}

#[derive(Debug, Clone)]
pub struct RoutingOptions {
    pub network: String,
    pub admin_email: Option<String>,
    pub tunnel_agent_image: String,
    /// Host name used in tunnel names.
    pub host_name: String,
}

/// What one routing pass needs from the pipeline.
pub struct RoutingRequest<'a> {
    pub app: &'a Application,
    pub stack: &'a StackName,
    pub exposures: &'a [Exposure],
    pub stack_file: &'a Path,
    pub redeploy: &'a StackDeploySpec,
    pub ctx: &'a DeployContext,
}

pub struct RoutingConfigurator {
    proxy: Arc<dyn ReverseProxy>,
    dns: Arc<dyn DnsProvider>,
    cluster: Arc<dyn ClusterDriver>,
    store: Arc<dyn Store>,
    cache: RoutingCache,
    options: RoutingOptions,
}

impl RoutingConfigurator {
    pub fn new(
        proxy: Arc<dyn ReverseProxy>,
        dns: Arc<dyn DnsProvider>,
        cluster: Arc<dyn ClusterDriver>,
        store: Arc<dyn Store>,
        options: RoutingOptions,
    ) -> Self {
        Self {
            proxy,
            dns,
            cluster,
            store,
            cache: RoutingCache::new(),
            options,
        }
    }

    pub fn cache(&self) -> &RoutingCache {
        &self.cache
    }

    /// Provider-side tunnel name of a stack on this host.
    pub fn tunnel_name(&self, stack: &StackName) -> String {
        format!("dockyard-{}-{}", stack, self.options.host_name)
    }

    /// Reject tunnel exposure up front when no tunnel credential exists.
    pub fn check_credentials(&self, exposures: &[Exposure]) -> Result<(), RoutingError> {
        match exposures
            .iter()
            .find(|e| e.method == ExposureMethod::Tunnel)
        {
            Some(e) if !self.dns.tunnel_available() => {
                Err(RoutingError::TunnelNotConfigured(e.service_name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Find a running reverse proxy, starting our own when none answers.
    ///
    /// Waiting for a freshly started proxy ends early with
    /// [`ClusterError::Aborted`] once `token` is cancelled.
    pub async fn ensure_proxy(&self, token: &CancelToken) -> Result<ProxyConfig, RoutingError> {
        if let Some(config) = self.cache.proxy() {
            return Ok(config);
        }

        if let Some(config) = self.proxy.detect_existing().await {
            self.cache.set_proxy(config.clone());
            return Ok(config);
        }

        tracing::info!("No reverse proxy detected, starting one");
        self.proxy
            .start_own_instance(self.options.admin_email.as_deref())
            .await?;

        for _ in 0..PROXY_DETECT_ATTEMPTS {
            if let Some(config) = self.proxy.detect_existing().await {
                self.cache.set_proxy(config.clone());
                return Ok(config);
            }
            tokio::select! {
                _ = tokio::time::sleep(PROXY_DETECT_DELAY) => {}
                _ = token.cancelled() => return Err(ClusterError::Aborted.into()),
            }
        }
        Err(RoutingError::ProxyUnavailable)
    }

    async fn public_ip(&self) -> Option<std::net::IpAddr> {
        if let Some(ip) = self.cache.public_ip() {
            return Some(ip);
        }
        let ip = self.dns.detect_public_ip().await?;
        self.cache.set_public_ip(ip);
        Some(ip)
    }

    /// Configure routing for every exposure in the request.
    pub async fn configure(
        &self,
        request: &RoutingRequest<'_>,
        diagnostics: &mut Diagnostics,
        on_line: LineSink<'_>,
    ) -> Result<(), RoutingError> {
        self.check_credentials(request.exposures)?;

        let (dns_exposures, tunnel_exposures): (Vec<&Exposure>, Vec<&Exposure>) = request
            .exposures
            .iter()
            .partition(|e| e.method == ExposureMethod::Dns);

        if !dns_exposures.is_empty() {
            self.configure_dns(request, &dns_exposures, diagnostics, on_line)
                .await?;
        }
        if !tunnel_exposures.is_empty() {
            self.configure_tunnel(request, &tunnel_exposures, on_line)
                .await?;
        }
        Ok(())
    }

    async fn configure_dns(
        &self,
        request: &RoutingRequest<'_>,
        exposures: &[&Exposure],
        diagnostics: &mut Diagnostics,
        on_line: LineSink<'_>,
    ) -> Result<(), RoutingError> {
        let proxy = self.ensure_proxy(request.ctx.token()).await?;
        let dns_configured = self.dns.dns_configured();
        let mut certificates: HashMap<String, Option<CertificateFiles>> = HashMap::new();

        for exposure in exposures {
            request.ctx.check().map_err(|_| ClusterError::Aborted)?;
            let domain = &exposure.domain;
            let root = domain.root().to_string();

            if dns_configured && !certificates.contains_key(&root) {
                let certificate = match self.dns.issue_origin_cert(&root).await {
                    Ok(cert) => Some(CertificateFiles {
                        cert_path: cert.cert_path,
                        key_path: cert.key_path,
                    }),
                    Err(e) => {
                        let hint = if e.is_permission() {
                            " (token needs SSL and Certificates edit permission)"
                        } else {
                            ""
                        };
                        let message = format!(
                            "Origin certificate for {} unavailable{}: {}; proxy will manage TLS",
                            root, hint, e
                        );
                        on_line(&format!("Warning: {}", message));
                        diagnostics.warn(Warning::certificate_fallback(message));
                        None
                    }
                };
                certificates.insert(root.clone(), certificate);
            }

            let options = RouteOptions {
                certificate: certificates.get(&root).cloned().flatten(),
            };
            let upstream = exposure.upstream(request.stack);
            self.proxy
                .add_route(&proxy, &request.app.id, domain, &upstream, &options)
                .await?;
            on_line(&format!("Route {} -> {}", domain, upstream.url()));

            if dns_configured {
                let ip = self
                    .public_ip()
                    .await
                    .ok_or(RoutingError::PublicIpUnavailable)?;
                self.dns
                    .upsert_dns_record(domain.subdomain(), domain.root(), ip)
                    .await?;
                on_line(&format!("DNS record {} -> {}", domain, ip));
            } else {
                let message = format!(
                    "No DNS provider configured: point {} at this host's public IP manually",
                    domain
                );
                on_line(&format!("Warning: {}", message));
                diagnostics.warn(Warning::manual_dns(message));
            }
        }
        Ok(())
    }

    async fn configure_tunnel(
        &self,
        request: &RoutingRequest<'_>,
        exposures: &[&Exposure],
        on_line: LineSink<'_>,
    ) -> Result<(), RoutingError> {
        let app_id = &request.app.id;
        let mut tunnel = match self.store.get_tunnel(app_id).await? {
            Some(tunnel) => tunnel,
            None => {
                let name = self.tunnel_name(request.stack);
                let (remote, verb) = match self.dns.find_tunnel(&name).await? {
                    Some(found) => (found, "Reusing"),
                    None => (self.dns.create_tunnel(&name).await?, "Created"),
                };
                let tunnel = Tunnel {
                    application_id: app_id.clone(),
                    tunnel_id: remote.id,
                    name: remote.name,
                    token: remote.token,
                    status: TunnelStatus::Inactive,
                };
                self.store.save_tunnel(&tunnel).await?;
                on_line(&format!("{} tunnel {}", verb, tunnel.name));
                tunnel
            }
        };

        let rules = ingress_rules(exposures.iter().map(|e| {
            IngressRule::route(e.domain.as_str(), e.upstream(request.stack).url())
        }));
        self.dns
            .configure_ingress(&tunnel.tunnel_id, &rules)
            .await?;
        on_line(&format!(
            "Tunnel {} ingress set for {} hostname(s)",
            tunnel.name,
            exposures.len()
        ));

        for exposure in exposures {
            self.dns
                .create_cname(
                    exposure.domain.subdomain(),
                    exposure.domain.root(),
                    &tunnel.tunnel_id,
                )
                .await?;
            on_line(&format!("CNAME {} -> tunnel {}", exposure.domain, tunnel.name));
        }

        let agent = AgentService {
            name: TUNNEL_AGENT_SERVICE.to_string(),
            image: self.options.tunnel_agent_image.clone(),
            command: ["tunnel", "--no-autoupdate", "run"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            environment: [("TUNNEL_TOKEN".to_string(), tunnel.token.clone())]
                .into_iter()
                .collect(),
            network: self.options.network.clone(),
        };
        self.cluster
            .inject_agent_service(request.stack_file, &agent)
            .await?;
        request.ctx.check().map_err(|_| ClusterError::Aborted)?;
        self.cluster
            .deploy_stack(request.redeploy, request.ctx, on_line)
            .await?;

        tunnel.status = TunnelStatus::Active;
        self.store.save_tunnel(&tunnel).await?;
        on_line("Tunnel agent running");
        Ok(())
    }

    /// Remove routes and DNS records of an application. Failures become warnings.
    pub async fn remove_routing(
        &self,
        app_id: &ApplicationId,
        app_name: &str,
        services: &[AppService],
        diagnostics: &mut Diagnostics,
    ) {
        let routed: Vec<&AppService> = services.iter().filter(|s| s.is_routed()).collect();
        if routed.is_empty() {
            return;
        }

        let proxy = match self.cache.proxy() {
            Some(config) => Some(config),
            None => self.proxy.detect_existing().await,
        };
        match proxy {
            Some(config) => {
                if let Err(e) = self.proxy.remove_route(&config, app_id, app_name).await {
                    diagnostics.warn(Warning::cleanup_failed(format!(
                        "Failed to remove routes of {}: {}",
                        app_name, e
                    )));
                }
            }
            None => diagnostics.warn(Warning::cleanup_failed(format!(
                "No reverse proxy reachable; routes of {} were not removed",
                app_name
            ))),
        }

        if !self.dns.dns_configured() && !self.dns.tunnel_available() {
            return;
        }
        for service in routed {
            let Some(domain) = service.domain().and_then(|d| Domain::parse(d).ok()) else {
                continue;
            };
            if let Err(e) = self
                .dns
                .delete_dns_record(domain.subdomain(), domain.root())
                .await
            {
                diagnostics.warn(Warning::cleanup_failed(format!(
                    "Failed to delete DNS record {}: {}",
                    domain, e
                )));
            }
        }
    }

    /// Delete the application's tunnel remotely and drop its row.
    ///
    /// Without a stored row the tunnel is looked up by its name at the
    /// provider, so a tunnel made by another process is still removed.
    /// Returns whether a tunnel existed. Remote failures become warnings; the
    /// row is removed regardless so the next deploy creates a fresh tunnel.
    pub async fn remove_tunnel(
        &self,
        app_id: &ApplicationId,
        stack: &StackName,
        diagnostics: &mut Diagnostics,
    ) -> Result<bool, RoutingError> {
        let (tunnel_id, name) = match self.store.get_tunnel(app_id).await? {
            Some(tunnel) => (tunnel.tunnel_id, tunnel.name),
            None if self.dns.tunnel_available() => {
                let name = self.tunnel_name(stack);
                match self.dns.find_tunnel(&name).await {
                    Ok(Some(found)) => (found.id, found.name),
                    Ok(None) => return Ok(false),
                    Err(e) => {
                        diagnostics.warn(Warning::cleanup_failed(format!(
                            "Failed to look up tunnel {}: {}",
                            name, e
                        )));
                        return Ok(false);
                    }
                }
            }
            None => return Ok(false),
        };
        if let Err(e) = self.dns.delete_tunnel(&tunnel_id).await {
            diagnostics.warn(Warning::cleanup_failed(format!(
                "Failed to delete tunnel {}: {}",
                name, e
            )));
        }
        self.store.delete_tunnel(app_id).await?;
        Ok(true)
    }
}
