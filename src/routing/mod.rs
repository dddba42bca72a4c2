// ABOUTME: External routing for deployed stacks: reverse proxy, DNS records and tunnels.
// ABOUTME: The configurator picks DNS or tunnel exposure per service.

mod cache;
mod caddy;
mod cloudflare;
mod configurator;
mod dns;
mod http;
mod ip;
mod proxy;

pub use cache::RoutingCache;
pub use caddy::{CaddyOptions, CaddyProxy};
pub use cloudflare::{CloudflareOptions, CloudflareProvider, DEFAULT_API_BASE};
pub use configurator::{
    Exposure, RoutingConfigurator, RoutingError, RoutingOptions, RoutingRequest,
    TUNNEL_AGENT_SERVICE, plan_exposures,
};
pub use dns::{
    CATCH_ALL_SERVICE, CreatedTunnel, DnsError, DnsProvider, IngressRule, OriginCertificate,
    ingress_rules, record_name,
};
pub use ip::{DEFAULT_IP_ENDPOINTS, detect_public_ip};
pub use proxy::{
    CertificateFiles, ProxyConfig, ProxyError, ReverseProxy, RouteOptions, Upstream, route_id,
    route_prefix,
};
