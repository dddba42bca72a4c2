// ABOUTME: Process-lifetime cache of the detected reverse proxy and public IP.
// ABOUTME: Populated lazily by the configurator and invalidated explicitly.

use parking_lot::RwLock;
use std::net::IpAddr;

use super::proxy::ProxyConfig;

/// Read-mostly routing facts shared by every deployment of a service instance.
///
/// Two early deployments may both populate an entry; the last write wins.
#[derive(Debug, Default)]
pub struct RoutingCache {
    proxy: RwLock<Option<ProxyConfig>>,
    public_ip: RwLock<Option<IpAddr>>,
}

impl RoutingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proxy(&self) -> Option<ProxyConfig> {
        self.proxy.read().clone()
    }

    pub fn set_proxy(&self, config: ProxyConfig) {
        *self.proxy.write() = Some(config);
    }

    /// Forget the proxy, e.g. after its instance was torn down.
    pub fn invalidate_proxy(&self) {
        *self.proxy.write() = None;
    }

    pub fn public_ip(&self) -> Option<IpAddr> {
        *self.public_ip.read()
    }

    pub fn set_public_ip(&self, ip: IpAddr) {
        *self.public_ip.write() = Some(ip);
    }

    pub fn invalidate_public_ip(&self) {
        *self.public_ip.write() = None;
    }
}
