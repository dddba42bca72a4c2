// ABOUTME: Settings snapshot for dockyard.yml and application manifests.
// ABOUTME: Handles YAML parsing, secret interpolation, discovery and collaborator options.

mod env_value;
mod manifest;
mod stop;

pub use env_value::{EnvValue, resolve_env_map};
pub use manifest::{AppManifest, ManifestApp, ManifestRepository, ManifestService};
pub use stop::StopSettings;

use crate::cluster::SwarmOptions;
use crate::deploy::PipelineOptions;
use crate::error::{Error, Result};
use crate::routing::{
    CaddyOptions, CloudflareOptions, DEFAULT_API_BASE, DEFAULT_IP_ENDPOINTS, RoutingOptions,
};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "dockyard.yml";
pub const CONFIG_FILENAME_ALT: &str = "dockyard.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".dockyard/config.yml";

/// Process-wide settings read once at startup.
///
/// Every field has a default, so an empty file (or no file at all, see
/// [`Settings::discover_or_default`]) yields a usable configuration without
/// DNS or tunnel credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Overlay network shared by every stack and the reverse proxy.
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default = "default_stack_dir")]
    pub stack_dir: PathBuf,

    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub health_timeout: Duration,

    #[serde(default = "default_health_poll_interval", with = "humantime_serde")]
    pub health_poll_interval: Duration,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub dns: Option<DnsSettings>,

    #[serde(default)]
    pub tunnel: Option<TunnelSettings>,

    #[serde(default)]
    pub stop: StopSettings,

    #[serde(default)]
    pub ports: PortSettings,

    #[serde(default = "default_ip_endpoints")]
    pub ip_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySettings {
    #[serde(default = "default_admin_url")]
    pub admin_url: String,
    /// ACME account email for a proxy instance we start ourselves.
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default = "default_proxy_image")]
    pub image: String,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            admin_email: None,
            image: default_proxy_image(),
            cert_dir: default_cert_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSettings {
    pub api_token: EnvValue,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSettings {
    pub account_id: String,
    pub api_token: EnvValue,
    #[serde(default = "default_agent_image")]
    pub agent_image: String,
}

/// Host-port range used when conflicting ports are reassigned.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSettings {
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    #[serde(default = "default_range_end")]
    pub range_end: u16,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
        }
    }
}

fn default_network() -> String {
    "dockyard".to_string()
}

fn default_stack_dir() -> PathBuf {
    PathBuf::from(".dockyard/stacks")
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_health_poll_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_admin_url() -> String {
    "http://127.0.0.1:2019".to_string()
}

fn default_proxy_image() -> String {
    "caddy:2".to_string()
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/var/lib/dockyard/certs")
}

fn default_agent_image() -> String {
    "cloudflare/cloudflared:latest".to_string()
}

fn default_range_start() -> u16 {
    10000
}

fn default_range_end() -> u16 {
    20000
}

fn default_ip_endpoints() -> Vec<String> {
    DEFAULT_IP_ENDPOINTS.iter().map(|s| s.to_string()).collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: default_network(),
            stack_dir: default_stack_dir(),
            health_timeout: default_health_timeout(),
            health_poll_interval: default_health_poll_interval(),
            proxy: ProxySettings::default(),
            dns: None,
            tunnel: None,
            stop: StopSettings::default(),
            ports: PortSettings::default(),
            ip_endpoints: default_ip_endpoints(),
        }
    }
}

impl Settings {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty map.
        let settings: Settings = if yaml.trim().is_empty() {
            Settings::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        match Self::find(dir) {
            Some(path) => Self::load(&path),
            None => Err(Error::ConfigNotFound(dir.to_path_buf())),
        }
    }

    /// Like [`discover`](Self::discover), but a missing file yields defaults.
    pub fn discover_or_default(dir: &Path) -> Result<Self> {
        match Self::find(dir) {
            Some(path) => Self::load(&path),
            None => {
                tracing::debug!(dir = %dir.display(), "No settings file, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn find(dir: &Path) -> Option<PathBuf> {
        [CONFIG_FILENAME, CONFIG_FILENAME_ALT, CONFIG_FILENAME_DIR]
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    fn validate(&self) -> Result<()> {
        if self.ports.range_start == 0 || self.ports.range_start > self.ports.range_end {
            return Err(Error::InvalidConfig(format!(
                "ports.range_start ({}) must be between 1 and ports.range_end ({})",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.network.trim().is_empty() {
            return Err(Error::InvalidConfig("network cannot be empty".to_string()));
        }
        if self.health_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "health_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.ports.range_start..=self.ports.range_end
    }

    /// DNS provider token, if configured and resolvable.
    pub fn dns_token(&self) -> Option<String> {
        self.dns.as_ref().and_then(|d| d.api_token.resolve_optional())
    }

    /// Tunnel account id and token, if both are available.
    pub fn tunnel_credentials(&self) -> Option<(String, String)> {
        let tunnel = self.tunnel.as_ref()?;
        let token = tunnel.api_token.resolve_optional()?;
        let account = tunnel.account_id.trim();
        if account.is_empty() {
            return None;
        }
        Some((account.to_string(), token))
    }

    pub fn swarm_options(&self) -> SwarmOptions {
        SwarmOptions {
            stack_dir: self.stack_dir.clone(),
            poll_interval: self.health_poll_interval,
            port_range: self.port_range(),
        }
    }

    pub fn caddy_options(&self) -> CaddyOptions {
        CaddyOptions {
            admin_url: self.proxy.admin_url.clone(),
            image: self.proxy.image.clone(),
            network: self.network.clone(),
            cert_dir: self.proxy.cert_dir.clone(),
        }
    }

    pub fn cloudflare_options(&self) -> CloudflareOptions {
        let (account_id, tunnel_token) = match self.tunnel_credentials() {
            Some((account, token)) => (Some(account), Some(token)),
            None => (None, None),
        };
        CloudflareOptions {
            api_base: self
                .dns
                .as_ref()
                .and_then(|d| d.api_base.clone())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            dns_token: self.dns_token(),
            account_id,
            tunnel_token,
            ip_endpoints: self.ip_endpoints.clone(),
            cert_dir: self.proxy.cert_dir.clone(),
        }
    }

    pub fn routing_options(&self) -> RoutingOptions {
        RoutingOptions {
            network: self.network.clone(),
            admin_email: self.proxy.admin_email.clone(),
            tunnel_agent_image: self
                .tunnel
                .as_ref()
                .map(|t| t.agent_image.clone())
                .unwrap_or_else(default_agent_image),
            host_name: host_label(),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            network: self.network.clone(),
            health_timeout: self.health_timeout,
            preserve_routing: self.stop.preserve_routing,
            routing: self.routing_options(),
        }
    }
}

/// This machine's host name reduced to a DNS-safe label.
fn host_label() -> String {
    let raw = gethostname::gethostname().to_string_lossy().to_lowercase();
    let label: String = raw
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "host".to_string()
    } else {
        label.to_string()
    }
}
