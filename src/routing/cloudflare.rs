// ABOUTME: Cloudflare implementation of the DNS and tunnel provider.
// ABOUTME: Talks to the v4 REST API; origin certificate CSRs are generated with openssl.

use async_trait::async_trait;
use nonempty::NonEmpty;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use super::dns::{
    CreatedTunnel, DnsError, DnsProvider, IngressRule, OriginCertificate, record_name,
};
use super::ip;
use crate::process::run_capture;
use crate::types::TunnelId;

pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Validity requested for origin certificates (15 years, the maximum).
const ORIGIN_CERT_VALIDITY_DAYS: u32 = 5475;

/// API error codes meaning the token is valid but not allowed to do this.
const PERMISSION_ERROR_CODES: &[i64] = &[9109, 10000, 10001];

#[derive(Debug, Clone)]
pub struct CloudflareOptions {
    pub api_base: String,
    pub dns_token: Option<String>,
    pub account_id: Option<String>,
    pub tunnel_token: Option<String>,
    pub ip_endpoints: Vec<String>,
    pub cert_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct TunnelResult {
    id: String,
    name: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CertificateResult {
    certificate: String,
}

pub struct CloudflareProvider {
    http: reqwest::Client,
    options: CloudflareOptions,
}

impl CloudflareProvider {
    pub fn new(options: CloudflareOptions) -> Result<Self, DnsError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DnsError::Api(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, options })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.options.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Token for zone edits: the DNS token, else the tunnel token.
    fn zone_token(&self) -> Result<&str, DnsError> {
        self.options
            .dns_token
            .as_deref()
            .or(self.options.tunnel_token.as_deref())
            .ok_or(DnsError::NotConfigured("DNS provider"))
    }

    fn tunnel_credentials(&self) -> Result<(&str, &str), DnsError> {
        match (&self.options.account_id, &self.options.tunnel_token) {
            (Some(account), Some(token)) => Ok((account.as_str(), token.as_str())),
            _ => Err(DnsError::NotConfigured("tunnel")),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        token: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<T>, DnsError> {
        let mut request = self.http.request(method, self.url(path)).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| DnsError::Api(format!("request to {} failed: {}", path, e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| DnsError::Api(format!("failed to read response: {}", e)))?;

        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DnsError::Permission(format!("{} returned {}", path, status)));
        }

        let envelope: Envelope<T> = serde_json::from_str(&text).map_err(|e| {
            DnsError::Api(format!("unexpected response from {} ({}): {}", path, status, e))
        })?;

        if !envelope.success {
            if envelope
                .errors
                .iter()
                .any(|e| PERMISSION_ERROR_CODES.contains(&e.code))
            {
                return Err(DnsError::Permission(join_messages(&envelope.errors)));
            }
            return Err(DnsError::Api(join_messages(&envelope.errors)));
        }
        Ok(envelope.result)
    }

    /// Zone holding `name`, found by trying each parent suffix, longest first.
    async fn zone_id(&self, token: &str, name: &str) -> Result<String, DnsError> {
        for candidate in zone_candidates(name) {
            let path = format!("zones?name={}", urlencoding::encode(candidate));
            let zones: Vec<Zone> = self
                .call(token, Method::GET, &path, None)
                .await?
                .unwrap_or_default();
            if let Some(zone) = zones.into_iter().next() {
                tracing::debug!("Zone of {} is {}", name, candidate);
                return Ok(zone.id);
            }
        }
        Err(DnsError::ZoneNotFound(name.to_string()))
    }

    async fn records(
        &self,
        token: &str,
        zone: &str,
        name: &str,
    ) -> Result<Vec<DnsRecord>, DnsError> {
        let path = format!("zones/{}/dns_records?name={}", zone, urlencoding::encode(name));
        Ok(self
            .call(token, Method::GET, &path, None)
            .await?
            .unwrap_or_default())
    }

    async fn run_token(&self, tunnel_id: &str) -> Result<String, DnsError> {
        let (account, token) = self.tunnel_credentials()?;
        let path = format!("accounts/{}/cfd_tunnel/{}/token", account, tunnel_id);
        self.call::<String>(token, Method::GET, &path, None)
            .await?
            .ok_or_else(|| DnsError::Api("tunnel token missing".to_string()))
    }

    /// Point `name` at `content`, replacing records of another type.
    async fn put_record(
        &self,
        subdomain: &str,
        root_domain: &str,
        kind: &str,
        content: &str,
    ) -> Result<(), DnsError> {
        let token = self.zone_token()?;
        let name = record_name(subdomain, root_domain);
        let zone = self.zone_id(token, &name).await?;
        let body = json!({
            "type": kind,
            "name": name,
            "content": content,
            "proxied": true,
            "ttl": 1,
        });

        let mut existing = None;
        for record in self.records(token, &zone, &name).await? {
            if record.kind == kind && existing.is_none() {
                existing = Some(record.id);
            } else if record.kind == "A" || record.kind == "AAAA" || record.kind == "CNAME" {
                let path = format!("zones/{}/dns_records/{}", zone, record.id);
                self.call::<Value>(token, Method::DELETE, &path, None).await?;
            }
        }

        match existing {
            Some(id) => {
                let path = format!("zones/{}/dns_records/{}", zone, id);
                self.call::<Value>(token, Method::PUT, &path, Some(&body)).await?;
            }
            None => {
                let path = format!("zones/{}/dns_records", zone);
                self.call::<Value>(token, Method::POST, &path, Some(&body)).await?;
            }
        }
        tracing::info!("{} record {} -> {}", kind, name, content);
        Ok(())
    }
}

/// `name` and each of its parents with at least two labels.
fn zone_candidates(name: &str) -> Vec<&str> {
    let mut candidates = vec![name];
    let mut rest = name;
    while let Some((_, parent)) = rest.split_once('.') {
        if !parent.contains('.') {
            break;
        }
        candidates.push(parent);
        rest = parent;
    }
    candidates
}

fn join_messages(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "request unsuccessful".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} (code {})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn dns_configured(&self) -> bool {
        self.options.dns_token.is_some()
    }

    fn tunnel_available(&self) -> bool {
        self.tunnel_credentials().is_ok()
    }

    async fn detect_public_ip(&self) -> Option<IpAddr> {
        ip::detect_public_ip(&self.options.ip_endpoints).await
    }

    async fn issue_origin_cert(&self, root_domain: &str) -> Result<OriginCertificate, DnsError> {
        let cert_path = self.options.cert_dir.join(format!("{}.pem", root_domain));
        let key_path = self.options.cert_dir.join(format!("{}.key", root_domain));
        if cert_path.exists() && key_path.exists() {
            tracing::debug!("Reusing origin certificate for {}", root_domain);
            return Ok(OriginCertificate {
                cert_path,
                key_path,
            });
        }

        let token = self
            .options
            .dns_token
            .as_deref()
            .ok_or(DnsError::NotConfigured("DNS provider"))?;

        tokio::fs::create_dir_all(&self.options.cert_dir)
            .await
            .map_err(|e| DnsError::Certificate(format!("cannot create cert dir: {}", e)))?;

        let mut openssl = Command::new("openssl");
        openssl
            .args(["req", "-new", "-newkey", "rsa:2048", "-nodes", "-keyout"])
            .arg(&key_path)
            .arg("-subj")
            .arg(format!("/CN={}", root_domain));
        let csr = run_capture(&mut openssl)
            .await
            .map_err(|e| DnsError::Certificate(e.to_string()))?;
        if !csr.success {
            return Err(DnsError::Certificate(format!(
                "CSR generation failed: {}",
                csr.stderr.trim()
            )));
        }

        let body = json!({
            "hostnames": [root_domain, format!("*.{}", root_domain)],
            "requested_validity": ORIGIN_CERT_VALIDITY_DAYS,
            "request_type": "origin-rsa",
            "csr": csr.stdout,
        });
        let issued: CertificateResult = self
            .call(token, Method::POST, "certificates", Some(&body))
            .await?
            .ok_or_else(|| DnsError::Api("certificate response had no result".to_string()))?;

        tokio::fs::write(&cert_path, issued.certificate)
            .await
            .map_err(|e| DnsError::Certificate(format!("cannot write certificate: {}", e)))?;
        tracing::info!("Issued origin certificate for {}", root_domain);

        Ok(OriginCertificate {
            cert_path,
            key_path,
        })
    }

    async fn upsert_dns_record(
        &self,
        subdomain: &str,
        root_domain: &str,
        ip: IpAddr,
    ) -> Result<(), DnsError> {
        let kind = if ip.is_ipv6() { "AAAA" } else { "A" };
        self.put_record(subdomain, root_domain, kind, &ip.to_string())
            .await
    }

    async fn delete_dns_record(&self, subdomain: &str, root_domain: &str) -> Result<(), DnsError> {
        let token = self.zone_token()?;
        let name = record_name(subdomain, root_domain);
        let zone = self.zone_id(token, &name).await?;
        for record in self.records(token, &zone, &name).await? {
            let path = format!("zones/{}/dns_records/{}", zone, record.id);
            self.call::<Value>(token, Method::DELETE, &path, None).await?;
        }
        tracing::info!("Deleted DNS records for {}", name);
        Ok(())
    }

    async fn create_tunnel(&self, name: &str) -> Result<CreatedTunnel, DnsError> {
        let (account, token) = self.tunnel_credentials()?;
        let body = json!({ "name": name, "config_src": "cloudflare" });
        let path = format!("accounts/{}/cfd_tunnel", account);
        let created: TunnelResult = self
            .call(token, Method::POST, &path, Some(&body))
            .await?
            .ok_or_else(|| DnsError::Api("tunnel response had no result".to_string()))?;

        let run_token = match created.token {
            Some(t) => t,
            None => self.run_token(&created.id).await?,
        };

        tracing::info!("Created tunnel {} ({})", created.name, created.id);
        Ok(CreatedTunnel {
            id: TunnelId::new(created.id),
            name: created.name,
            token: run_token,
        })
    }

    async fn find_tunnel(&self, name: &str) -> Result<Option<CreatedTunnel>, DnsError> {
        let (account, token) = self.tunnel_credentials()?;
        let path = format!(
            "accounts/{}/cfd_tunnel?name={}&is_deleted=false",
            account,
            urlencoding::encode(name)
        );
        let found: Vec<TunnelResult> = self
            .call(token, Method::GET, &path, None)
            .await?
            .unwrap_or_default();
        let Some(tunnel) = found.into_iter().find(|t| t.name == name) else {
            return Ok(None);
        };

        let run_token = self.run_token(&tunnel.id).await?;
        tracing::info!("Found existing tunnel {} ({})", tunnel.name, tunnel.id);
        Ok(Some(CreatedTunnel {
            id: TunnelId::new(tunnel.id),
            name: tunnel.name,
            token: run_token,
        }))
    }

    async fn configure_ingress(
        &self,
        tunnel_id: &TunnelId,
        rules: &NonEmpty<IngressRule>,
    ) -> Result<(), DnsError> {
        let (account, token) = self.tunnel_credentials()?;
        let ingress: Vec<&IngressRule> = rules.iter().collect();
        let body = json!({ "config": { "ingress": ingress } });
        let path = format!("accounts/{}/cfd_tunnel/{}/configurations", account, tunnel_id);
        self.call::<Value>(token, Method::PUT, &path, Some(&body))
            .await?;
        Ok(())
    }

    async fn create_cname(
        &self,
        subdomain: &str,
        root_domain: &str,
        tunnel_id: &TunnelId,
    ) -> Result<(), DnsError> {
        let target = format!("{}.cfargotunnel.com", tunnel_id);
        self.put_record(subdomain, root_domain, "CNAME", &target)
            .await
    }

    async fn delete_tunnel(&self, tunnel_id: &TunnelId) -> Result<(), DnsError> {
        let (account, token) = self.tunnel_credentials()?;
        let connections = format!("accounts/{}/cfd_tunnel/{}/connections", account, tunnel_id);
        if let Err(e) = self
            .call::<Value>(token, Method::DELETE, &connections, None)
            .await
        {
            tracing::debug!("Could not clean tunnel connections: {}", e);
        }

        let path = format!("accounts/{}/cfd_tunnel/{}", account, tunnel_id);
        self.call::<Value>(token, Method::DELETE, &path, None)
            .await?;
        tracing::info!("Deleted tunnel {}", tunnel_id);
        Ok(())
    }
}
