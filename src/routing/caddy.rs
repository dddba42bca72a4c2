// ABOUTME: Caddy reverse proxy driven through its JSON admin API.
// ABOUTME: Can start its own Caddy container on the proxy network when none is running.

use async_trait::async_trait;
use hyper::Method;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use super::http::{self, HttpError};
use super::proxy::{
    ProxyConfig, ProxyError, ReverseProxy, RouteOptions, Upstream, route_id, route_prefix,
};
use crate::process::run_capture;
use crate::types::{ApplicationId, Domain};

/// Server block name used when this tool creates the HTTP app itself.
const DEFAULT_SERVER: &str = "dockyard";
const CONTAINER_NAME: &str = "dockyard-proxy";
const DATA_VOLUME: &str = "dockyard-caddy-data";
const STARTUP_ATTEMPTS: u32 = 30;
const STARTUP_POLL: Duration = Duration::from_secs(1);

/// Settings for [`CaddyProxy`].
#[derive(Debug, Clone)]
pub struct CaddyOptions {
    pub admin_url: String,
    pub image: String,
    pub network: String,
    /// Host directory with origin certificates, mounted read-only into the proxy.
    pub cert_dir: PathBuf,
}

pub struct CaddyProxy {
    options: CaddyOptions,
}

impl CaddyProxy {
    pub fn new(options: CaddyOptions) -> Self {
        Self { options }
    }

    fn authority(&self) -> Result<String, ProxyError> {
        http::authority_of(&self.options.admin_url).map_err(|e| self.unreachable(e))
    }

    fn unreachable(&self, e: HttpError) -> ProxyError {
        ProxyError::Unreachable {
            url: self.options.admin_url.clone(),
            reason: e.to_string(),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<http::HttpResponse, ProxyError> {
        let authority = self.authority()?;
        http::send(&authority, method, path, body)
            .await
            .map_err(|e| self.unreachable(e))
    }

    /// Send a request and require a 2xx answer.
    async fn request_ok(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<http::HttpResponse, ProxyError> {
        let method_name = method.to_string();
        let resp = self.request(method, path, body).await?;
        if !resp.status.is_success() {
            return Err(ProxyError::Rejected(format!(
                "{} {} returned {}: {}",
                method_name,
                path,
                resp.status,
                resp.text().trim()
            )));
        }
        Ok(resp)
    }

    /// Pick the HTTPS server block, creating ours when the config has none.
    async fn ensure_server(&self, config: &Value) -> Result<String, ProxyError> {
        if config.is_null() {
            self.request_ok(Method::POST, "/load", Some(&base_config(&self.options, None)))
                .await?;
            return Ok(DEFAULT_SERVER.to_string());
        }

        if let Some(servers) = config
            .pointer("/apps/http/servers")
            .and_then(Value::as_object)
        {
            let https = servers.iter().find(|(_, server)| {
                server["listen"].as_array().is_some_and(|listen| {
                    listen
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|addr| addr.ends_with(":443"))
                })
            });
            if let Some((name, _)) = https.or_else(|| servers.iter().next()) {
                return Ok(name.clone());
            }
        }

        let server = server_block();
        if config.get("apps").is_none() {
            let apps = json!({ "http": { "servers": { DEFAULT_SERVER: server } } });
            self.request_ok(Method::PUT, "/config/apps", Some(&apps)).await?;
        } else if config.pointer("/apps/http").is_none() {
            let app = json!({ "servers": { DEFAULT_SERVER: server } });
            self.request_ok(Method::PUT, "/config/apps/http", Some(&app)).await?;
        } else {
            let path = format!("/config/apps/http/servers/{}", DEFAULT_SERVER);
            self.request_ok(Method::PUT, &path, Some(&server)).await?;
        }
        Ok(DEFAULT_SERVER.to_string())
    }

    async fn load_certificate(&self, id: &str, options: &RouteOptions) {
        let Some(cert) = &options.certificate else {
            return;
        };
        let entry = json!([{
            "certificate": cert.cert_path,
            "key": cert.key_path,
            "tags": [id],
        }]);
        if let Err(e) = self
            .request_ok(
                Method::POST,
                "/config/apps/tls/certificates/load_files/...",
                Some(&entry),
            )
            .await
        {
            tracing::warn!(
                "Could not load origin certificate for route {}, proxy will manage TLS: {}",
                id,
                e
            );
        }
    }
}

fn server_block() -> Value {
    json!({ "listen": [":80", ":443"], "routes": [] })
}

fn base_config(options: &CaddyOptions, admin_email: Option<&str>) -> Value {
    let admin_port = options
        .admin_url
        .rsplit(':')
        .next()
        .and_then(|p| p.trim_end_matches('/').parse::<u16>().ok())
        .unwrap_or(2019);
    let mut config = json!({
        "admin": { "listen": format!("0.0.0.0:{}", admin_port) },
        "apps": { "http": { "servers": { DEFAULT_SERVER: server_block() } } },
    });
    if let Some(email) = admin_email {
        config["apps"]["tls"] = json!({
            "automation": { "policies": [{ "issuers": [{ "module": "acme", "email": email }] }] }
        });
    }
    config
}

fn route_body(id: &str, domain: &Domain, upstream: &Upstream) -> Value {
    json!({
        "@id": id,
        "match": [{ "host": [domain.as_str()] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": upstream.dial() }],
        }],
        "terminal": true,
    })
}

#[async_trait]
impl ReverseProxy for CaddyProxy {
    async fn detect_existing(&self) -> Option<ProxyConfig> {
        let resp = match self.request(Method::GET, "/config/", None).await {
            Ok(resp) if resp.status.is_success() => resp,
            Ok(resp) => {
                tracing::debug!("Proxy admin API answered {}", resp.status);
                return None;
            }
            Err(e) => {
                tracing::debug!("No reverse proxy detected: {}", e);
                return None;
            }
        };

        let config: Value = serde_json::from_slice(&resp.body).unwrap_or(Value::Null);
        match self.ensure_server(&config).await {
            Ok(server) => {
                tracing::info!(
                    "Using reverse proxy at {} (server {})",
                    self.options.admin_url,
                    server
                );
                Some(ProxyConfig {
                    admin_url: self.options.admin_url.clone(),
                    server,
                })
            }
            Err(e) => {
                tracing::warn!("Reverse proxy found but not usable: {}", e);
                None
            }
        }
    }

    async fn add_route(
        &self,
        config: &ProxyConfig,
        app_id: &ApplicationId,
        domain: &Domain,
        upstream: &Upstream,
        options: &RouteOptions,
    ) -> Result<(), ProxyError> {
        let id = route_id(app_id, domain);

        // Replace any previous route with the same id.
        let existing = format!("/id/{}", id);
        let _ = self.request(Method::DELETE, &existing, None).await?;

        self.load_certificate(&id, options).await;

        let path = format!("/config/apps/http/servers/{}/routes", config.server);
        self.request_ok(Method::POST, &path, Some(&route_body(&id, domain, upstream)))
            .await?;
        tracing::info!("Routed {} to {}", domain, upstream.url());
        Ok(())
    }

    async fn remove_route(
        &self,
        config: &ProxyConfig,
        app_id: &ApplicationId,
        app_name: &str,
    ) -> Result<(), ProxyError> {
        let path = format!("/config/apps/http/servers/{}/routes", config.server);
        let resp = self.request_ok(Method::GET, &path, None).await?;
        let routes: Value = serde_json::from_slice(&resp.body).unwrap_or(Value::Null);

        let prefix = route_prefix(app_id);
        let ids: Vec<String> = routes
            .as_array()
            .map(|routes| {
                routes
                    .iter()
                    .filter_map(|r| r["@id"].as_str())
                    .filter(|id| id.starts_with(&prefix))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        for id in &ids {
            self.request_ok(Method::DELETE, &format!("/id/{}", id), None)
                .await?;
        }
        tracing::info!("Removed {} route(s) of {}", ids.len(), app_name);
        Ok(())
    }

    async fn start_own_instance(&self, admin_email: Option<&str>) -> Result<(), ProxyError> {
        let authority = self.authority()?;
        let admin_port = authority.rsplit(':').next().unwrap_or("2019").to_string();

        let mut rm = Command::new("docker");
        rm.args(["rm", "-f", CONTAINER_NAME]);
        let _ = run_capture(&mut rm).await;

        let cert_dir = self.options.cert_dir.display().to_string();
        let mut run = Command::new("docker");
        run.args(["run", "-d", "--name", CONTAINER_NAME, "--restart", "unless-stopped"])
            .arg("--network")
            .arg(&self.options.network)
            .args(["-p", "80:80", "-p", "443:443", "-p"])
            .arg(format!("127.0.0.1:{}:2019", admin_port))
            .args(["-e", "CADDY_ADMIN=0.0.0.0:2019", "-v"])
            .arg(format!("{}:/data", DATA_VOLUME))
            .arg("-v")
            .arg(format!("{}:{}:ro", cert_dir, cert_dir))
            .arg(&self.options.image);

        let output = run_capture(&mut run)
            .await
            .map_err(|e| ProxyError::StartFailed(e.to_string()))?;
        if !output.success {
            return Err(ProxyError::StartFailed(output.stderr.trim().to_string()));
        }
        tracing::info!("Started reverse proxy container {}", CONTAINER_NAME);

        let mut last_error = String::from("admin API never answered");
        for _ in 0..STARTUP_ATTEMPTS {
            tokio::time::sleep(STARTUP_POLL).await;
            match self.request(Method::GET, "/config/", None).await {
                Ok(resp) if resp.status.is_success() => {
                    let config = base_config(&self.options, admin_email);
                    return self
                        .request_ok(Method::POST, "/load", Some(&config))
                        .await
                        .map(|_| ());
                }
                Ok(resp) => last_error = format!("admin API answered {}", resp.status),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(ProxyError::StartFailed(last_error))
    }
}
