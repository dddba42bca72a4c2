// ABOUTME: Public IP detection against plain-HTTP echo services.
// ABOUTME: Endpoints are tried in order until one returns a parseable address.

use hyper::Method;
use std::net::IpAddr;

use super::http;

/// Echo services answering with the caller's address as plain text.
pub const DEFAULT_IP_ENDPOINTS: &[&str] = &[
    "http://api.ipify.org/",
    "http://ifconfig.me/ip",
    "http://icanhazip.com/",
];

pub async fn detect_public_ip(endpoints: &[String]) -> Option<IpAddr> {
    for endpoint in endpoints {
        match fetch_ip(endpoint).await {
            Ok(ip) => {
                tracing::info!("Detected public IP {} via {}", ip, endpoint);
                return Some(ip);
            }
            Err(reason) => tracing::debug!("IP lookup via {} failed: {}", endpoint, reason),
        }
    }
    tracing::warn!("Could not detect public IP from any endpoint");
    None
}

async fn fetch_ip(endpoint: &str) -> Result<IpAddr, String> {
    let authority = http::authority_of(endpoint).map_err(|e| e.to_string())?;
    let path = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("/");

    let resp = http::send(&authority, Method::GET, path, None)
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status.is_success() {
        return Err(format!("status {}", resp.status));
    }
    parse_ip(&resp.text())
}

fn parse_ip(body: &str) -> Result<IpAddr, String> {
    body.trim()
        .parse()
        .map_err(|_| format!("not an IP address: {:?}", body.trim()))
}
