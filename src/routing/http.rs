// ABOUTME: Minimal HTTP/1 client over a plain TCP connection.
// ABOUTME: Used for the proxy admin API and public IP lookups.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("connection to {authority} failed: {reason}")]
    Connect { authority: String, reason: String },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// Response status and fully collected body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Split an `http://host:port` base URL into its authority.
pub fn authority_of(base_url: &str) -> Result<String, HttpError> {
    let uri: Uri = base_url
        .parse()
        .map_err(|_| HttpError::InvalidUrl(base_url.to_string()))?;
    if uri.scheme_str().is_some_and(|s| s != "http") {
        return Err(HttpError::InvalidUrl(base_url.to_string()));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| HttpError::InvalidUrl(base_url.to_string()))?;
    Ok(match authority.port_u16() {
        Some(_) => authority.to_string(),
        None => format!("{}:80", authority.host()),
    })
}

/// Send one request and collect the response.
pub async fn send(
    authority: &str,
    method: Method,
    path: &str,
    json_body: Option<&serde_json::Value>,
) -> Result<HttpResponse, HttpError> {
    tokio::time::timeout(REQUEST_TIMEOUT, send_inner(authority, method, path, json_body))
        .await
        .map_err(|_| HttpError::Timeout(format!("{}{}", authority, path)))?
}

async fn send_inner(
    authority: &str,
    method: Method,
    path: &str,
    json_body: Option<&serde_json::Value>,
) -> Result<HttpResponse, HttpError> {
    let stream = TcpStream::connect(authority)
        .await
        .map_err(|e| HttpError::Connect {
            authority: authority.to_string(),
            reason: e.to_string(),
        })?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| HttpError::Connect {
            authority: authority.to_string(),
            reason: format!("HTTP handshake failed: {}", e),
        })?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("HTTP connection error: {}", e);
        }
    });

    let host = authority.split(':').next().unwrap_or(authority);
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("Host", host)
        .header("User-Agent", concat!("dockyard/", env!("CARGO_PKG_VERSION")));

    let body = match json_body {
        Some(value) => {
            builder = builder.header("Content-Type", "application/json");
            Full::new(Bytes::from(value.to_string()))
        }
        None => Full::new(Bytes::new()),
    };

    let req = builder
        .body(body)
        .map_err(|e| HttpError::Request(format!("failed to build request: {}", e)))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| HttpError::Request(e.to_string()))?;

    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| HttpError::Request(format!("failed to read response: {}", e)))?
        .to_bytes();

    Ok(HttpResponse { status, body })
}
