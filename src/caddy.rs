//! Client for Caddy's JSON admin API
//!
//! Routes owned by the console carry an `@id` of the form
//! `caddy-ui-<record id>` so they can be addressed through `/id/...` and told
//! apart from routes configured by other means.

use crate::config::CaddySettings;
use crate::db::ProxyConfigRecord;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use std::net::Ipv6Addr;
use std::time::Duration;
use tracing::{debug, warn};

/// Prefix of the `@id` of every route managed by the console
pub const ROUTE_ID_PREFIX: &str = "caddy-ui-";

#[derive(Debug, thiserror::Error)]
pub enum CaddyError {
    #[error("Caddy admin API unreachable: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Caddy admin API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid response from Caddy admin API: {0}")]
    Decode(String),
}

impl CaddyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CaddyError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Route `@id` for a record
pub fn route_id(config_id: &str) -> String {
    format!("{}{}", ROUTE_ID_PREFIX, config_id)
}

/// Whether a live route was created by the console
pub fn is_managed_route(route: &Value) -> bool {
    route
        .get("@id")
        .and_then(Value::as_str)
        .map(|id| id.starts_with(ROUTE_ID_PREFIX))
        .unwrap_or(false)
}

/// Upstream address for a target, plus whether it needs TLS to the backend.
///
/// Accepts `http(s)://host[:port][/...]` or a bare `host:port`.
pub fn upstream_dial(target_url: &str) -> Option<(String, bool)> {
    let target = target_url.trim();
    if !target.contains("://") {
        let (host, port) = target.rsplit_once(':')?;
        if !is_dial_host(host) || port.parse::<u16>().is_err() {
            return None;
        }
        return Some((target.to_string(), false));
    }

    let url = Url::parse(target).ok()?;
    let tls = match url.scheme() {
        "http" => false,
        "https" => true,
        _ => return None,
    };
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;

    // IPv6 literals keep their brackets in host_str
    Some((format!("{}:{}", host, port), tls))
}

/// Host part of a bare `host:port`; IPv6 literals must be bracketed
fn is_dial_host(host: &str) -> bool {
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return inner.parse::<Ipv6Addr>().is_ok();
    }
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Build the Caddy route for a record: host matcher, optional path prefix
/// with a wildcard suffix, and a single reverse-proxy upstream.
pub fn build_route(config: &ProxyConfigRecord) -> Option<Value> {
    let (dial, tls) = upstream_dial(&config.target_url)?;

    let mut matcher = json!({ "host": [config.domain] });
    if let Some(path) = config.path.as_deref().filter(|p| !p.is_empty() && *p != "/") {
        let prefix = path.trim_end_matches('*');
        matcher["path"] = json!([format!("{}*", prefix)]);
    }

    let mut handler = json!({
        "handler": "reverse_proxy",
        "upstreams": [{ "dial": dial }],
    });
    if tls {
        handler["transport"] = json!({ "protocol": "http", "tls": {} });
    }

    Some(json!({
        "@id": route_id(&config.id),
        "match": [matcher],
        "handle": [handler],
        "terminal": true,
    }))
}

#[derive(Clone)]
pub struct CaddyClient {
    base_url: String,
    server_name: String,
    http_client: reqwest::Client,
}

impl CaddyClient {
    pub fn new(base_url: &str, server_name: &str, timeout: Duration) -> Result<Self, CaddyError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            server_name: server_name.to_string(),
            http_client,
        })
    }

    pub fn from_settings(settings: &CaddySettings) -> Result<Self, CaddyError> {
        Self::new(&settings.admin_url, &settings.server_name, settings.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Config path of the managed server's route list
    pub fn routes_path(&self) -> String {
        format!("apps/http/servers/{}/routes", self.server_name)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, CaddyError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(%method, %url, "Caddy admin request");

        let mut request = self.http_client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            warn!(%method, %url, %status, body = %text, "Caddy admin API error");
            return Err(CaddyError::Status { status, body: text });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| CaddyError::Decode(e.to_string()))
    }

    /// Full running config (`null` when Caddy has none)
    pub async fn get_caddy_config(&self) -> Result<Value, CaddyError> {
        self.send(Method::GET, "config/", None).await
    }

    /// Config value at a path below `/config/`
    pub async fn get_config_path(&self, path: &str) -> Result<Value, CaddyError> {
        self.send(Method::GET, &format!("config/{}", path.trim_start_matches('/')), None)
            .await
    }

    /// Replace the existing value at a config path
    pub async fn update_caddy_config(&self, path: &str, value: &Value) -> Result<(), CaddyError> {
        self.send(Method::PATCH, &format!("config/{}", path.trim_start_matches('/')), Some(value))
            .await
            .map(|_| ())
    }

    /// Replace the whole running config
    pub async fn replace_caddy_config(&self, config: &Value) -> Result<(), CaddyError> {
        self.send(Method::POST, "load", Some(config)).await.map(|_| ())
    }

    /// Append a route for the record to the managed server
    pub async fn add_reverse_proxy(&self, config: &ProxyConfigRecord) -> Result<(), CaddyError> {
        let route = build_route(config).ok_or_else(|| {
            CaddyError::Decode(format!("target '{}' has no usable dial address", config.target_url))
        })?;

        self.send(Method::POST, &format!("config/{}", self.routes_path()), Some(&route))
            .await
            .map(|_| ())
    }

    /// Delete the record's route; a route that is already gone is not an error
    pub async fn remove_reverse_proxy(&self, config_id: &str) -> Result<(), CaddyError> {
        let path = format!("id/{}", urlencoding::encode(&route_id(config_id)));
        match self.send(Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(config_id, "Route already absent from Caddy");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
