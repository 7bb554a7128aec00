//! Console HTTP server
//!
//! Serves the embedded dashboard and the JSON API it talks to: first-run
//! setup, login, proxy config CRUD, password change and Caddy sync control.

use crate::auth::{AuthManager, LoginRequest, Session};
use crate::caddy::upstream_dial;
use crate::dashboard;
use crate::db::{is_unique_violation, now_timestamp, Database, ProxyConfigRecord, ProxyConfigUpdate, UserRecord};
use crate::error::{json_error_response, ApiErrorCode, ErrorResponse};
use crate::sync::{Reconciler, SyncError};
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Id of the starter config created by the setup wizard
pub const SAMPLE_CONFIG_ID: &str = "sample-config";

/// Minimum password length when none is configured
pub const DEFAULT_MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetupRequest {
    name: String,
    email: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ConfigRequest {
    name: String,
    domain: String,
    target_url: String,
    path: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupStatus {
    setup_required: bool,
    timestamp: String,
}

/// Console server: API plus dashboard
pub struct ConsoleServer {
    bind_addr: SocketAddr,
    db: Arc<Database>,
    auth: AuthManager,
    reconciler: Arc<Reconciler>,
    min_password_length: usize,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConsoleServer {
    pub fn new(
        bind_addr: SocketAddr,
        db: Arc<Database>,
        auth: AuthManager,
        reconciler: Arc<Reconciler>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            db,
            auth,
            reconciler,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            tls_acceptor: None,
            shutdown_rx,
        }
    }

    pub fn with_min_password_length(mut self, length: usize) -> Self {
        self.min_password_length = length;
        self
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(addr = %addr, protocol, "Console server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Some(acceptor) = server.tls_acceptor.clone() {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = server.serve_connection(tls_stream, addr).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = server.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Console server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let server = Arc::clone(&self);
            async move { server.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();

        let response = self.dispatch(&parts.method, parts.uri.path(), &parts.headers, body).await;

        Ok(response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            json_error_response(ApiErrorCode::InternalError, format!("Internal error: {}", e))
        }))
    }

    /// Route a request that has been read in full
    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>> {
        debug!(%method, %path, "Request");

        // Public endpoints
        match (method, path) {
            (&Method::GET, "/health") => return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
            (&Method::GET, "/version") => {
                let version = json!({ "name": PKG_NAME, "version": VERSION });
                return Ok(json_response(StatusCode::OK, version.to_string()));
            }
            (&Method::GET, "/assets/style.css") => return Ok(dashboard::serve_css()),
            (&Method::GET, "/assets/app.js") => return Ok(dashboard::serve_js()),
            (&Method::GET, path) if dashboard::is_page_route(path) => return Ok(dashboard::serve_dashboard()),
            (&Method::GET, "/api/setup/status") => return self.setup_status(),
            (&Method::POST, "/api/setup/complete") => return self.complete_setup(&body).await,
            (&Method::POST, "/api/auth/login") => return self.login(&body).await,
            (&Method::POST, "/api/auth/logout") => return self.logout(),
            _ => {}
        }

        if !path.starts_with("/api/") {
            return Ok(json_error_response(ApiErrorCode::NotFound, "Not found"));
        }

        // Everything else needs a session
        let Some(session) = self.session(headers) else {
            warn!(%method, %path, "Unauthorized API request");
            return Ok(json_error_response(ApiErrorCode::Unauthorized, "Unauthorized"));
        };

        match (method, path) {
            (&Method::GET, "/api/auth/session") => json_ok(StatusCode::OK, &session),

            (&Method::GET, "/api/configs") => self.list_configs(),
            (&Method::POST, "/api/configs") => self.create_config(&session, &body).await,
            (method, path) if path.starts_with("/api/configs/") => {
                let rest = &path["/api/configs/".len()..];
                match (method, rest.strip_suffix("/sync")) {
                    (&Method::POST, Some(id)) if !id.is_empty() && !id.contains('/') => {
                        self.sync_config(&session, &decode_id(id)).await
                    }
                    (_, _) if rest.is_empty() || rest.contains('/') => {
                        Ok(json_error_response(ApiErrorCode::NotFound, "Not found"))
                    }
                    (&Method::GET, _) => self.get_config(&decode_id(rest)),
                    (&Method::PUT, _) => self.update_config(&session, &decode_id(rest), &body).await,
                    (&Method::DELETE, _) => self.delete_config(&session, &decode_id(rest)).await,
                    _ => Ok(json_error_response(ApiErrorCode::NotFound, "Not found")),
                }
            }

            (&Method::POST, "/api/user/change-password") => self.change_password(&session, &body).await,

            (&Method::GET, "/api/caddy/status") => self.caddy_status(),
            (&Method::POST, "/api/caddy/reconcile") => self.reconcile(&session).await,
            (&Method::GET, "/api/caddy/config") => self.caddy_config(&session).await,

            _ => Ok(json_error_response(ApiErrorCode::NotFound, "Not found")),
        }
    }

    fn session(&self, headers: &HeaderMap) -> Option<Session> {
        let cookie = headers.get(COOKIE).and_then(|v| v.to_str().ok());
        let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        self.auth.session_from_headers(cookie, authorization)
    }

    // ==================== Setup ====================

    fn setup_status(&self) -> Result<Response<Full<Bytes>>> {
        let status = SetupStatus {
            setup_required: self.db.count_users()? == 0,
            timestamp: now_timestamp(),
        };
        json_ok(StatusCode::OK, &status)
    }

    async fn complete_setup(&self, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        if self.db.count_users()? > 0 {
            return Ok(json_error_response(ApiErrorCode::SetupCompleted, "Setup has already been completed"));
        }

        let req: SetupRequest = match parse_body(body) {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };
        let name = req.name.trim();
        let email = req.email.trim();

        if name.is_empty() || email.is_empty() || req.password.is_empty() {
            return Ok(json_error_response(ApiErrorCode::MissingFields, "Name, email and password are required"));
        }
        if !is_valid_email(email) {
            return Ok(json_error_response(ApiErrorCode::InvalidInput, "Invalid email address"));
        }
        if req.password.chars().count() < self.min_password_length {
            return Ok(json_error_response(
                ApiErrorCode::InvalidInput,
                format!("Password must be at least {} characters long", self.min_password_length),
            ));
        }

        let hash = self.auth.hash_password(&req.password).await?;
        let admin = UserRecord::new(Some(name.to_string()), email, hash, true);
        let sample = ProxyConfigRecord::with_id(
            SAMPLE_CONFIG_ID.to_string(),
            ProxyConfigUpdate {
                name: "Example Website".to_string(),
                domain: "example.com".to_string(),
                target_url: "http://localhost:3000".to_string(),
                path: None,
                enabled: true,
            },
            &admin.id,
        );

        match self.db.complete_setup(&admin, &sample) {
            Ok(true) => {}
            Ok(false) => {
                return Ok(json_error_response(ApiErrorCode::SetupCompleted, "Setup has already been completed"));
            }
            Err(e) if is_unique_violation(&e) => {
                return Ok(json_error_response(ApiErrorCode::EmailInUse, "Email is already in use"));
            }
            Err(e) => return Err(e),
        }

        info!(user_id = %admin.id, email = %admin.email, "Setup completed, admin user created");

        // The sample route is pushed best effort; the background loop retries
        if let Err(e) = self.reconciler.sync_after_change(SAMPLE_CONFIG_ID).await {
            warn!(error = %e, "Initial sync of sample config failed");
        }

        json_ok(
            StatusCode::OK,
            &json!({ "success": true, "message": "Setup completed successfully" }),
        )
    }

    // ==================== Auth ====================

    async fn login(&self, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        let req: LoginRequest = match parse_body(body) {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };

        let user = match self.db.get_user_by_email(req.email.trim())? {
            Some(user) if !req.password.is_empty() => user,
            _ => {
                warn!(email = %req.email, "Login failed");
                return Ok(json_error_response(ApiErrorCode::InvalidCredentials, "Invalid credentials"));
            }
        };

        if !self.auth.verify_password(&req.password, &user.password_hash).await? {
            warn!(email = %req.email, "Login failed");
            return Ok(json_error_response(ApiErrorCode::InvalidCredentials, "Invalid credentials"));
        }

        let session = Session::from(&user);
        let token = self.auth.create_token(&session)?;
        info!(user_id = %session.user_id, "User logged in");

        let mut response = json_ok(StatusCode::OK, &session)?;
        response
            .headers_mut()
            .insert(SET_COOKIE, self.auth.create_session_cookie(&token).parse()?);
        Ok(response)
    }

    fn logout(&self) -> Result<Response<Full<Bytes>>> {
        let mut response = json_ok(StatusCode::OK, &json!({ "success": true }))?;
        response
            .headers_mut()
            .insert(SET_COOKIE, self.auth.create_logout_cookie().parse()?);
        Ok(response)
    }

    async fn change_password(&self, session: &Session, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        let req: ChangePasswordRequest = match parse_body(body) {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };

        if req.current_password.is_empty() || req.new_password.is_empty() {
            return Ok(json_error_response(
                ApiErrorCode::MissingFields,
                "Current password and new password are required",
            ));
        }
        if req.new_password.chars().count() < self.min_password_length {
            return Ok(json_error_response(
                ApiErrorCode::InvalidInput,
                format!("New password must be at least {} characters long", self.min_password_length),
            ));
        }

        let Some(user) = self.db.get_user(&session.user_id)? else {
            return Ok(json_error_response(ApiErrorCode::NotFound, "User not found"));
        };

        if !self.auth.verify_password(&req.current_password, &user.password_hash).await? {
            return Ok(json_error_response(ApiErrorCode::InvalidInput, "Current password is incorrect"));
        }

        let hash = self.auth.hash_password(&req.new_password).await?;
        if !self.db.update_user_password(&user.id, &hash)? {
            return Ok(json_error_response(ApiErrorCode::NotFound, "User not found"));
        }

        info!(user_id = %user.id, "Password changed");
        json_ok(StatusCode::OK, &json!({ "success": true }))
    }

    // ==================== Proxy Configs ====================

    fn list_configs(&self) -> Result<Response<Full<Bytes>>> {
        let configs = self.db.list_proxy_configs_with_creator()?;
        json_ok(StatusCode::OK, &configs)
    }

    fn get_config(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        match self.db.get_proxy_config_with_creator(id)? {
            Some(config) => json_ok(StatusCode::OK, &config),
            None => Ok(json_error_response(ApiErrorCode::NotFound, "Config not found")),
        }
    }

    async fn create_config(&self, session: &Session, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        let update = match parse_config_request(body) {
            Ok(update) => update,
            Err(response) => return Ok(response),
        };

        let record = ProxyConfigRecord::new(update, &session.user_id);
        self.db.create_proxy_config(&record)?;
        info!(id = %record.id, domain = %record.domain, user_id = %session.user_id, "Proxy config created");

        self.respond_after_sync(&record.id, StatusCode::CREATED).await
    }

    async fn update_config(&self, session: &Session, id: &str, body: &Bytes) -> Result<Response<Full<Bytes>>> {
        // Body checks come before lookup and ownership
        let update = match parse_config_request(body) {
            Ok(update) => update,
            Err(response) => return Ok(response),
        };

        let Some(existing) = self.db.get_proxy_config(id)? else {
            return Ok(json_error_response(ApiErrorCode::NotFound, "Config not found"));
        };
        if !session.can_modify(&existing) {
            warn!(id, user_id = %session.user_id, "Forbidden config update");
            return Ok(json_error_response(ApiErrorCode::Forbidden, "Forbidden"));
        }

        if !self.db.update_proxy_config(id, &update)? {
            return Ok(json_error_response(ApiErrorCode::NotFound, "Config not found"));
        }
        info!(id, domain = %update.domain, enabled = update.enabled, "Proxy config updated");

        self.respond_after_sync(id, StatusCode::OK).await
    }

    async fn delete_config(&self, session: &Session, id: &str) -> Result<Response<Full<Bytes>>> {
        let Some(existing) = self.db.get_proxy_config(id)? else {
            return Ok(json_error_response(ApiErrorCode::NotFound, "Config not found"));
        };
        if !session.can_modify(&existing) {
            warn!(id, user_id = %session.user_id, "Forbidden config delete");
            return Ok(json_error_response(ApiErrorCode::Forbidden, "Forbidden"));
        }

        self.db.delete_proxy_config(id)?;
        info!(id, domain = %existing.domain, "Proxy config deleted");

        match self.reconciler.sync_after_change(id).await {
            Ok(_) => Ok(empty_response(StatusCode::NO_CONTENT)),
            Err(e) => Ok(sync_error_response(e, json!({ "id": id }))),
        }
    }

    async fn sync_config(&self, session: &Session, id: &str) -> Result<Response<Full<Bytes>>> {
        let Some(existing) = self.db.get_proxy_config(id)? else {
            return Ok(json_error_response(ApiErrorCode::NotFound, "Config not found"));
        };
        if !session.can_modify(&existing) {
            return Ok(json_error_response(ApiErrorCode::Forbidden, "Forbidden"));
        }

        self.respond_after_sync(id, StatusCode::OK).await
    }

    /// Reconcile after a write and answer with the stored record, or with a
    /// sync error that still carries it
    async fn respond_after_sync(&self, id: &str, status: StatusCode) -> Result<Response<Full<Bytes>>> {
        let outcome = self.reconciler.sync_after_change(id).await;

        let Some(record) = self.db.get_proxy_config_with_creator(id)? else {
            return Ok(json_error_response(ApiErrorCode::NotFound, "Config not found"));
        };

        match outcome {
            Ok(_) => json_ok(status, &record),
            Err(e) => Ok(sync_error_response(e, json!({ "config": record }))),
        }
    }

    // ==================== Caddy ====================

    fn caddy_status(&self) -> Result<Response<Full<Bytes>>> {
        let counts = self.db.count_by_sync_status()?;
        json_ok(
            StatusCode::OK,
            &json!({
                "syncEnabled": self.reconciler.is_enabled(),
                "adminUrl": self.reconciler.caddy().base_url(),
                "server": self.reconciler.caddy().server_name(),
                "configs": counts,
            }),
        )
    }

    async fn reconcile(&self, session: &Session) -> Result<Response<Full<Bytes>>> {
        if !session.is_admin {
            return Ok(json_error_response(ApiErrorCode::Forbidden, "Forbidden"));
        }

        match self.reconciler.reconcile().await {
            Ok(report) => json_ok(StatusCode::OK, &report),
            Err(SyncError::Database(e)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Manual reconcile failed");
                Ok(json_error_response(ApiErrorCode::CaddyUnavailable, e.to_string()))
            }
        }
    }

    async fn caddy_config(&self, session: &Session) -> Result<Response<Full<Bytes>>> {
        if !session.is_admin {
            return Ok(json_error_response(ApiErrorCode::Forbidden, "Forbidden"));
        }

        match self.reconciler.caddy().get_caddy_config().await {
            Ok(config) => json_ok(StatusCode::OK, &config),
            Err(e) => {
                warn!(error = %e, "Failed to read Caddy config");
                Ok(json_error_response(ApiErrorCode::CaddyUnavailable, e.to_string()))
            }
        }
    }
}

// ==================== Validation ====================

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"))
}

fn domain_regex() -> &'static Regex {
    static DOMAIN: OnceLock<Regex> = OnceLock::new();
    DOMAIN.get_or_init(|| {
        Regex::new(r"^(\*\.)?[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
            .expect("valid domain regex")
    })
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    email_regex().is_match(email)
}

pub(crate) fn is_valid_domain(domain: &str) -> bool {
    domain.len() <= 253 && domain_regex().is_match(domain)
}

pub(crate) fn is_valid_target(target: &str) -> bool {
    !target.chars().any(char::is_whitespace) && upstream_dial(target).is_some()
}

/// Presence and format checks shared by create and update
fn parse_config_request(body: &Bytes) -> Result<ProxyConfigUpdate, Response<Full<Bytes>>> {
    let req: ConfigRequest = parse_body(body)?;

    let name = req.name.trim();
    let domain = req.domain.trim();
    let target_url = req.target_url.trim();
    if name.is_empty() || domain.is_empty() || target_url.is_empty() {
        return Err(json_error_response(
            ApiErrorCode::MissingFields,
            "Name, domain and target URL are required",
        ));
    }

    if !is_valid_domain(domain) {
        return Err(json_error_response(
            ApiErrorCode::InvalidInput,
            "Domain must be a host name without scheme or path",
        ));
    }
    if !is_valid_target(target_url) {
        return Err(json_error_response(
            ApiErrorCode::InvalidInput,
            "Target URL must be an http(s) URL or host:port",
        ));
    }

    let path = req.path.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
    if let Some(p) = &path {
        if !p.starts_with('/') || p.chars().any(char::is_whitespace) {
            return Err(json_error_response(ApiErrorCode::InvalidInput, "Path must start with /"));
        }
    }

    Ok(ProxyConfigUpdate {
        name: name.to_string(),
        domain: domain.to_string(),
        target_url: target_url.to_string(),
        path,
        enabled: req.enabled.unwrap_or(true),
    })
}

// ==================== Helper Functions ====================

/// Decode a JSON body; an empty body counts as `{}`
fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response<Full<Bytes>>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| json_error_response(ApiErrorCode::InvalidInput, format!("Invalid JSON: {}", e)))
}

fn decode_id(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn sync_error_response(err: SyncError, details: serde_json::Value) -> Response<Full<Bytes>> {
    let code = match err {
        SyncError::Database(_) => ApiErrorCode::InternalError,
        _ => ApiErrorCode::CaddySyncFailed,
    };
    ErrorResponse::new(code, format!("Change saved but Caddy sync failed: {}", err))
        .with_details(details)
        .into_response()
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn json_ok<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(status, serde_json::to_vec(value)?))
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::caddy::CaddyClient;
    use crate::error::ERROR_CODE_HEADER;
    use serde_json::Value;
    use std::time::Duration;

    fn test_server() -> ConsoleServer {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let auth = AuthManager::new(AuthConfig {
            secret: "test-secret".to_string(),
            bcrypt_cost: 4,
            ..Default::default()
        });
        let caddy = CaddyClient::new("http://127.0.0.1:1", "srv0", Duration::from_millis(200)).unwrap();
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&db), caddy, vec![":80".to_string()], false));
        let (_tx, rx) = watch::channel(false);
        ConsoleServer::new("127.0.0.1:0".parse().unwrap(), db, auth, reconciler, rx)
    }

    async fn call(
        server: &ConsoleServer,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Value,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(AUTHORIZATION, format!("Bearer {}", token).parse().unwrap());
        }
        let body = if body.is_null() { Bytes::new() } else { Bytes::from(body.to_string()) };

        let response = server.dispatch(&method, path, &headers, body).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
        (status, headers, value)
    }

    async fn setup_admin(server: &ConsoleServer) -> String {
        let (status, _, _) = call(
            server,
            Method::POST,
            "/api/setup/complete",
            None,
            json!({ "name": "Admin", "email": "admin@example.com", "password": "password123" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        login(server, "admin@example.com", "password123").await
    }

    async fn login(server: &ConsoleServer, email: &str, password: &str) -> String {
        let (status, headers, _) = call(
            server,
            Method::POST,
            "/api/auth/login",
            None,
            json!({ "email": email, "password": password }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cookie = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        let pair = cookie.split(';').next().unwrap();
        pair.split_once('=').unwrap().1.to_string()
    }

    async fn add_user(server: &ConsoleServer, email: &str) -> String {
        let hash = server.auth.hash_password("password123").await.unwrap();
        let user = UserRecord::new(Some("User".to_string()), email, hash, false);
        server.db.create_user(&user).unwrap();
        login(server, email, "password123").await
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@c.de"));
        assert!(!is_valid_email("@c.de"));
    }

    #[test]
    fn test_domain_validation() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("localhost"));
        assert!(is_valid_domain("*.example.com"));
        assert!(!is_valid_domain("http://example.com"));
        assert!(!is_valid_domain("example.com/path"));
        assert!(!is_valid_domain("exa mple.com"));
        assert!(!is_valid_domain("-bad.com"));
    }

    #[test]
    fn test_target_validation() {
        assert!(is_valid_target("http://localhost:3000"));
        assert!(is_valid_target("https://backend.internal"));
        assert!(is_valid_target("10.0.0.5:8080"));
        assert!(!is_valid_target("ftp://host"));
        assert!(!is_valid_target("localhost"));
        assert!(!is_valid_target("http://host :80"));
        assert!(is_valid_target("[::1]:8080"));
        assert!(!is_valid_target("::1:8080"));
        assert!(!is_valid_target("a:b:8080"));
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let server = test_server();
        let (status, _, body) = call(&server, Method::GET, "/health", None, Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (_, _, body) = call(&server, Method::GET, "/version", None, Value::Null).await;
        assert_eq!(body["name"], PKG_NAME);
    }

    #[tokio::test]
    async fn test_setup_flow() {
        let server = test_server();

        let (_, _, body) = call(&server, Method::GET, "/api/setup/status", None, Value::Null).await;
        assert_eq!(body["setupRequired"], true);
        assert!(body["timestamp"].is_string());

        let (status, headers, body) = call(
            &server,
            Method::POST,
            "/api/setup/complete",
            None,
            json!({ "name": "Admin", "email": "admin@example.com" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_FIELDS");
        assert_eq!(headers.get("X-Error-Code").unwrap(), "MISSING_FIELDS");

        let (_, _, body) = call(
            &server,
            Method::POST,
            "/api/setup/complete",
            None,
            json!({ "name": "Admin", "email": "not-an-email", "password": "password123" }),
        )
        .await;
        assert_eq!(body["code"], "INVALID_INPUT");

        let (_, _, body) = call(
            &server,
            Method::POST,
            "/api/setup/complete",
            None,
            json!({ "name": "Admin", "email": "admin@example.com", "password": "short" }),
        )
        .await;
        assert_eq!(body["code"], "INVALID_INPUT");

        let (status, _, body) = call(
            &server,
            Method::POST,
            "/api/setup/complete",
            None,
            json!({ "name": "Admin", "email": "admin@example.com", "password": "password123" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let sample = server.db.get_proxy_config(SAMPLE_CONFIG_ID).unwrap().unwrap();
        assert_eq!(sample.domain, "example.com");
        assert_eq!(sample.target_url, "http://localhost:3000");

        let (_, _, body) = call(&server, Method::GET, "/api/setup/status", None, Value::Null).await;
        assert_eq!(body["setupRequired"], false);

        let (status, _, body) = call(
            &server,
            Method::POST,
            "/api/setup/complete",
            None,
            json!({ "name": "Other", "email": "other@example.com", "password": "password123" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "SETUP_COMPLETED");
    }

    #[tokio::test]
    async fn test_login_and_session() {
        let server = test_server();
        let token = setup_admin(&server).await;

        let (status, _, body) = call(&server, Method::GET, "/api/auth/session", Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["email"], "admin@example.com");
        assert_eq!(body["isAdmin"], true);

        let (status, _, body) = call(
            &server,
            Method::POST,
            "/api/auth/login",
            None,
            json!({ "email": "admin@example.com", "password": "wrong-password" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "INVALID_CREDENTIALS");

        let (status, _, _) = call(&server, Method::GET, "/api/auth/session", None, Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, headers, _) = call(&server, Method::POST, "/api/auth/logout", None, Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.get(SET_COOKIE).unwrap().to_str().unwrap().contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_configs_require_session() {
        let server = test_server();
        let (status, _, body) = call(&server, Method::GET, "/api/configs", None, Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, _, _) = call(&server, Method::GET, "/api/configs", Some("garbage"), Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_config_crud() {
        let server = test_server();
        let token = setup_admin(&server).await;

        let (status, _, created) = call(
            &server,
            Method::POST,
            "/api/configs",
            Some(&token),
            json!({ "name": "API", "domain": "api.example.com", "targetUrl": "localhost:8080", "path": "" }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["enabled"], true);
        assert!(created["path"].is_null());
        assert_eq!(created["syncStatus"], "pending");
        assert_eq!(created["creator"]["email"], "admin@example.com");
        let id = created["id"].as_str().unwrap().to_string();

        let (_, _, list) = call(&server, Method::GET, "/api/configs", Some(&token), Value::Null).await;
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["id"], id.as_str());

        let (status, _, updated) = call(
            &server,
            Method::PUT,
            &format!("/api/configs/{}", id),
            Some(&token),
            json!({ "name": "API v2", "domain": "api.example.com", "targetUrl": "http://localhost:9090", "path": "/v2", "enabled": false }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "API v2");
        assert_eq!(updated["path"], "/v2");
        assert_eq!(updated["enabled"], false);

        let (status, _, fetched) =
            call(&server, Method::GET, &format!("/api/configs/{}", id), Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["targetUrl"], "http://localhost:9090");

        let (status, _, body) =
            call(&server, Method::DELETE, &format!("/api/configs/{}", id), Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_null());

        let (status, _, _) =
            call(&server, Method::GET, &format!("/api/configs/{}", id), Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_config_validation() {
        let server = test_server();
        let token = setup_admin(&server).await;

        let cases = [
            (json!({ "name": "", "domain": "a.com", "targetUrl": "http://x" }), "MISSING_FIELDS"),
            (json!({ "name": "n", "domain": "https://a.com", "targetUrl": "http://x" }), "INVALID_INPUT"),
            (json!({ "name": "n", "domain": "a.com", "targetUrl": "gopher://x" }), "INVALID_INPUT"),
            (json!({ "name": "n", "domain": "a.com", "targetUrl": "http://x", "path": "api" }), "INVALID_INPUT"),
        ];
        for (body, code) in cases {
            let (status, _, response) = call(&server, Method::POST, "/api/configs", Some(&token), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(response["code"], code);
        }

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {}", token).parse().unwrap());
        let response = server
            .dispatch(&Method::POST, "/api/configs", &headers, Bytes::from("{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_non_owner_is_forbidden() {
        let server = test_server();
        let admin = setup_admin(&server).await;
        let user = add_user(&server, "user@example.com").await;

        let path = format!("/api/configs/{}", SAMPLE_CONFIG_ID);
        let body = json!({ "name": "Mine", "domain": "mine.com", "targetUrl": "http://localhost:1" });

        let (status, _, _) = call(&server, Method::PUT, &path, Some(&user), body.clone()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _, _) = call(&server, Method::DELETE, &path, Some(&user), Value::Null).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Users can read everything and manage their own records
        let (status, _, _) = call(&server, Method::GET, &path, Some(&user), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, own) = call(&server, Method::POST, "/api/configs", Some(&user), body).await;
        assert_eq!(status, StatusCode::CREATED);

        // Admins can modify anything
        let own_path = format!("/api/configs/{}", own["id"].as_str().unwrap());
        let (status, _, _) = call(&server, Method::DELETE, &own_path, Some(&admin), Value::Null).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _, _) = call(&server, Method::POST, "/api/caddy/reconcile", Some(&user), Value::Null).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_update_validates_body_before_lookup() {
        let server = test_server();
        setup_admin(&server).await;
        let user = add_user(&server, "user@example.com").await;

        // Not the owner, but the empty body is reported first
        let path = format!("/api/configs/{}", SAMPLE_CONFIG_ID);
        let (status, headers, body) = call(&server, Method::PUT, &path, Some(&user), json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers.get(ERROR_CODE_HEADER).unwrap(), "MISSING_FIELDS");
        assert_eq!(body["code"], "MISSING_FIELDS");

        let (status, _, body) = call(&server, Method::PUT, "/api/configs/nope", Some(&user), json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_FIELDS");

        let bad_target = json!({ "name": "n", "domain": "a.com", "targetUrl": "ftp://x" });
        let (status, _, body) = call(&server, Method::PUT, "/api/configs/nope", Some(&user), bad_target).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_missing_config_is_not_found() {
        let server = test_server();
        let token = setup_admin(&server).await;
        let body = json!({ "name": "n", "domain": "a.com", "targetUrl": "http://x" });

        let (status, _, _) = call(&server, Method::PUT, "/api/configs/nope", Some(&token), body).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = call(&server, Method::DELETE, "/api/configs/nope", Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = call(&server, Method::POST, "/api/configs/nope/sync", Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_change_password() {
        let server = test_server();
        let token = setup_admin(&server).await;
        let path = "/api/user/change-password";

        let (status, _, _) = call(&server, Method::POST, path, None, json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, _, body) = call(&server, Method::POST, path, Some(&token), json!({ "currentPassword": "x" })).await;
        assert_eq!(body["code"], "MISSING_FIELDS");

        let (_, _, body) = call(
            &server,
            Method::POST,
            path,
            Some(&token),
            json!({ "currentPassword": "password123", "newPassword": "short" }),
        )
        .await;
        assert_eq!(body["code"], "INVALID_INPUT");

        let (status, _, body) = call(
            &server,
            Method::POST,
            path,
            Some(&token),
            json!({ "currentPassword": "wrong-password", "newPassword": "new-password" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Current password is incorrect");

        let (status, _, body) = call(
            &server,
            Method::POST,
            path,
            Some(&token),
            json!({ "currentPassword": "password123", "newPassword": "new-password" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        login(&server, "admin@example.com", "new-password").await;
    }

    #[tokio::test]
    async fn test_caddy_status_with_sync_disabled() {
        let server = test_server();
        let token = setup_admin(&server).await;

        let (status, _, body) = call(&server, Method::GET, "/api/caddy/status", Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["syncEnabled"], false);
        assert_eq!(body["configs"]["total"], 1);
        assert_eq!(body["configs"]["pending"], 1);

        let (status, _, body) =
            call(&server, Method::POST, "/api/caddy/reconcile", Some(&token), Value::Null).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "CADDY_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_dashboard_routes() {
        let server = test_server();
        for path in ["/", "/dashboard", "/configs", "/configs/new", "/settings", "/setup", "/login"] {
            let response = server.dispatch(&Method::GET, path, &HeaderMap::new(), Bytes::new()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", path);
            assert!(response.headers()[CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));
        }

        let (status, _, _) = call(&server, Method::GET, "/nope", None, Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
