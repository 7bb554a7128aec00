use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `caddy.admin_url`
pub const ENV_CADDY_ADMIN_URL: &str = "CADDY_ADMIN_URL";
/// Environment variable that overrides `auth.secret`
pub const ENV_SECRET: &str = "CADDY_UI_SECRET";
/// Upper bound for session lifetime (ten years)
pub const MAX_TOKEN_EXPIRY_HOURS: i64 = 24 * 365 * 10;

/// Global configuration for the console
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// SQLite storage
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Session and password settings
    #[serde(default)]
    pub auth: AuthSettings,

    /// Caddy admin API settings
    #[serde(default)]
    pub caddy: CaddySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Console port (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.bind, self.port, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            tls: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite file, created with its parent directory if missing
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// JWT signing secret. A random one is generated at startup if unset,
    /// which invalidates sessions on every restart.
    pub secret: Option<String>,

    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: i64,

    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Set the Secure flag on the session cookie
    #[serde(default)]
    pub cookie_secure: bool,

    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret: None,
            token_expiry_hours: default_token_expiry_hours(),
            cookie_name: default_cookie_name(),
            cookie_secure: false,
            bcrypt_cost: default_bcrypt_cost(),
            min_password_length: default_min_password_length(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaddySettings {
    /// Base URL of the Caddy admin endpoint
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Name of the HTTP server block that holds managed routes
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Listen addresses used when the server block has to be created
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Push changes to Caddy. When false, records are only stored.
    #[serde(default = "default_true")]
    pub sync_enabled: bool,

    /// Background reconcile interval (0 disables the loop)
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

impl CaddySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        if self.reconcile_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.reconcile_interval_secs))
        }
    }
}

impl Default for CaddySettings {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            server_name: default_server_name(),
            listen: default_listen(),
            request_timeout_secs: default_request_timeout(),
            sync_enabled: true,
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/caddy-ui.db")
}

fn default_token_expiry_hours() -> i64 {
    24
}

/// RFC 6265 cookie-name token
fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b))
}

fn default_cookie_name() -> String {
    "caddy_ui_session".to_string()
}

fn default_bcrypt_cost() -> u32 {
    12
}

fn default_min_password_length() -> usize {
    8
}

fn default_admin_url() -> String {
    "http://localhost:2019".to_string()
}

fn default_server_name() -> String {
    "srv0".to_string()
}

fn default_listen() -> Vec<String> {
    vec![":80".to_string(), ":443".to_string()]
}

fn default_request_timeout() -> u64 {
    10
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load from a TOML file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Like `load`, but a missing file means built-in defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in `load`)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_CADDY_ADMIN_URL).filter(|v| !v.is_empty()) {
            self.caddy.admin_url = url;
        }
        if let Some(secret) = lookup(ENV_SECRET).filter(|v| !v.is_empty()) {
            self.auth.secret = Some(secret);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }
        if !(4..=31).contains(&self.auth.bcrypt_cost) {
            errors.push(format!("auth.bcrypt_cost must be between 4 and 31, got {}", self.auth.bcrypt_cost));
        }
        if !(1..=MAX_TOKEN_EXPIRY_HOURS).contains(&self.auth.token_expiry_hours) {
            errors.push(format!(
                "auth.token_expiry_hours must be between 1 and {}, got {}",
                MAX_TOKEN_EXPIRY_HOURS, self.auth.token_expiry_hours
            ));
        }
        if !is_cookie_name(&self.auth.cookie_name) {
            errors.push(format!(
                "auth.cookie_name '{}' must be a non-empty cookie token (no spaces, separators or control characters)",
                self.auth.cookie_name
            ));
        }
        if self.caddy.server_name.trim().is_empty() {
            errors.push("caddy.server_name must not be empty".to_string());
        }
        if let Err(e) = reqwest::Url::parse(&self.caddy.admin_url) {
            errors.push(format!("caddy.admin_url '{}' is invalid: {}", self.caddy.admin_url, e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
