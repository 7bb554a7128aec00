use crate::config::AuthSettings;
use crate::db::{ProxyConfigRecord, UserRecord};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub token_expiry_hours: i64,
    pub cookie_name: String,
    pub cookie_secure: bool,
    pub cookie_http_only: bool,
    pub cookie_same_site: String,
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: uuid::Uuid::new_v4().to_string(),
            token_expiry_hours: 24,
            cookie_name: "caddy_ui_session".to_string(),
            cookie_secure: false,
            cookie_http_only: true,
            cookie_same_site: "Lax".to_string(),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl From<&AuthSettings> for AuthConfig {
    fn from(settings: &AuthSettings) -> Self {
        Self {
            secret: settings
                .secret
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            token_expiry_hours: settings.token_expiry_hours,
            cookie_name: settings.cookie_name.clone(),
            cookie_secure: settings.cookie_secure,
            bcrypt_cost: settings.bcrypt_cost,
            ..Default::default()
        }
    }
}

/// The authenticated user behind a request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "id")]
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub is_admin: bool,
}

impl Session {
    /// Admins may change anything; everyone else only what they created
    pub fn can_modify(&self, config: &ProxyConfigRecord) -> bool {
        self.is_admin || config.creator_id == self.user_id
    }
}

impl From<Claims> for Session {
    fn from(claims: Claims) -> Self {
        Self {
            is_admin: claims.role == ROLE_ADMIN,
            user_id: claims.sub,
            email: claims.email,
            name: claims.name,
        }
    }
}

impl From<&UserRecord> for Session {
    fn from(user: &UserRecord) -> Self {
        Self {
            user_id: user.id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            is_admin: user.is_admin,
        }
    }
}

#[derive(Clone)]
pub struct AuthManager {
    config: Arc<AuthConfig>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthManager {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config: Arc::new(config),
            encoding_key,
            decoding_key,
        }
    }

    pub fn create_token(&self, session: &Session) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.config.token_expiry_hours);

        let claims = Claims {
            sub: session.user_id.clone(),
            email: session.email.clone(),
            name: session.name.clone(),
            role: if session.is_admin { ROLE_ADMIN } else { ROLE_USER }.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
    }

    pub fn verify_token(&self, token: &str) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
        let validation = Validation::default();
        decode::<Claims>(token, &self.decoding_key, &validation)
    }

    /// Resolve a session from the Cookie and Authorization header values
    pub fn session_from_headers(&self, cookie: Option<&str>, authorization: Option<&str>) -> Option<Session> {
        let token = cookie
            .and_then(|c| self.extract_token_from_cookie(c))
            .or_else(|| authorization.and_then(|a| self.extract_token_from_header(a)))?;

        self.verify_token(&token).ok().map(|data| Session::from(data.claims))
    }

    pub fn create_session_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}",
            self.config.cookie_name,
            token,
            self.config.token_expiry_hours * 3600
        );

        if self.config.cookie_http_only {
            cookie.push_str("; HttpOnly");
        }

        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }

        cookie.push_str(&format!("; SameSite={}", self.config.cookie_same_site));

        cookie
    }

    pub fn create_logout_cookie(&self) -> String {
        format!(
            "{}=; Path=/; Max-Age=0; HttpOnly; SameSite={}",
            self.config.cookie_name,
            self.config.cookie_same_site
        )
    }

    pub fn extract_token_from_cookie(&self, cookie_header: &str) -> Option<String> {
        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie.strip_prefix(&format!("{}=", self.config.cookie_name)) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    pub fn extract_token_from_header(&self, auth_header: &str) -> Option<String> {
        auth_header.strip_prefix("Bearer ").map(|s| s.to_string())
    }

    /// Hash a password on the blocking pool
    pub async fn hash_password(&self, password: &str) -> anyhow::Result<String> {
        let password = password.to_string();
        let cost = self.config.bcrypt_cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;
        Ok(hash)
    }

    /// Verify a password on the blocking pool. Malformed hashes never match.
    pub async fn verify_password(&self, password: &str, hash: &str) -> anyhow::Result<bool> {
        let password = password.to_string();
        let hash = hash.to_string();
        let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false)).await?;
        Ok(matches)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}
