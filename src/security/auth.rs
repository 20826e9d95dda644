use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use std::time::Duration;

use crate::config::CredentialsConfig;
use crate::security::token_manager::Identity;

/// Header carrying the session token, both ways.
pub const TOKEN_HEADER: &str = "x-token";
/// Response header announcing a refreshed token.
pub const NEW_TOKEN_HEADER: &str = "new-token";
/// Cookie carrying the session token.
pub const TOKEN_COOKIE: &str = "x-token";

/// Authority granted to the configured operator account.
pub const ADMIN_AUTHORITY: u64 = 1;

/// Operator credentials from configuration (after environment overrides).
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn from_config(cfg: &CredentialsConfig) -> Self {
        Self {
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        }
    }

    /// Identity for a successful login, `None` otherwise.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<Identity> {
        if username == self.username && password == self.password {
            Some(Identity::new(1, username, ADMIN_AUTHORITY))
        } else {
            None
        }
    }
}

/// Pull the session token from `x-token`, `Authorization: Bearer`, or the `x-token` cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == TOKEN_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// `Set-Cookie` value carrying a freshly issued token.
pub fn token_cookie(token: &str, max_age: Duration) -> String {
    format!(
        "{TOKEN_COOKIE}={token}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
        max_age.as_secs()
    )
}

/// `Set-Cookie` value removing the token cookie.
pub fn clear_token_cookie() -> String {
    format!("{TOKEN_COOKIE}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax")
}
