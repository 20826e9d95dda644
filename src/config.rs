use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::utils::duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub signing_key: String,
    #[serde(with = "duration::text")]
    pub expires_time: Duration,
    /// How long before expiry a token is silently replaced.
    #[serde(with = "duration::text")]
    pub buffer_time: Duration,
    pub issuer: String,
    /// Treat revocation-store errors as "revoked" instead of "not revoked".
    pub revocation_fail_closed: bool,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            expires_time: Duration::from_secs(7 * 86_400),
            buffer_time: Duration::from_secs(86_400),
            issuer: "gatekeep".to_string(),
            revocation_fail_closed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Refill rate in tokens per second.
    pub qps: u32,
    /// Bucket size.
    pub burst: u32,
    #[serde(with = "duration::text")]
    pub idle_timeout: Duration,
    #[serde(with = "duration::text")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            qps: 20,
            burst: 40,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// One breaker per route template instead of a single global one.
    pub per_route: bool,
    pub min_requests: u32,
    pub failure_ratio: f64,
    /// Rolling window for closed-state counts. Zero keeps counts until a transition.
    #[serde(with = "duration::text")]
    pub interval: Duration,
    #[serde(with = "duration::text")]
    pub open_timeout: Duration,
    /// Probe calls admitted while half-open.
    pub max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            per_route: true,
            min_requests: 5,
            failure_ratio: 0.6,
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            max_probes: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub capacity: usize,
    pub batch_size: usize,
    #[serde(with = "duration::text")]
    pub flush_interval: Duration,
    #[serde(with = "duration::text")]
    pub close_timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
            close_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub audit: AuditConfig,
    pub credentials: CredentialsConfig,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        let mut cfg: Config = serde_json::from_str(&raw).context("parsing JSON config")?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("GATEKEEP_SIGNING_KEY") {
            self.jwt.signing_key = key;
        }
        if let Ok(user) = std::env::var("GATEKEEP_USERNAME") {
            self.credentials.username = user;
        }
        if let Ok(pass) = std::env::var("GATEKEEP_PASSWORD") {
            self.credentials.password = pass;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.jwt.signing_key.is_empty() {
            bail!("jwt.signing_key must be set (or GATEKEEP_SIGNING_KEY)");
        }
        if self.jwt.expires_time.is_zero() {
            bail!("jwt.expires_time must be positive");
        }
        if self.jwt.buffer_time >= self.jwt.expires_time {
            bail!("jwt.buffer_time must be shorter than jwt.expires_time");
        }
        if self.rate_limit.enabled && self.rate_limit.qps == 0 {
            bail!("rate_limit.qps must be positive when rate limiting is enabled");
        }
        if self.rate_limit.enabled && self.rate_limit.burst == 0 {
            bail!("rate_limit.burst must be positive when rate limiting is enabled");
        }
        if self.rate_limit.enabled && self.rate_limit.sweep_interval.is_zero() {
            bail!("rate_limit.sweep_interval must be positive when rate limiting is enabled");
        }
        if !(self.breaker.failure_ratio > 0.0 && self.breaker.failure_ratio <= 1.0) {
            bail!("breaker.failure_ratio must be in (0, 1]");
        }
        if self.breaker.max_probes == 0 {
            bail!("breaker.max_probes must be at least 1");
        }
        if self.audit.capacity == 0 || self.audit.batch_size == 0 {
            bail!("audit.capacity and audit.batch_size must be positive");
        }
        if self.audit.flush_interval.is_zero() {
            bail!("audit.flush_interval must be positive");
        }
        Ok(())
    }
}
