use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::security::token_refresh::SingleFlight;
use crate::store::{KvStore, StoreError};
use crate::utils::clock::{Clock, SystemClock};

const REVOCATION_PREFIX: &str = "jwt_black:";

/// Who a token speaks for. Carried unchanged across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable per-login session id.
    pub uuid: Uuid,
    pub user_id: u64,
    pub username: String,
    pub nick_name: String,
    pub authority_id: u64,
}

impl Identity {
    pub fn new(user_id: u64, username: impl Into<String>, authority_id: u64) -> Self {
        let username = username.into();
        Self {
            uuid: Uuid::new_v4(),
            user_id,
            nick_name: username.clone(),
            username,
            authority_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    #[serde(flatten)]
    pub identity: Identity,
    /// Seconds before `exp` during which the token is replaced.
    pub buffer_time: i64,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not trusted: {0}")]
    Unauthorized(String),
    #[error("token has been revoked")]
    Revoked,
    #[error("failed to sign token: {0}")]
    Signing(String),
    #[error("revocation store error: {0}")]
    Store(String),
}

impl From<StoreError> for TokenError {
    fn from(err: StoreError) -> Self {
        TokenError::Store(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => TokenError::Malformed,
            ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Unauthorized(err.to_string()),
        }
    }
}

/// What to answer when the revocation store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RevocationPolicy {
    /// Report "not revoked". A store outage keeps sessions alive, and a token
    /// revoked during the outage stays usable until the store recovers or the
    /// token expires.
    #[default]
    FailOpen,
    /// Report "revoked". A store outage logs every caller out.
    FailClosed,
}

type RefreshOutcome = Result<(String, Claims), TokenError>;

/// Issues, verifies, refreshes and revokes HS256 session tokens.
pub struct TokenLifecycleManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    expires_time: Duration,
    buffer_time: Duration,
    issuer: String,
    policy: RevocationPolicy,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    refreshes: SingleFlight<RefreshOutcome>,
    minted: AtomicU64,
}

impl fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("expires_time", &self.expires_time)
            .field("buffer_time", &self.buffer_time)
            .field("issuer", &self.issuer)
            .field("policy", &self.policy)
            .field("in_flight_refreshes", &self.refreshes.in_flight())
            .finish_non_exhaustive()
    }
}

impl TokenLifecycleManager {
    pub fn new(config: &JwtConfig, kv: Arc<dyn KvStore>) -> Result<Self, TokenError> {
        if config.signing_key.is_empty() {
            return Err(TokenError::Signing("signing key is empty".to_string()));
        }
        let secret = config.signing_key.as_bytes();

        let mut validation = Validation::new(Algorithm::HS256);
        // exp and nbf are checked against the injected clock.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.issuer.as_str()]);

        let policy = if config.revocation_fail_closed {
            RevocationPolicy::FailClosed
        } else {
            RevocationPolicy::FailOpen
        };

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            expires_time: config.expires_time,
            buffer_time: config.buffer_time,
            issuer: config.issuer.clone(),
            policy,
            kv,
            clock: Arc::new(SystemClock),
            refreshes: SingleFlight::new(),
            minted: AtomicU64::new(0),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn expires_time(&self) -> Duration {
        self.expires_time
    }

    pub fn policy(&self) -> RevocationPolicy {
        self.policy
    }

    fn claims_for(&self, identity: Identity) -> Claims {
        let now = self.clock.now().timestamp();
        Claims {
            identity,
            buffer_time: secs(self.buffer_time),
            iat: now,
            nbf: now - 1,
            exp: now + secs(self.expires_time),
            iss: self.issuer.clone(),
            aud: self.issuer.clone(),
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        self.minted.fetch_add(1, Ordering::Relaxed);
        Ok(token)
    }

    pub fn issue(&self, identity: Identity) -> Result<(String, Claims), TokenError> {
        let claims = self.claims_for(identity);
        let token = self.sign(&claims)?;
        debug!(user_id = claims.identity.user_id, exp = claims.exp, "token issued");
        Ok((token, claims))
    }

    /// Check signature, issuer, audience and validity window. Revocation is not consulted.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        let claims = data.claims;
        let now = self.clock.now().timestamp();
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        if now < claims.nbf {
            return Err(TokenError::Unauthorized("token is not valid yet".to_string()));
        }
        Ok(claims)
    }

    /// Whether `token` is on the revocation list.
    ///
    /// Store errors are resolved by the configured [`RevocationPolicy`]. The
    /// default is fail-open: an unreachable store must not sign out every
    /// user, at the cost of honouring revocations only while the store is up.
    pub async fn is_revoked(&self, token: &str) -> bool {
        match self.kv.get(&revocation_key(token)).await {
            Ok(entry) => entry.is_some(),
            Err(err) => {
                let revoked = self.policy == RevocationPolicy::FailClosed;
                warn!(error = %err, policy = ?self.policy, revoked, "revocation lookup failed");
                revoked
            }
        }
    }

    pub fn needs_refresh(&self, claims: &Claims) -> bool {
        claims.exp - self.clock.now().timestamp() < claims.buffer_time
    }

    /// Replace a token that has entered its buffer window.
    ///
    /// Concurrent refreshes of the same token share one execution and one
    /// result. A token outside the window is returned unchanged.
    pub async fn refresh(&self, old_token: &str, claims: &Claims) -> RefreshOutcome {
        if !self.needs_refresh(claims) {
            return Ok((old_token.to_string(), claims.clone()));
        }
        self.refreshes
            .run(old_token, || self.mint_replacement(old_token, claims))
            .await
    }

    async fn mint_replacement(&self, old_token: &str, claims: &Claims) -> RefreshOutcome {
        // An unreachable store fails the refresh; the caller keeps the old token.
        if self.kv.get(&revocation_key(old_token)).await?.is_some() {
            return Err(TokenError::Revoked);
        }
        let fresh = self.claims_for(claims.identity.clone());
        let token = self.sign(&fresh)?;
        info!(
            user_id = fresh.identity.user_id,
            old_exp = claims.exp,
            new_exp = fresh.exp,
            "token refreshed"
        );
        Ok((token, fresh))
    }

    /// Put `token` on the revocation list for `ttl`. A zero ttl does nothing.
    pub async fn revoke(&self, token: &str, ttl: Duration) -> Result<(), TokenError> {
        if ttl.is_zero() {
            return Ok(());
        }
        self.kv.set(&revocation_key(token), "revoked", ttl).await?;
        debug!(ttl_secs = ttl.as_secs(), "token revoked");
        Ok(())
    }

    /// Revoke `token` for the rest of its lifetime. Tokens that no longer verify are ignored.
    pub async fn logout(&self, token: &str) -> Result<(), TokenError> {
        let claims = match self.verify(token) {
            Ok(claims) => claims,
            Err(err) => {
                debug!(error = %err, "logout with unusable token ignored");
                return Ok(());
            }
        };
        let remaining = claims.exp - self.clock.now().timestamp();
        self.revoke(token, Duration::from_secs(remaining.max(0) as u64))
            .await?;
        info!(user_id = claims.identity.user_id, "user logged out");
        Ok(())
    }

    pub fn in_flight_refreshes(&self) -> usize {
        self.refreshes.in_flight()
    }

    /// Tokens signed since construction.
    pub fn mint_count(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }
}

fn revocation_key(token: &str) -> String {
    format!("{REVOCATION_PREFIX}{token}")
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
