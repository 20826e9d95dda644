use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::middleware::{audit_mw, auth_mw, breaker_mw, rate_limit_mw, set_token_headers, SessionToken};
use super::response::{ApiResponse, AppError};
use crate::config::Config;
use crate::security::audit_log::AuditBatcher;
use crate::security::auth::{clear_token_cookie, Credentials, ADMIN_AUTHORITY};
use crate::security::circuit_breaker::BreakerRegistry;
use crate::security::rate_limit::RateLimiter;
use crate::security::token_manager::{Claims, Identity, TokenLifecycleManager};
use crate::store::{AuditStore, KvStore, MemoryKvStore, TracingAuditStore};

pub type SharedState = Arc<AppState>;

/// Every governance component, owned once and shared by the layers and handlers.
#[derive(Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tokens: Arc<TokenLifecycleManager>,
    pub limiter: RateLimiter,
    pub breakers: BreakerRegistry,
    pub audit: Arc<AuditBatcher>,
    pub credentials: Credentials,
}

impl AppState {
    /// Build the components from configuration. Starts the audit worker, so a
    /// tokio runtime must be running.
    pub fn new(
        config: Config,
        kv: Arc<dyn KvStore>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Result<Self> {
        let tokens = TokenLifecycleManager::new(&config.jwt, kv)
            .context("failed to initialise token manager")?;
        Ok(Self {
            tokens: Arc::new(tokens),
            limiter: RateLimiter::from_config(&config.rate_limit),
            breakers: BreakerRegistry::new(config.breaker.clone()),
            audit: Arc::new(AuditBatcher::spawn(audit_store, &config.audit)),
            credentials: Credentials::from_config(&config.credentials),
            config: Arc::new(config),
        })
    }

    /// Swap in a preconfigured token manager (custom clock or store).
    pub fn with_token_manager(mut self, tokens: TokenLifecycleManager) -> Self {
        self.tokens = Arc::new(tokens);
        self
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: Identity,
    pub token: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": crate::VERSION}))
}

async fn login_handler(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, AppError> {
    let Some(identity) = state.credentials.authenticate(&req.username, &req.password) else {
        warn!(username = %req.username, "login rejected");
        return Err(AppError::BadRequest(
            "unknown user or wrong password".to_string(),
        ));
    };

    let (token, claims) = state.tokens.issue(identity)?;
    info!(user_id = claims.identity.user_id, "user logged in");

    let mut response = ApiResponse::ok(LoginResponse {
        user: claims.identity.clone(),
        token: token.clone(),
        expires_at: claims.exp * 1000,
    })
    .into_response();
    set_token_headers(&mut response, &token, state.tokens.expires_time());
    Ok(response)
}

async fn user_info(Extension(claims): Extension<Claims>) -> ApiResponse<Claims> {
    ApiResponse::ok(claims)
}

async fn logout_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionToken>,
) -> Result<Response, AppError> {
    state.tokens.logout(&session.presented).await?;
    if let Some(refreshed) = session.refreshed.as_deref() {
        state.tokens.logout(refreshed).await?;
    }

    let mut response = ApiResponse::ok(json!({"loggedOut": true})).into_response();
    if let Ok(cookie) = HeaderValue::from_str(&clear_token_cookie()) {
        response.headers_mut().insert(SET_COOKIE, cookie);
    }
    Ok(response)
}

async fn audit_stats(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    if claims.identity.authority_id != ADMIN_AUTHORITY {
        return Err(AppError::Forbidden("insufficient authority".to_string()));
    }

    let breakers: serde_json::Map<String, serde_json::Value> = state
        .breakers
        .states()
        .into_iter()
        .map(|(name, st)| (name, json!(st)))
        .collect();

    Ok(ApiResponse::ok(json!({
        "audit": state.audit.stats(),
        "breakers": breakers,
        "rateLimitKeys": state.limiter.len(),
        "inFlightRefreshes": state.tokens.in_flight_refreshes(),
    })))
}

/// Routes reachable without a session.
pub fn public_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/base/login", post(login_handler))
}

/// Routes that require a valid session token.
pub fn private_routes() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/user/info", get(user_info))
        .route("/api/v1/user/logout", post(logout_handler))
        .route("/api/v1/audit/stats", get(audit_stats))
}

/// Put `public` and `private` behind the governance pipeline.
///
/// Private routes get authentication and audit capture. Every route gets a
/// per-route circuit breaker, and the whole router sits behind the rate limiter.
pub fn with_governance(
    public: Router<SharedState>,
    private: Router<SharedState>,
    state: SharedState,
) -> Router {
    let private = private
        .route_layer(from_fn_with_state(state.clone(), auth_mw))
        .route_layer(from_fn_with_state(state.clone(), audit_mw));

    Router::new()
        .merge(public)
        .merge(private)
        .route_layer(from_fn_with_state(state.clone(), breaker_mw))
        .layer(from_fn_with_state(state.clone(), rate_limit_mw))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn create_router(state: SharedState) -> Router {
    with_governance(public_routes(), private_routes(), state)
}

pub async fn serve(config: Config, port: u16) -> Result<()> {
    let state = Arc::new(AppState::new(
        config,
        Arc::new(MemoryKvStore::new()),
        Arc::new(TracingAuditStore),
    )?);

    let rl = &state.config.rate_limit;
    let sweeper = state.limiter.spawn_sweeper(rl.sweep_interval, rl.idle_timeout);

    let app = create_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("HTTP server stopped, flushing audit records");
    if let Some(handle) = sweeper {
        handle.abort();
    }
    if let Err(err) = state.audit.close(state.config.audit.close_timeout).await {
        warn!(error = %err, "audit batcher did not close cleanly");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
