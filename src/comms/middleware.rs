//! Governance layers, outermost first: rate limit, circuit breaker, audit
//! capture, authentication.

use axum::body::{to_bytes, Body, Bytes, HttpBody};
use axum::extract::{ConnectInfo, FromRequestParts, MatchedPath, Request, State};
use axum::http::header::{SET_COOKIE, USER_AGENT};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::LengthLimitError;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::local_api::SharedState;
use super::response::{AppError, ErrorSummary};
use crate::security::audit_log::{AuditRecord, MAX_BODY_LOG_SIZE};
use crate::security::auth::{extract_token, token_cookie, NEW_TOKEN_HEADER, TOKEN_HEADER};
use crate::security::circuit_breaker::BreakerError;
use crate::security::token_manager::TokenError;

/// Client address: connection info, then `x-forwarded-for`, then `x-real-ip`, then 127.0.0.1.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientIp(addr.ip().to_string()));
        }

        if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
            if let Ok(s) = forwarded.to_str() {
                // First hop is the original client.
                let ip = s.split(',').next().unwrap_or(s).trim().to_string();
                if !ip.is_empty() {
                    return Ok(ClientIp(ip));
                }
            }
        }
        if let Some(real_ip) = parts.headers.get("x-real-ip") {
            if let Ok(s) = real_ip.to_str() {
                let ip = s.trim().to_string();
                if !ip.is_empty() {
                    return Ok(ClientIp(ip));
                }
            }
        }

        Ok(ClientIp("127.0.0.1".to_string()))
    }
}

/// Token presented on this request and its replacement, if one was minted.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub presented: String,
    pub refreshed: Option<String>,
}

/// User id placed on responses for the audit layer.
#[derive(Debug, Clone, Copy)]
pub struct AuditUser(pub u64);

pub async fn rate_limit_mw(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    req: Request,
    next: Next,
) -> Response {
    if !state.limiter.allow(&ip) {
        warn!(ip = %ip, path = %req.uri().path(), "rate limit exceeded");
        return AppError::RateLimited.into_response();
    }
    next.run(req).await
}

/// Runs the rest of the stack under the breaker for the matched route.
/// Only 5xx responses count as failures.
pub async fn breaker_mw(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let breaker = state.breakers.for_route(&route);

    let outcome = breaker
        .execute_classified(
            || async move { Ok::<_, Infallible>(next.run(req).await) },
            |result| matches!(result, Ok(response) if response.status().is_server_error()),
        )
        .await;

    match outcome {
        Ok(response) => response,
        Err(BreakerError::Inner(never)) => match never {},
        Err(rejection) => {
            debug!(route = %route, error = %rejection, "request rejected by circuit breaker");
            AppError::Unavailable(rejection.to_string()).into_response()
        }
    }
}

/// Largest request body the audit layer will buffer. Bigger uploads get a 413.
pub const MAX_BUFFERED_BODY: usize = 4 * MAX_BODY_LOG_SIZE;

/// Placeholder logged for response bodies that are streamed through unread.
const UNCAPTURED_BODY: &[u8] = b"(body not captured)";

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_length_limit(err: &axum::Error) -> bool {
    std::error::Error::source(err).is_some_and(|source| source.is::<LengthLimitError>())
}

/// Records mutating requests once the inner stack has answered.
///
/// Request bodies are buffered up to [`MAX_BUFFERED_BODY`]. Response bodies
/// are buffered only when their size is known and within the same cap;
/// anything else is passed through and logged as not captured.
pub async fn audit_mw(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    req: Request,
    next: Next,
) -> Response {
    if matches!(*req.method(), Method::GET | Method::OPTIONS) {
        return next.run(req).await;
    }

    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();
    let agent = header_value(&parts.headers, USER_AGENT.as_str()).unwrap_or_default();
    let request_id =
        header_value(&parts.headers, "x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let trace_id = header_value(&parts.headers, "x-trace-id").unwrap_or_default();

    let (request_body, response) = match to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => {
            let response = next
                .run(Request::from_parts(parts, Body::from(bytes.clone())))
                .await;
            (bytes, response)
        }
        Err(err) if is_length_limit(&err) => {
            warn!(path = %path, limit = MAX_BUFFERED_BODY, "request body too large");
            let response = AppError::PayloadTooLarge(MAX_BUFFERED_BODY).into_response();
            (Bytes::new(), response)
        }
        Err(err) => {
            return AppError::BadRequest(format!("failed to read request body: {err}"))
                .into_response()
        }
    };

    let (parts, body) = response.into_parts();
    let bounded = body
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= MAX_BUFFERED_BODY as u64);
    let (response_body, body) = if bounded {
        match to_bytes(body, MAX_BUFFERED_BODY).await {
            Ok(bytes) => (bytes.clone(), Body::from(bytes)),
            Err(err) => {
                return AppError::Internal(format!("failed to read response body: {err}"))
                    .into_response()
            }
        }
    } else {
        (Bytes::from_static(UNCAPTURED_BODY), body)
    };

    let mut record = AuditRecord::new(method, path).with_bodies(&request_body, &response_body);
    record.user_id = parts.extensions.get::<AuditUser>().map(|u| u.0);
    record.ip = ip;
    record.status = parts.status.as_u16();
    record.latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    record.agent = agent;
    record.request_id = request_id;
    record.trace_id = trace_id;
    record.error_msg = parts.extensions.get::<ErrorSummary>().map(|e| e.0.clone());
    state.audit.push(record);

    Response::from_parts(parts, body)
}

/// Verifies the session token, refreshing it inside its buffer window.
///
/// Handlers behind this layer can extract `Extension<Claims>` and
/// `Extension<SessionToken>`.
pub async fn auth_mw(State(state): State<SharedState>, mut req: Request, next: Next) -> Response {
    let Some(token) = extract_token(req.headers()) else {
        return AppError::Unauthorized("not logged in or token missing".to_string())
            .into_response();
    };

    let mut claims = match state.tokens.verify(&token) {
        Ok(claims) => claims,
        Err(err) => return AppError::from(err).into_response(),
    };
    if state.tokens.is_revoked(&token).await {
        return AppError::from(TokenError::Revoked).into_response();
    }

    let mut refreshed = None;
    if state.tokens.needs_refresh(&claims) {
        match state.tokens.refresh(&token, &claims).await {
            Ok((new_token, new_claims)) => {
                if new_token != token {
                    refreshed = Some(new_token);
                    claims = new_claims;
                }
            }
            Err(TokenError::Revoked) => return AppError::from(TokenError::Revoked).into_response(),
            // The presented token is still valid; keep serving with it.
            Err(err) => warn!(error = %err, "token refresh failed, keeping current token"),
        }
    }

    let user_id = claims.identity.user_id;
    req.extensions_mut().insert(claims);
    req.extensions_mut().insert(SessionToken {
        presented: token,
        refreshed: refreshed.clone(),
    });

    let mut response = next.run(req).await;
    if let Some(new_token) = refreshed {
        set_token_headers(&mut response, &new_token, state.tokens.expires_time());
    }
    response.extensions_mut().insert(AuditUser(user_id));
    response
}

/// Hand a newly issued token back to the client in headers and a cookie.
pub fn set_token_headers(response: &mut Response, token: &str, max_age: std::time::Duration) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(token) {
        headers.insert(NEW_TOKEN_HEADER, value.clone());
        headers.insert(TOKEN_HEADER, value);
        headers.insert(
            "access-control-expose-headers",
            HeaderValue::from_static("new-token, x-token"),
        );
    }
    if let Ok(cookie) = HeaderValue::from_str(&token_cookie(token, max_age)) {
        headers.append(SET_COOKIE, cookie);
    }
}
