use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use gatekeep::comms::local_api::{create_router, AppState, SharedState};
use gatekeep::config::Config;
use gatekeep::store::{MemoryAuditStore, MemoryKvStore};

fn test_config() -> Config {
    let mut config = Config::default();
    config.jwt.signing_key = "integration-test-key".to_string();
    config.jwt.expires_time = Duration::from_secs(600);
    config.jwt.buffer_time = Duration::from_secs(120);
    config
}

fn test_app(config: Config) -> (Router, SharedState) {
    let state = Arc::new(
        AppState::new(
            config,
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryAuditStore::new()),
        )
        .unwrap(),
    );
    (create_router(state.clone()), state)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn login_request(username: &str, password: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/base/login")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"username": username, "password": password}).to_string(),
        ))
        .unwrap()
}

async fn login(app: &Router) -> String {
    let (status, _, body) = send(app, login_request("admin", "admin")).await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["token"].as_str().unwrap().to_string()
}

fn get_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-token", token)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = test_app(test_config());
    let (status, _, body) = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_login_issues_token() {
    let (app, _) = test_app(test_config());
    let (status, headers, body) = send(&app, login_request("admin", "admin")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    let token = body["data"]["token"].as_str().unwrap();
    assert_eq!(body["data"]["user"]["username"], "admin");
    assert_eq!(headers["new-token"], token);
    let cookie = headers["set-cookie"].to_str().unwrap();
    assert!(cookie.starts_with(&format!("x-token={token};")));
    assert!(cookie.contains("HttpOnly"));
}

#[tokio::test]
async fn test_login_with_wrong_password() {
    let (app, _) = test_app(test_config());
    let (status, _, body) = send(&app, login_request("admin", "nope")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 7);
}

#[tokio::test]
async fn test_private_route_requires_token() {
    let (app, _) = test_app(test_config());
    let (status, _, body) = send(
        &app,
        Request::builder()
            .uri("/api/v1/user/info")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 1003);
}

#[tokio::test]
async fn test_private_route_rejects_garbage_token() {
    let (app, _) = test_app(test_config());
    let (status, _, body) = send(&app, get_with_token("/api/v1/user/info", "abc.def")).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 1003);
}

#[tokio::test]
async fn test_user_info_with_header_bearer_and_cookie() {
    let (app, _) = test_app(test_config());
    let token = login(&app).await;

    let (status, _, body) = send(&app, get_with_token("/api/v1/user/info", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["username"], "admin");
    assert_eq!(body["data"]["iss"], "gatekeep");

    let bearer = Request::builder()
        .uri("/api/v1/user/info")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, bearer).await.0, StatusCode::OK);

    let cookie = Request::builder()
        .uri("/api/v1/user/info")
        .header("cookie", format!("x-token={token}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, cookie).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_logout_revokes_token() {
    let (app, _) = test_app(test_config());
    let token = login(&app).await;

    let logout = Request::builder()
        .method("POST")
        .uri("/api/v1/user/logout")
        .header("x-token", &token)
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, logout).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers["set-cookie"].to_str().unwrap().contains("Max-Age=0"));

    let (status, _, body) = send(&app, get_with_token("/api/v1/user/info", &token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 1003);
}

#[tokio::test]
async fn test_rate_limit_per_client_ip() {
    let mut config = test_config();
    config.rate_limit.qps = 1;
    config.rate_limit.burst = 2;
    let (app, _) = test_app(config);

    let health_from = |ip: &str| {
        Request::builder()
            .uri("/health")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(send(&app, health_from("203.0.113.1")).await.0, StatusCode::OK);
    assert_eq!(send(&app, health_from("203.0.113.1")).await.0, StatusCode::OK);

    let (status, _, body) = send(&app, health_from("203.0.113.1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], 7);

    assert_eq!(send(&app, health_from("203.0.113.2")).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_disabled() {
    let mut config = test_config();
    config.rate_limit.enabled = false;
    config.rate_limit.qps = 1;
    config.rate_limit.burst = 1;
    let (app, state) = test_app(config);

    for _ in 0..10 {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        assert_eq!(send(&app, req).await.0, StatusCode::OK);
    }
    assert!(state.limiter.is_empty());
}

#[tokio::test]
async fn test_audit_stats_for_admin() {
    let (app, _) = test_app(test_config());
    let token = login(&app).await;

    let (status, _, body) = send(&app, get_with_token("/api/v1/audit/stats", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["audit"]["dropped"], 0);
    assert_eq!(body["data"]["inFlightRefreshes"], 0);
    assert!(body["data"]["breakers"].is_object());
}
