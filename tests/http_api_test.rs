//! Integration tests against the HTTP route table, driven in-process via
//! `tower::ServiceExt::oneshot` rather than a bound TCP listener.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use citrine::capability::CapabilityReport;
use citrine::catalogue::{shipped::shipped_models, Catalogue};
use citrine::config::GatewayConfig;
use citrine::http::{build_router, GatewayContext};
use citrine::router::Router;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceExt;

fn test_context(api_key: Option<&str>) -> Arc<GatewayContext> {
    let mut cfg = GatewayConfig::default();
    cfg.api_key = api_key.map(str::to_string);
    let caps = CapabilityReport::permissive_for_tests();
    let catalogue = Catalogue::build(shipped_models(), &cfg, &caps);
    Arc::new(GatewayContext {
        catalogue: RwLock::new(catalogue),
        router: Router::new(cfg.max_loaded_models),
        config: cfg,
        capabilities: caps,
        log_path: std::env::temp_dir().join("citrine-test.log"),
        started_at: std::time::Instant::now(),
    })
}

#[tokio::test]
async fn health_reports_ok_with_no_loaded_models() {
    let app = build_router(test_context(None));
    let resp = app
        .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["loaded_models"], serde_json::json!([]));
}

#[tokio::test]
async fn live_is_unauthenticated_even_on_a_protected_prefix() {
    let app = build_router(test_context(Some("secret")));
    let resp = app
        .oneshot(Request::builder().uri("/v1/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    // /live has no auth-bypassing logic of its own; the bearer layer wraps
    // the whole nested router, so a key configured anywhere still requires it.
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_route_rejects_missing_bearer_token() {
    let app = build_router(test_context(Some("secret")));
    let resp = app
        .oneshot(Request::builder().uri("/api/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_route_accepts_correct_bearer_token() {
    let app = build_router(test_context(Some("secret")));
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/models")
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn models_are_mounted_identically_under_all_four_prefixes() {
    for prefix in ["/api/v0", "/api/v1", "/v0", "/v1"] {
        let app = build_router(test_context(None));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("{prefix}/models"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "prefix {prefix} did not mount /models");
    }
}

#[tokio::test]
async fn get_unknown_model_returns_404_with_gateway_error_shape() {
    let app = build_router(test_context(None));
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/models/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["type"], "model_not_found");
}

#[tokio::test]
async fn chat_completions_without_model_field_is_an_invalid_request() {
    let app = build_router(test_context(None));
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_route_falls_back_to_404() {
    let app = build_router(test_context(None));
    let resp = app
        .oneshot(Request::builder().uri("/no/such/route").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unload_of_a_never_loaded_model_is_a_model_not_loaded_error() {
    let app = build_router(test_context(None));
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/unload")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model_name":"Qwen2.5-Coder-3B-Instruct-GGUF"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}
