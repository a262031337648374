//! End-to-end router tests against the in-process axum app
//!
//! Everything here runs without a live upstream: auth, validation, routing
//! failures, token counting and the admin surface.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ccproxy::config::Settings;
use ccproxy::storage::HistoryStore;
use ccproxy::{build_state, create_router};
use tower::ServiceExt;

const CONFIG: &str = r#"
    [config]
    client_api_key = "test-secret"
    big_model = "OpenAI:gpt-4o"
    middle_model = "OpenAI:gpt-4o"

    [[provider]]
    name = "OpenAI"
    base_url = "https://api.openai.com/v1"
    api_key = "sk-upstream"
    big_models = ["gpt-4o"]
    middle_models = ["gpt-4o"]
"#;

async fn test_app() -> axum::Router {
    let settings = Settings::from_toml(CONFIG).unwrap();
    let history = HistoryStore::open_in_memory().unwrap();
    let state = build_state(settings, history).await.unwrap();
    create_router(state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn messages_request(body: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["openai_api_configured"], true);
    assert_eq!(body["api_key_valid"], true);
    assert_eq!(body["client_api_key_validation"], true);
}

#[tokio::test]
async fn test_messages_requires_secret() {
    let app = test_app().await;

    let response = app
        .oneshot(messages_request(
            r#"{"model": "claude-3-opus", "max_tokens": 10, "messages": [{"role": "user", "content": "hi"}]}"#,
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn test_messages_rejects_wrong_secret() {
    let app = test_app().await;

    let response = app
        .oneshot(messages_request(
            r#"{"model": "claude-3-opus", "max_tokens": 10, "messages": [{"role": "user", "content": "hi"}]}"#,
            Some("wrong"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_messages_validation_errors() {
    let app = test_app().await;

    // Missing max_tokens fails schema validation
    let response = app
        .clone()
        .oneshot(messages_request(
            r#"{"model": "claude-3-opus", "messages": [{"role": "user", "content": "hi"}]}"#,
            Some("test-secret"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");

    // Empty messages list
    let response = app
        .oneshot(messages_request(
            r#"{"model": "claude-3-opus", "max_tokens": 10, "messages": []}"#,
            Some("test-secret"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unroutable_tier_is_404_and_recorded() {
    let app = test_app().await;

    // No provider advertises small models in this catalog
    let response = app
        .clone()
        .oneshot(messages_request(
            r#"{"model": "claude-3-5-haiku-20241022", "max_tokens": 10, "messages": [{"role": "user", "content": "hi"}]}"#,
            Some("test-secret"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "not_found_error");

    // The failure landed in history as an error row
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/history?limit=5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    let records = body["data"]["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["status"], "error");
    assert_eq!(records[0]["claimed_model"], "claude-3-5-haiku-20241022");
    assert_eq!(records[0]["stop_reason"], "error");
}

#[tokio::test]
async fn test_count_tokens() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages/count_tokens")
                .header("content-type", "application/json")
                .header("x-api-key", "test-secret")
                .body(Body::from(
                    r#"{"model": "claude-3-opus", "messages": [{"role": "user", "content": "This is a test sentence for counting."}]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let tokens = body["input_tokens"].as_u64().unwrap();
    assert!(tokens > 0);
    // 38 characters at ~4 chars per token
    assert!((5..=15).contains(&tokens));
}

#[tokio::test]
async fn test_config_get_and_update() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/config/get")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["current"]["BIG_MODEL"], "OpenAI:gpt-4o");
    assert!(body["available"]["BIG_MODELS"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("OpenAI:gpt-4o")));

    // Valid update
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/config/update")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"MIDDLE_MODEL": "gpt-4o"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["current"]["MIDDLE_MODEL"], "gpt-4o");

    // Update referencing an unknown model is rejected
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/config/update")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"BIG_MODEL": "Nowhere:model-x"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_history_record_lookup_miss() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/history/9999")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_summary_empty() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/summary")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert!(body["data"]["by_model"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_history_hour_filter_validation() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/history?limit=5&hour=3")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // hour without date is rejected
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/history?limit=5&date=2025-06-01&hour=25")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_open_access_when_no_secret_configured() {
    let config = r#"
        [[provider]]
        name = "OpenAI"
        base_url = "https://api.openai.com/v1"
        api_key = "sk-upstream"
        big_models = ["gpt-4o"]
    "#;
    let settings = Settings::from_toml(config).unwrap();
    let history = HistoryStore::open_in_memory().unwrap();
    let state = build_state(settings, history).await.unwrap();
    let app = create_router(state);

    // count_tokens works without any key
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages/count_tokens")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"model": "claude-3-opus", "messages": [{"role": "user", "content": "hi"}]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
