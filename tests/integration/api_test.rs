use super::common::{self, FakeAgent};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use switchboard::adapters::health_handler::HealthHandler;
use switchboard::adapters::metrics_handler::{MetricsCollector, MetricsHandler};
use tower::util::ServiceExt;

async fn app() -> Router {
    let weather = FakeAgent::new("weather")
        .with_skill("forecast", &["weather"])
        .with_chunks(&["Sunny"])
        .spawn()
        .await;
    let host = common::start_host(&common::settings(&[&weather])).await;

    let health_handler = Arc::new(HealthHandler::new(host.store().clone(), 1));
    let metrics_handler = Arc::new(MetricsHandler::new(Arc::new(MetricsCollector::new().unwrap())));
    switchboard::create_app(host, health_handler, metrics_handler)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_discovered_agents() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["agents"], "1/1");

    let response = app
        .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_agent_roster() {
    let response = app()
        .await
        .oneshot(Request::get("/api/agents").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"][0]["name"], "weather");
    assert_eq!(body["data"][0]["description"], "weather agent");
}

#[tokio::test]
async fn test_message_streams_events() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(post_json("/api/sessions", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let session_id = body_json(response).await["data"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/messages",
            json!({ "session_id": session_id, "text": "weather in Oslo?" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("event: dispatched"));
    assert!(body.contains("event: chunk"));
    assert!(body.contains("Sunny"));
    assert_eq!(body.matches("event: finished").count(), 1);

    let response = app
        .oneshot(
            Request::get(format!("/api/sessions/{}", session_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["turns"][0]["outcome"]["kind"], "response");
}

#[tokio::test]
async fn test_unmatched_message_is_unprocessable() {
    let response = app()
        .await
        .oneshot(post_json("/api/messages", json!({ "text": "sing me a song" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(post_json("/api/sessions/missing/cancel", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(
            Request::delete("/api/sessions/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
